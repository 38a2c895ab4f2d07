//! Error taxonomy of the control plane
//!
//! `VpnError` is what a failed connection rests on: it is stored inside
//! `ConnectionState::Error` and therefore `Clone + Eq`.

use kuza_network::ResolveError;
use thiserror::Error;

/// Control plane errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VpnError {
    #[error("VPN permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid tunnel configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to start tunnel: {0}")]
    StartFailed(String),

    #[error("Failed to stop tunnel: {0}")]
    StopFailed(String),

    #[error("Connection lost")]
    ConnectionLost,

    /// Per-domain and non-fatal; logged by the compiler, never a resting state.
    #[error("Resolution failure: {0}")]
    ResolutionFailure(#[from] ResolveError),

    #[error("Session controller is shut down")]
    ControllerClosed,
}

impl VpnError {
    /// Short machine-friendly kind, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            VpnError::PermissionDenied(_) => "permission_denied",
            VpnError::InvalidConfig(_) => "invalid_config",
            VpnError::StartFailed(_) => "start_failed",
            VpnError::StopFailed(_) => "stop_failed",
            VpnError::ConnectionLost => "connection_lost",
            VpnError::ResolutionFailure(_) => "resolution_failure",
            VpnError::ControllerClosed => "controller_closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_reason() {
        let err = VpnError::StartFailed("adapter returned false".into());
        assert_eq!(err.to_string(), "Failed to start tunnel: adapter returned false");
        assert_eq!(err.kind(), "start_failed");
    }

    #[test]
    fn test_from_resolve_error() {
        let err: VpnError = ResolveError::NoAddresses("a.example".into()).into();
        assert_eq!(err.kind(), "resolution_failure");
    }
}
