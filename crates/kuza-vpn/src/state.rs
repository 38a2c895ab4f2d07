//! Connection state machine
//!
//! The transition table is a pure function of (current state, event).
//! The session controller owns the single `ConnectionState` value and
//! performs the boundary calls a transition asks for.

use crate::error::VpnError;
use crate::model::TunnelStatus;
use std::fmt;

/// Connection state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Tunnel is down
    #[default]
    Disconnected,
    /// Permission, rule compilation and start in progress
    Connecting,
    /// Tunnel engine affirmed the tunnel is up
    Connected,
    /// Stop in progress
    Disconnecting,
    /// Tunnel is down and the last attempt or connection failed
    Error(VpnError),
}

impl ConnectionState {
    /// Check if the tunnel is up
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Disconnected or failed: a connect may start from here
    pub fn is_idle(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error(_))
    }

    /// The recorded failure, if any
    pub fn error(&self) -> Option<&VpnError> {
        match self {
            ConnectionState::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Get a human-readable description
    pub fn description(&self) -> String {
        match self {
            ConnectionState::Disconnected => "Disconnected".to_string(),
            ConnectionState::Connecting => "Connecting...".to_string(),
            ConnectionState::Connected => "Connected".to_string(),
            ConnectionState::Disconnecting => "Disconnecting...".to_string(),
            ConnectionState::Error(e) => format!("Error: {}", e),
        }
    }

    /// Decide what `event` does in this state.
    pub fn on(&self, event: ControlEvent) -> Transition {
        use ConnectionState as S;
        use ControlEvent as E;

        match (self, event) {
            (S::Disconnected | S::Error(_), E::Connect) => Transition::BeginConnect,
            (S::Disconnected | S::Error(_), _) => Transition::Ignore,

            // Wait for the start outcome, then stop
            (S::Connecting, E::Disconnect) => Transition::Defer,
            (S::Connecting, E::Reported(TunnelStatus::Connected)) => Transition::Enter(S::Connected),
            (S::Connecting, _) => Transition::Ignore,

            (S::Connected, E::Disconnect) => Transition::BeginDisconnect,
            (S::Connected, E::Reported(TunnelStatus::Disconnected)) => {
                Transition::Enter(S::Error(VpnError::ConnectionLost))
            }
            (S::Connected, _) => Transition::Ignore,

            (S::Disconnecting, _) => Transition::Ignore,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Input to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Connect,
    Disconnect,
    /// Status reported by the tunnel engine (pushed or polled)
    Reported(TunnelStatus),
}

/// What the controller must do for an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// No-op in this state
    Ignore,
    /// Enter `Connecting` and run the connect sequence
    BeginConnect,
    /// Enter `Disconnecting` and stop the tunnel
    BeginDisconnect,
    /// Re-evaluate once the in-flight boundary call has resolved
    Defer,
    /// Move directly to a new state
    Enter(ConnectionState),
}
