//! Tunnel engine boundary
//!
//! The control plane never touches packets or key exchange; it drives a
//! [`NativeTunnelAdapter`] and reacts to what it reports. Platforms differ
//! in what they can do (per-app filtering, app enumeration), which each
//! adapter advertises through [`AdapterCapabilities`] instead of the
//! business logic branching on a platform flag.

mod simulated;
mod wg_quick;

pub use simulated::{SimulatedAdapter, StartBehavior};
pub use wg_quick::{parse_transfer, WgQuickAdapter};

use crate::config::TunnelConfig;
use crate::model::{AppIdentity, BandwidthSample, TunnelStatus};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// What an adapter supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterCapabilities {
    /// `start` honors the app filter id list
    pub per_app_filter: bool,
    /// `get_installed_apps` returns the real installed set
    pub app_enumeration: bool,
    /// `get_bandwidth_stats` returns real counters
    pub bandwidth_stats: bool,
}

/// Adapter call failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("Permission error: {0}")]
    Permission(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Not supported by this adapter: {0}")]
    Unsupported(&'static str),

    #[error("Malformed engine output: {0}")]
    Malformed(String),
}

/// Asynchronous, fallible interface to the platform tunnel engine.
///
/// Only the session controller calls `start` and `stop`; pollers use
/// `get_status` and `get_bandwidth_stats`.
#[async_trait]
pub trait NativeTunnelAdapter: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> AdapterCapabilities;

    async fn request_permission(&self) -> Result<bool, AdapterError>;

    /// Start the tunnel. An empty `app_filter_ids` means no app filter.
    async fn start(&self, config: &TunnelConfig, app_filter_ids: &[String]) -> Result<bool, AdapterError>;

    async fn stop(&self) -> Result<bool, AdapterError>;

    async fn get_status(&self) -> Result<TunnelStatus, AdapterError>;

    async fn get_installed_apps(&self) -> Result<Vec<AppIdentity>, AdapterError>;

    async fn get_bandwidth_stats(&self) -> Result<BandwidthSample, AdapterError>;

    /// Pushed status notifications, for engines that have them.
    fn status_events(&self) -> Option<broadcast::Receiver<TunnelStatus>> {
        None
    }
}
