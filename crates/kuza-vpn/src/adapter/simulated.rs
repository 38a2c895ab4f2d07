//! In-process tunnel engine for development and tests
//!
//! Grants permission, accepts any configuration and produces synthetic
//! counters that grow with connected time. Failures can be scripted.

use super::{AdapterCapabilities, AdapterError, NativeTunnelAdapter};
use crate::catalog::{mock_catalog, Platform};
use crate::config::{TunnelConfig, WireConfig};
use crate::model::{AppIdentity, BandwidthSample, TunnelStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

/// Synthetic download rate (bytes per millisecond)
const RX_PER_MS: u64 = 48;
/// Synthetic upload rate (bytes per millisecond)
const TX_PER_MS: u64 = 16;

/// Scripted outcome of `start`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartBehavior {
    Succeed,
    ReturnFalse,
    Fail(String),
}

struct SimState {
    status: TunnelStatus,
    permission: bool,
    start_behavior: StartBehavior,
    stop_succeeds: bool,
    stats_fail: bool,
    connected_at: Option<Instant>,
    last_wire: Option<WireConfig>,
    last_filter: Vec<String>,
    start_calls: usize,
    stop_calls: usize,
    catalog: Vec<AppIdentity>,
}

/// Simulated tunnel engine
pub struct SimulatedAdapter {
    state: Mutex<SimState>,
    events: broadcast::Sender<TunnelStatus>,
    per_app_filter: bool,
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAdapter {
    /// Adapter that succeeds at everything, with the built-in catalog
    /// plus one system app.
    pub fn new() -> Self {
        let mut catalog = mock_catalog(Platform::Android);
        catalog.push(AppIdentity::new("com.android.settings", "Settings").system());

        let (events, _) = broadcast::channel(16);

        Self {
            state: Mutex::new(SimState {
                status: TunnelStatus::Disconnected,
                permission: true,
                start_behavior: StartBehavior::Succeed,
                stop_succeeds: true,
                stats_fail: false,
                connected_at: None,
                last_wire: None,
                last_filter: Vec::new(),
                start_calls: 0,
                stop_calls: 0,
                catalog,
            }),
            events,
            per_app_filter: true,
        }
    }

    /// Replace the reported installed apps
    pub fn with_catalog(self, catalog: Vec<AppIdentity>) -> Self {
        self.lock().catalog = catalog;
        self
    }

    /// Behave like an engine that can only route by address
    pub fn without_app_filter(mut self) -> Self {
        self.per_app_filter = false;
        self
    }

    pub fn deny_permission(&self) {
        self.lock().permission = false;
    }

    pub fn set_start_behavior(&self, behavior: StartBehavior) {
        self.lock().start_behavior = behavior;
    }

    /// Make `stop` return false
    pub fn fail_stop(&self) {
        self.lock().stop_succeeds = false;
    }

    pub fn set_stats_failure(&self, fail: bool) {
        self.lock().stats_fail = fail;
    }

    /// Drop the tunnel as if the network went away, and push the status.
    pub fn drop_connection(&self) {
        {
            let mut state = self.lock();
            state.status = TunnelStatus::Disconnected;
            state.connected_at = None;
        }
        info!("Simulated connection drop");
        let _ = self.events.send(TunnelStatus::Disconnected);
    }

    /// Wire form of the last started configuration
    pub fn last_wire_config(&self) -> Option<WireConfig> {
        self.lock().last_wire.clone()
    }

    pub fn last_app_filter(&self) -> Vec<String> {
        self.lock().last_filter.clone()
    }

    pub fn start_calls(&self) -> usize {
        self.lock().start_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.lock().stop_calls
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl NativeTunnelAdapter for SimulatedAdapter {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            per_app_filter: self.per_app_filter,
            app_enumeration: true,
            bandwidth_stats: true,
        }
    }

    async fn request_permission(&self) -> Result<bool, AdapterError> {
        Ok(self.lock().permission)
    }

    async fn start(&self, config: &TunnelConfig, app_filter_ids: &[String]) -> Result<bool, AdapterError> {
        let mut state = self.lock();
        state.start_calls += 1;
        state.last_wire = Some(config.to_wire());
        state.last_filter = app_filter_ids.to_vec();

        debug!(
            endpoint = %config.endpoint,
            ranges = config.allowed_ranges.len(),
            apps = app_filter_ids.len(),
            "Simulated start"
        );

        match state.start_behavior.clone() {
            StartBehavior::Succeed => {
                state.status = TunnelStatus::Connected;
                state.connected_at = Some(Instant::now());
                Ok(true)
            }
            StartBehavior::ReturnFalse => Ok(false),
            StartBehavior::Fail(reason) => Err(AdapterError::Platform(reason)),
        }
    }

    async fn stop(&self) -> Result<bool, AdapterError> {
        let mut state = self.lock();
        state.stop_calls += 1;

        if !state.stop_succeeds {
            return Ok(false);
        }

        state.status = TunnelStatus::Disconnected;
        state.connected_at = None;
        Ok(true)
    }

    async fn get_status(&self) -> Result<TunnelStatus, AdapterError> {
        Ok(self.lock().status)
    }

    async fn get_installed_apps(&self) -> Result<Vec<AppIdentity>, AdapterError> {
        Ok(self.lock().catalog.clone())
    }

    async fn get_bandwidth_stats(&self) -> Result<BandwidthSample, AdapterError> {
        let state = self.lock();

        if state.stats_fail {
            return Err(AdapterError::Platform("counters unavailable".to_string()));
        }

        let elapsed_ms = state
            .connected_at
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0);

        Ok(BandwidthSample::new(
            elapsed_ms * RX_PER_MS,
            elapsed_ms * TX_PER_MS,
            Utc::now(),
        ))
    }

    fn status_events(&self) -> Option<broadcast::Receiver<TunnelStatus>> {
        Some(self.events.subscribe())
    }
}
