//! Telemetry Poller
//!
//! Samples the tunnel engine's byte counters on a fixed cadence while the
//! session is connected and republishes the latest sample through a
//! `watch` channel (last write wins, no smoothing).
//!
//! Arming and disarming are driven by the session controller on state
//! transitions. Each arm starts a new epoch; a sample read under an older
//! epoch is dropped, so nothing published after `disarm` returns can come
//! from the previous connection.

use crate::adapter::NativeTunnelAdapter;
use crate::model::BandwidthSample;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

/// Bandwidth sampler tied to the connected state
pub struct TelemetryPoller {
    adapter: Arc<dyn NativeTunnelAdapter>,
    interval: Duration,
    sample_tx: Arc<watch::Sender<Option<BandwidthSample>>>,
    epoch: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl TelemetryPoller {
    pub fn new(adapter: Arc<dyn NativeTunnelAdapter>, interval: Duration) -> Self {
        let (sample_tx, _) = watch::channel(None);

        Self {
            adapter,
            interval,
            sample_tx: Arc::new(sample_tx),
            epoch: Arc::new(AtomicU64::new(0)),
            task: None,
        }
    }

    /// Start sampling. No-op when already armed.
    pub fn arm(&mut self) {
        if self.is_armed() {
            return;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let adapter = self.adapter.clone();
        let sample_tx = self.sample_tx.clone();
        let current = self.epoch.clone();
        let period = self.interval;

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match adapter.get_bandwidth_stats().await {
                    Ok(sample) => {
                        sample_tx.send_if_modified(|latest| {
                            if current.load(Ordering::SeqCst) != epoch {
                                return false;
                            }
                            *latest = Some(sample);
                            true
                        });
                        trace!(total = sample.total_bytes, "Bandwidth sampled");
                    }
                    Err(e) => {
                        debug!(error = %e, "Bandwidth read failed, keeping previous sample");
                    }
                }
            }
        }));

        debug!(interval_ms = self.interval.as_millis() as u64, "Telemetry armed");
    }

    /// Stop sampling immediately. The latest sample is kept.
    pub fn disarm(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Telemetry disarmed");
        }
    }

    /// Drop the latest sample
    pub fn clear(&self) {
        self.sample_tx.send_replace(None);
    }

    pub fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn latest(&self) -> Option<BandwidthSample> {
        *self.sample_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<BandwidthSample>> {
        self.sample_tx.subscribe()
    }
}

impl Drop for TelemetryPoller {
    fn drop(&mut self) {
        self.disarm();
    }
}
