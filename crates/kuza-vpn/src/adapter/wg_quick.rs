//! Desktop tunnel engine driven through `wg-quick` and `wg`
//!
//! Routes by address only: the app filter list is not honored and
//! installed apps cannot be enumerated.

use super::{AdapterCapabilities, AdapterError, NativeTunnelAdapter};
use crate::config::TunnelConfig;
use crate::model::{AppIdentity, BandwidthSample, TunnelStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Sum the per-peer counters of `wg show <iface> transfer`.
///
/// Each line is `<peer key>\t<rx bytes>\t<tx bytes>`. Returns `(rx, tx)`.
pub fn parse_transfer(output: &str) -> Result<(u64, u64), AdapterError> {
    let mut rx_total = 0u64;
    let mut tx_total = 0u64;

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [_, rx, tx] = fields.as_slice() else {
            return Err(AdapterError::Malformed(line.to_string()));
        };

        let rx: u64 = rx.parse().map_err(|_| AdapterError::Malformed(line.to_string()))?;
        let tx: u64 = tx.parse().map_err(|_| AdapterError::Malformed(line.to_string()))?;

        rx_total = rx_total.saturating_add(rx);
        tx_total = tx_total.saturating_add(tx);
    }

    Ok((rx_total, tx_total))
}

/// `wg-quick` adapter
pub struct WgQuickAdapter {
    interface: String,
    config_dir: PathBuf,
    wg_quick_bin: String,
    wg_bin: String,
}

impl WgQuickAdapter {
    /// Adapter managing `<config_dir>/<interface>.conf`
    pub fn new(interface: impl Into<String>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            interface: interface.into(),
            config_dir: config_dir.into(),
            wg_quick_bin: "wg-quick".to_string(),
            wg_bin: "wg".to_string(),
        }
    }

    /// Override the `wg-quick` and `wg` executables
    pub fn with_binaries(mut self, wg_quick: impl Into<String>, wg: impl Into<String>) -> Self {
        self.wg_quick_bin = wg_quick.into();
        self.wg_bin = wg.into();
        self
    }

    /// Path of the rendered configuration file
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.conf", self.interface))
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<Output, AdapterError> {
        debug!(program, ?args, "Running tunnel command");

        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AdapterError::Platform(format!("failed to execute {}: {}", program, e)))
    }

    async fn write_config(&self, config: &TunnelConfig) -> Result<PathBuf, AdapterError> {
        let path = self.config_path();

        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .map_err(|e| AdapterError::Platform(e.to_string()))?;
        tokio::fs::write(&path, config.to_wg_quick())
            .await
            .map_err(|e| AdapterError::Platform(e.to_string()))?;
        restrict_permissions(&path).await?;

        Ok(path)
    }

    fn log_failure(&self, action: &str, output: &Output) {
        error!(
            interface = %self.interface,
            action,
            code = output.status.code().unwrap_or(-1),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "wg-quick failed"
        );
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), AdapterError> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| AdapterError::Platform(e.to_string()))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), AdapterError> {
    Ok(())
}

#[async_trait]
impl NativeTunnelAdapter for WgQuickAdapter {
    fn name(&self) -> &'static str {
        "wg-quick"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            per_app_filter: false,
            app_enumeration: false,
            bandwidth_stats: true,
        }
    }

    /// Permission here means being able to write the interface config.
    async fn request_permission(&self) -> Result<bool, AdapterError> {
        match tokio::fs::create_dir_all(&self.config_dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                warn!(dir = %self.config_dir.display(), "Config directory not writable");
                Ok(false)
            }
            Err(e) => Err(AdapterError::Permission(e.to_string())),
        }
    }

    async fn start(&self, config: &TunnelConfig, app_filter_ids: &[String]) -> Result<bool, AdapterError> {
        if !app_filter_ids.is_empty() {
            debug!(apps = app_filter_ids.len(), "App filter not supported, routing by address");
        }

        let path = self.write_config(config).await?;
        let path_arg = path.to_string_lossy().into_owned();
        let output = self.run(&self.wg_quick_bin, &["up", path_arg.as_str()]).await?;

        if !output.status.success() {
            self.log_failure("up", &output);
            return Ok(false);
        }

        info!(interface = %self.interface, endpoint = %config.endpoint, "wg-quick up");
        Ok(true)
    }

    async fn stop(&self) -> Result<bool, AdapterError> {
        let path = self.config_path();
        let path_arg = path.to_string_lossy().into_owned();
        let output = self.run(&self.wg_quick_bin, &["down", path_arg.as_str()]).await?;

        if !output.status.success() {
            self.log_failure("down", &output);
            return Ok(false);
        }

        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(error = %e, "Could not remove interface config");
        }

        info!(interface = %self.interface, "wg-quick down");
        Ok(true)
    }

    async fn get_status(&self) -> Result<TunnelStatus, AdapterError> {
        let output = self.run(&self.wg_bin, &["show", self.interface.as_str()]).await?;

        if !output.status.success() {
            return Ok(TunnelStatus::Disconnected);
        }

        // An interface without a handshake yet is still coming up
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("latest handshake") {
            Ok(TunnelStatus::Connected)
        } else {
            Ok(TunnelStatus::Connecting)
        }
    }

    async fn get_installed_apps(&self) -> Result<Vec<AppIdentity>, AdapterError> {
        Err(AdapterError::Unsupported("app enumeration"))
    }

    async fn get_bandwidth_stats(&self) -> Result<BandwidthSample, AdapterError> {
        let output = self.run(&self.wg_bin, &["show", self.interface.as_str(), "transfer"]).await?;

        if !output.status.success() {
            return Err(AdapterError::Platform(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let (rx, tx) = parse_transfer(&String::from_utf8_lossy(&output.stdout))?;
        Ok(BandwidthSample::new(rx, tx, Utc::now()))
    }
}
