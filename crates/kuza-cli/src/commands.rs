//! Subcommand implementations

use crate::EngineKind;
use anyhow::{bail, Context, Result};
use kuza_vpn::adapter::{SimulatedAdapter, WgQuickAdapter};
use kuza_vpn::{
    convert_package_id, AppSelectionRegistry, ClientSettings, ControllerConfig, KeyPair,
    NativeTunnelAdapter, PrivateKey, RoutingRuleCompiler, SelectionMode, SessionController,
    TunnelStatus,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tunnel engine selection from the command line
pub struct Engine {
    pub kind: EngineKind,
    pub interface: String,
    pub wg_dir: PathBuf,
}

impl Engine {
    fn adapter(&self) -> Arc<dyn NativeTunnelAdapter> {
        match self.kind {
            EngineKind::Simulated => Arc::new(SimulatedAdapter::new()),
            EngineKind::WgQuick => Arc::new(WgQuickAdapter::new(self.interface.clone(), self.wg_dir.clone())),
        }
    }
}

/// Settings, engine, registry and compiler for one invocation
struct Session {
    settings: ClientSettings,
    adapter: Arc<dyn NativeTunnelAdapter>,
    registry: Arc<AppSelectionRegistry>,
    compiler: Arc<RoutingRuleCompiler>,
}

impl Session {
    async fn open(config: &Path, engine: &Engine, mode: Option<SelectionMode>, apps: &[String]) -> Result<Self> {
        let settings = ClientSettings::from_file(config)
            .with_context(|| format!("loading settings from {}", config.display()))?;
        let adapter = engine.adapter();
        let catalog = &settings.catalog;

        let registry = Arc::new(AppSelectionRegistry::new(
            mode.unwrap_or(catalog.initial_mode),
            catalog.include_system_apps,
        ));
        registry.refresh_catalog(adapter.as_ref(), catalog.platform).await;

        if apps.is_empty() {
            registry.select_defaults(&catalog.default_selected).await;
        } else {
            let ids: BTreeSet<String> = apps
                .iter()
                .map(|id| convert_package_id(id, catalog.platform))
                .collect();
            for id in &ids {
                registry.toggle(id).await.with_context(|| format!("selecting {}", id))?;
            }
        }

        let resolver = settings
            .routing
            .build_resolver()
            .context("building address resolver")?;
        let compiler = Arc::new(RoutingRuleCompiler::new(
            Arc::new(settings.routing.domains.clone()),
            Arc::new(resolver),
        ));

        Ok(Self {
            settings,
            adapter,
            registry,
            compiler,
        })
    }
}

pub fn init(config: &Path, force: bool) -> Result<()> {
    if config.exists() && !force {
        bail!("{} already exists, pass --force to overwrite", config.display());
    }

    let settings = ClientSettings::default_config();
    settings.to_file(config)?;

    let public = PrivateKey::from_base64(&settings.tunnel.client_private_key)?.public_key();
    println!("Wrote {}", config.display());
    println!("Client public key: {}", public);
    println!("Set tunnel.endpoint and tunnel.server_public_key before connecting.");
    Ok(())
}

pub fn keygen() {
    let pair = KeyPair::generate();
    println!("PrivateKey = {}", pair.private.to_base64());
    println!("PublicKey = {}", pair.public);
}

pub async fn apps(config: &Path, engine: &Engine) -> Result<()> {
    let session = Session::open(config, engine, None, &[]).await?;

    for app in session.registry.catalog().await {
        let mark = if session.registry.is_selected(&app.id).await { "x" } else { " " };
        println!("[{}] {:<16} {}", mark, app.display_name, app.id);
    }
    Ok(())
}

pub async fn plan(config: &Path, engine: &Engine, mode: Option<SelectionMode>, apps: &[String]) -> Result<()> {
    let session = Session::open(config, engine, mode, apps).await?;
    let (mode, selection) = session.registry.snapshot().await;
    let plan = session.compiler.compile(mode, &selection).await;

    println!("Mode: {}", plan.mode);
    if plan.app_filter_ids.is_empty() {
        println!("Apps: all");
    } else {
        println!("Apps: {}", plan.app_filter_ids.join(", "));
    }
    if plan.used_fallback {
        println!("Selection resolved to nothing, routing popular services instead");
    }

    println!("Allowed ranges:");
    for range in plan.rule.allowed_ranges() {
        println!("  {}", range);
    }
    for domain in &plan.unresolved_domains {
        println!("Unresolved: {}", domain);
    }
    Ok(())
}

pub async fn connect(
    config: &Path,
    engine: &Engine,
    mode: Option<SelectionMode>,
    apps: &[String],
    seconds: Option<u64>,
) -> Result<()> {
    let session = Session::open(config, engine, mode, apps).await?;
    let tunnel = session.settings.tunnel.to_tunnel_config()?;
    let limit = session.settings.catalog.bandwidth_limit_bytes;

    let controller = SessionController::spawn(
        session.adapter.clone(),
        session.registry.clone(),
        session.compiler.clone(),
        tunnel,
        ControllerConfig::from(&session.settings.polling),
    );

    let state = controller.connect().await?;
    println!("{}", state);
    if !state.is_connected() {
        controller.shutdown().await?;
        bail!("connect failed: {}", state);
    }

    let mut states = controller.subscribe();
    let mut samples = controller.subscribe_bandwidth();

    let deadline = async {
        match seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                debug!("Connection time elapsed");
                break;
            }
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                println!("{}", state);
                if state.is_idle() {
                    break;
                }
            }
            changed = samples.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = *samples.borrow_and_update();
                if let Some(sample) = latest {
                    println!("{} ({:.1}% of allowance)", sample.format(), sample.usage_ratio(limit) * 100.0);
                }
            }
        }
    }

    let state = controller.disconnect().await?;
    println!("{}", state);
    controller.shutdown().await?;

    if let Some(e) = state.error() {
        bail!("session ended with error: {}", e);
    }
    Ok(())
}

pub async fn status(engine: &Engine) -> Result<()> {
    let adapter = engine.adapter();
    let status = adapter.get_status().await.context("reading tunnel status")?;
    println!("Engine: {}", adapter.name());
    println!("Status: {}", status);

    if status != TunnelStatus::Disconnected {
        match adapter.get_bandwidth_stats().await {
            Ok(sample) => println!("{}", sample.format()),
            Err(e) => warn!(error = %e, "Bandwidth counters unavailable"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulated() -> Engine {
        Engine {
            kind: EngineKind::Simulated,
            interface: "kuza0".to_string(),
            wg_dir: PathBuf::from("/tmp"),
        }
    }

    /// Settings file that never touches live DNS
    fn offline_settings(dir: &Path) -> PathBuf {
        let path = dir.join("kuza.toml");
        let mut settings = ClientSettings::default_config();
        settings.routing.resolver.live_lookup = false;
        settings.polling.telemetry_interval_ms = 50;
        settings.to_file(&path).unwrap();
        path
    }

    #[test]
    fn test_init_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kuza.toml");

        init(&path, false).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();

        assert!(init(&path, false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);

        init(&path, true).unwrap();
        assert_ne!(std::fs::read_to_string(&path).unwrap(), first);
        assert!(ClientSettings::from_file(&path).is_ok());
    }

    #[tokio::test]
    async fn test_session_selects_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = offline_settings(dir.path());

        let session = Session::open(&path, &simulated(), None, &[]).await.unwrap();
        let (mode, selection) = session.registry.snapshot().await;

        assert_eq!(mode, SelectionMode::EncryptAll);
        assert_eq!(selection.len(), 4);
        assert!(selection.contains("com.whatsapp"));
    }

    #[tokio::test]
    async fn test_session_converts_app_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = offline_settings(dir.path());
        let apps = vec!["net.whatsapp.WhatsApp".to_string(), "com.whatsapp".to_string()];

        let session = Session::open(&path, &simulated(), Some(SelectionMode::Custom), &apps)
            .await
            .unwrap();
        let (mode, selection) = session.registry.snapshot().await;
        assert_eq!(mode, SelectionMode::Custom);
        assert_eq!(selection.ids(), vec!["com.whatsapp"]);

        let plan = session.compiler.compile(mode, &selection).await;
        assert!(!plan.rule.is_empty());
        assert!(!plan.used_fallback);
    }

    #[tokio::test]
    async fn test_unknown_app_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = offline_settings(dir.path());
        let apps = vec!["org.example.nothing".to_string()];

        assert!(Session::open(&path, &simulated(), None, &apps).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_for_a_moment() {
        let dir = tempfile::tempdir().unwrap();
        let path = offline_settings(dir.path());

        connect(&path, &simulated(), Some(SelectionMode::EncryptAll), &[], Some(0))
            .await
            .unwrap();
    }
}
