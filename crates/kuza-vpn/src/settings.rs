//! Client Settings
//!
//! Everything the control plane needs at startup, loaded from a TOML or
//! JSON file: the tunnel profile, routing tables, resolver tuning,
//! polling cadence and catalog defaults.
//!
//! ```toml
//! [tunnel]
//! endpoint = "vpn.example.net:51820"
//! server_public_key = "..."
//! client_private_key = "..."
//!
//! [polling]
//! status_interval_ms = 1000
//! ```
//!
//! Every section except `[tunnel]` may be omitted; the built-in tables
//! are used in its place.

use crate::catalog::Platform;
use crate::config::{default_client_address, default_dns_servers, ConfigError, Endpoint, TunnelConfig};
use crate::keys::{PrivateKey, PublicKey};
use crate::model::{SelectionMode, DEFAULT_BANDWIDTH_LIMIT};
use crate::routing::DomainRoutingTable;
use ipnet::IpNet;
use kuza_network::{AddressResolver, DnsConfig, ResolveError, StaticAddressTable};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Server and client parameters of the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelProfile {
    /// Server endpoint (`host:port`)
    pub endpoint: Endpoint,
    /// Server public key (base64)
    pub server_public_key: String,
    /// Client private key (base64)
    pub client_private_key: String,
    /// Client address inside the tunnel
    #[serde(default = "default_client_address")]
    pub client_address: IpNet,
    /// DNS servers used inside the tunnel
    #[serde(default = "default_dns_servers")]
    pub dns: Vec<IpAddr>,
}

impl TunnelProfile {
    /// Parse keys and build the base (full-route) tunnel configuration.
    pub fn to_tunnel_config(&self) -> Result<TunnelConfig, ConfigError> {
        let server_public_key = PublicKey::from_base64(&self.server_public_key)?;
        let client_private_key = PrivateKey::from_base64(&self.client_private_key)?;

        let mut config = TunnelConfig::new(self.endpoint.clone(), server_public_key, client_private_key);
        config.client_address = self.client_address;
        config.dns_servers = self.dns.clone();

        config.validate()?;
        Ok(config)
    }
}

/// Resolver tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverSettings {
    /// Fall back to live DNS for domains missing from the address table
    #[serde(default = "default_true")]
    pub live_lookup: bool,
    /// System resolver configuration instead of Cloudflare
    #[serde(default = "default_true")]
    pub use_system_dns: bool,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_negative_ttl")]
    pub negative_cache_ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_cache_entries: usize,
    #[serde(default = "default_lookup_timeout")]
    pub timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_negative_ttl() -> u64 {
    60
}

fn default_max_entries() -> usize {
    10000
}

fn default_lookup_timeout() -> u64 {
    5000
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            live_lookup: true,
            use_system_dns: true,
            cache_ttl_secs: default_cache_ttl(),
            negative_cache_ttl_secs: default_negative_ttl(),
            max_cache_entries: default_max_entries(),
            timeout_ms: default_lookup_timeout(),
        }
    }
}

impl ResolverSettings {
    pub fn to_dns_config(&self) -> DnsConfig {
        DnsConfig {
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            negative_cache_ttl: Duration::from_secs(self.negative_cache_ttl_secs),
            max_cache_entries: self.max_cache_entries,
            use_system_dns: self.use_system_dns,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

/// Routing tables and resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSettings {
    /// App id → domains, and the popular-services fallback
    #[serde(default = "DomainRoutingTable::bootstrap")]
    pub domains: DomainRoutingTable,
    /// Domain suffix → addresses, consulted before DNS
    #[serde(default = "StaticAddressTable::bootstrap")]
    pub addresses: StaticAddressTable,
    #[serde(default)]
    pub resolver: ResolverSettings,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            domains: DomainRoutingTable::bootstrap(),
            addresses: StaticAddressTable::bootstrap(),
            resolver: ResolverSettings::default(),
        }
    }
}

impl RoutingSettings {
    /// Build the address resolver these settings describe.
    pub fn build_resolver(&self) -> Result<AddressResolver, SettingsError> {
        if self.resolver.live_lookup {
            Ok(AddressResolver::with_hickory(
                self.addresses.clone(),
                self.resolver.to_dns_config(),
            )?)
        } else {
            Ok(AddressResolver::static_only(self.addresses.clone()))
        }
    }
}

/// Polling cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingSettings {
    /// Status reconciliation interval
    #[serde(default = "default_interval")]
    pub status_interval_ms: u64,
    /// Bandwidth sampling interval while connected
    #[serde(default = "default_interval")]
    pub telemetry_interval_ms: u64,
}

fn default_interval() -> u64 {
    1000
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            status_interval_ms: default_interval(),
            telemetry_interval_ms: default_interval(),
        }
    }
}

impl PollingSettings {
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms.max(1))
    }
}

/// Catalog and selection defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSettings {
    /// Platform whose ids the built-in catalog uses
    #[serde(default = "default_platform")]
    pub platform: Platform,
    /// Display names selected after the first catalog load
    #[serde(default = "default_selected")]
    pub default_selected: Vec<String>,
    /// Show system apps in the catalog
    #[serde(default)]
    pub include_system_apps: bool,
    #[serde(default)]
    pub initial_mode: SelectionMode,
    /// Data allowance used for usage display
    #[serde(default = "default_bandwidth_limit")]
    pub bandwidth_limit_bytes: u64,
}

fn default_platform() -> Platform {
    Platform::Android
}

fn default_selected() -> Vec<String> {
    ["Snapchat", "WhatsApp", "Instagram", "TikTok"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_bandwidth_limit() -> u64 {
    DEFAULT_BANDWIDTH_LIMIT
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            platform: default_platform(),
            default_selected: default_selected(),
            include_system_apps: false,
            initial_mode: SelectionMode::default(),
            bandwidth_limit_bytes: DEFAULT_BANDWIDTH_LIMIT,
        }
    }
}

/// Complete settings file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    pub tunnel: TunnelProfile,
    #[serde(default)]
    pub polling: PollingSettings,
    #[serde(default)]
    pub catalog: CatalogSettings,
    #[serde(default)]
    pub routing: RoutingSettings,
}

impl ClientSettings {
    /// Load from a file, picking the format by extension (`.json` or TOML)
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::Io(format!("{}: {}", path.display(), e)))?;

        let settings = if is_json(path) {
            Self::from_json(&content)?
        } else {
            Self::from_toml(&content)?
        };

        info!(
            path = %path.display(),
            endpoint = %settings.tunnel.endpoint,
            apps = settings.routing.domains.apps.len(),
            "Settings loaded"
        );
        Ok(settings)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        toml::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        serde_json::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))
    }

    /// Settings with a fresh client key and placeholder server values
    pub fn default_config() -> Self {
        Self::with_client_key(&PrivateKey::generate())
    }

    /// Settings with placeholder server values and the given client key
    pub fn with_client_key(client_key: &PrivateKey) -> Self {
        debug!(public_key = %client_key.public_key(), "Building default settings");
        Self {
            tunnel: TunnelProfile {
                endpoint: Endpoint::new("vpn.kuza.example", crate::config::DEFAULT_PORT),
                server_public_key: "kc+AVMZdL1aviDkogj9vIDzFnvTFoQwfPVDAGUWJals=".to_string(),
                client_private_key: client_key.to_base64(),
                client_address: default_client_address(),
                dns: default_dns_servers(),
            },
            polling: PollingSettings::default(),
            catalog: CatalogSettings::default(),
            routing: RoutingSettings::default(),
        }
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(|e| SettingsError::Serialize(e.to_string()))
    }

    /// Export as JSON
    pub fn to_json(&self) -> Result<String, SettingsError> {
        serde_json::to_string_pretty(self).map_err(|e| SettingsError::Serialize(e.to_string()))
    }

    /// Write to a file readable only by the owner, in the format its
    /// extension names.
    pub fn to_file(&self, path: &Path) -> Result<(), SettingsError> {
        let content = if is_json(path) { self.to_json()? } else { self.to_toml()? };

        std::fs::write(path, content)
            .map_err(|e| SettingsError::Io(format!("{}: {}", path.display(), e)))?;
        restrict_permissions(path)?;

        info!(path = %path.display(), "Settings written");
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), SettingsError> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| SettingsError::Io(format!("{}: {}", path.display(), e)))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), SettingsError> {
    Ok(())
}

/// Settings errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialize error: {0}")]
    Serialize(String),

    #[error("Invalid tunnel profile: {0}")]
    Invalid(#[from] ConfigError),

    #[error("Resolver setup failed: {0}")]
    Resolver(#[from] ResolveError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[tunnel]
endpoint = "203.0.113.10:51820"
server_public_key = "kc+AVMZdL1aviDkogj9vIDzFnvTFoQwfPVDAGUWJals="
client_private_key = "xC3Aqo5iq+wIZtfeP63c0lWeIOdMOJpQm7uW/2Z2blU="
"#;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let settings = ClientSettings::from_toml(MINIMAL).unwrap();

        assert_eq!(settings.tunnel.endpoint, Endpoint::new("203.0.113.10", 51820));
        assert_eq!(settings.polling, PollingSettings::default());
        assert_eq!(settings.catalog.default_selected.len(), 4);
        assert_eq!(settings.routing.domains, DomainRoutingTable::bootstrap());
        assert_eq!(settings.routing.addresses.len(), 10);
        assert_eq!(settings.catalog.bandwidth_limit_bytes, 1040 * 1024 * 1024);
    }

    #[test]
    fn test_tunnel_config_from_profile() {
        let settings = ClientSettings::from_toml(MINIMAL).unwrap();
        let config = settings.tunnel.to_tunnel_config().unwrap();

        assert_eq!(config.client_address.to_string(), "10.0.0.2/24");
        assert_eq!(config.allowed_ranges.len(), 2);
    }

    #[test]
    fn test_bad_key_is_rejected() {
        let mut settings = ClientSettings::from_toml(MINIMAL).unwrap();
        settings.tunnel.client_private_key = "short".to_string();

        assert!(settings.tunnel.to_tunnel_config().is_err());
    }

    #[test]
    fn test_overrides() {
        let content = format!(
            "{MINIMAL}
[polling]
status_interval_ms = 250

[catalog]
platform = \"ios\"
initial_mode = \"custom\"
default_selected = [\"Spotify\"]

[routing.domains]
fallback = [\"popular.example\"]

[routing.domains.apps]
\"app.a\" = [\"a.example\"]

[routing.addresses]
\"a.example\" = [\"93.0.0.1\"]
"
        );
        let settings = ClientSettings::from_toml(&content).unwrap();

        assert_eq!(settings.polling.status_interval(), Duration::from_millis(250));
        assert_eq!(settings.polling.telemetry_interval(), Duration::from_secs(1));
        assert_eq!(settings.catalog.platform, Platform::Ios);
        assert_eq!(settings.catalog.initial_mode, SelectionMode::Custom);
        assert_eq!(settings.routing.domains.domains_for("app.a"), ["a.example".to_string()]);
        assert!(settings.routing.addresses.lookup("a.example").is_some());
    }

    #[test]
    fn test_default_config_round_trips() {
        let settings = ClientSettings::default_config();

        let toml = settings.to_toml().unwrap();
        assert_eq!(ClientSettings::from_toml(&toml).unwrap(), settings);

        let json = settings.to_json().unwrap();
        assert_eq!(ClientSettings::from_json(&json).unwrap(), settings);

        assert!(settings.tunnel.to_tunnel_config().is_ok());
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ClientSettings::default_config();

        let toml_path = dir.path().join("kuza.toml");
        std::fs::write(&toml_path, settings.to_toml().unwrap()).unwrap();
        assert_eq!(ClientSettings::from_file(&toml_path).unwrap(), settings);

        let json_path = dir.path().join("kuza.json");
        let mut file = std::fs::File::create(&json_path).unwrap();
        file.write_all(settings.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(ClientSettings::from_file(&json_path).unwrap(), settings);

        assert!(matches!(
            ClientSettings::from_file(&dir.path().join("missing.toml")),
            Err(SettingsError::Io(_))
        ));
    }

    #[test]
    fn test_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ClientSettings::default_config();
        let path = dir.path().join("kuza.json");

        settings.to_file(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.trim_start().starts_with('{'));
        assert_eq!(ClientSettings::from_file(&path).unwrap(), settings);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_static_resolver_when_live_disabled() {
        let mut routing = RoutingSettings::default();
        routing.resolver.live_lookup = false;

        let resolver = routing.build_resolver().unwrap();
        assert_eq!(resolver.table().len(), 10);
    }
}
