//! Tunnel Configuration
//!
//! The immutable parameter set handed to the tunnel engine on start, its
//! JSON wire format, and the `wg-quick` rendering of the same values.

use crate::error::VpnError;
use crate::keys::{KeyError, PrivateKey, PublicKey};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Standard WireGuard port
pub const DEFAULT_PORT: u16 = 51820;

/// Keepalive written into rendered configs (seconds)
pub const PERSISTENT_KEEPALIVE: u16 = 25;

/// Server endpoint (hostname or IP + UDP port)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    /// Parse `host:port`, `a.b.c.d:port` or `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidEndpoint(s.to_string());

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
            host.parse::<Ipv6Addr>().map_err(|_| invalid())?;
            (host, port)
        } else {
            let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
            // A bare v6 literal is ambiguous without brackets
            if host.is_empty() || host.contains(':') {
                return Err(invalid());
            }
            (host, port)
        };

        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        Ok(Self::new(host, port))
    }
}

impl Serialize for Endpoint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Route-everything ranges (`0.0.0.0/0`, `::/0`)
pub fn full_route_ranges() -> Vec<IpNet> {
    vec![IpNet::V4(Ipv4Net::default()), IpNet::V6(Ipv6Net::default())]
}

/// Default client address inside the tunnel
pub fn default_client_address() -> IpNet {
    let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    IpNet::new(addr, 24).unwrap_or_else(|_| IpNet::from(addr))
}

/// Default in-tunnel DNS (Cloudflare, Google)
pub fn default_dns_servers() -> Vec<IpAddr> {
    vec![
        IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
        IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    ]
}

/// Complete tunnel configuration
///
/// The `Debug` output leaves the client key out entirely.
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub endpoint: Endpoint,
    pub server_public_key: PublicKey,
    pub client_private_key: PrivateKey,
    pub client_address: IpNet,
    /// Routed ranges, in order
    pub allowed_ranges: Vec<IpNet>,
    pub dns_servers: Vec<IpAddr>,
}

impl TunnelConfig {
    /// Configuration with the default address, full-route ranges and DNS.
    pub fn new(endpoint: Endpoint, server_public_key: PublicKey, client_private_key: PrivateKey) -> Self {
        Self {
            endpoint,
            server_public_key,
            client_private_key,
            client_address: default_client_address(),
            allowed_ranges: full_route_ranges(),
            dns_servers: default_dns_servers(),
        }
    }

    /// Copy of this configuration routing exactly `ranges`.
    pub fn with_allowed_ranges(&self, ranges: Vec<IpNet>) -> Self {
        Self {
            allowed_ranges: ranges,
            ..self.clone()
        }
    }

    /// Validate before handing to the tunnel engine
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.host.trim().is_empty() {
            return Err(ConfigError::InvalidEndpoint(self.endpoint.to_string()));
        }
        if self.endpoint.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.allowed_ranges.is_empty() {
            return Err(ConfigError::NoAllowedRanges);
        }
        if self.client_private_key.public_key() == self.server_public_key {
            return Err(ConfigError::KeyReuse);
        }
        Ok(())
    }

    /// Wire representation for the tunnel engine
    pub fn to_wire(&self) -> WireConfig {
        WireConfig {
            server_endpoint: self.endpoint.clone(),
            public_key: self.server_public_key,
            private_key: self.client_private_key.clone(),
            allowed_ips: self.allowed_ranges.clone(),
            dns: self.dns_servers.clone(),
        }
    }

    /// Wire JSON string for the tunnel engine
    pub fn to_wire_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string(&self.to_wire()).map_err(|e| ConfigError::Serialization(e.to_string()))
    }

    /// Rebuild from the wire form. The wire form carries no client address.
    pub fn from_wire(wire: WireConfig, client_address: IpNet) -> Self {
        Self {
            endpoint: wire.server_endpoint,
            server_public_key: wire.public_key,
            client_private_key: wire.private_key,
            client_address,
            allowed_ranges: wire.allowed_ips,
            dns_servers: wire.dns,
        }
    }

    /// Render as a `wg-quick` configuration file.
    ///
    /// The output contains the private key; write it with restrictive
    /// permissions and never log it.
    pub fn to_wg_quick(&self) -> String {
        let join = |items: Vec<String>| items.join(", ");

        let mut out = String::new();
        out.push_str("[Interface]\n");
        out.push_str(&format!("PrivateKey = {}\n", self.client_private_key.to_base64()));
        out.push_str(&format!("Address = {}\n", self.client_address));
        if !self.dns_servers.is_empty() {
            out.push_str(&format!(
                "DNS = {}\n",
                join(self.dns_servers.iter().map(ToString::to_string).collect())
            ));
        }
        out.push('\n');
        out.push_str("[Peer]\n");
        out.push_str(&format!("PublicKey = {}\n", self.server_public_key));
        out.push_str(&format!("Endpoint = {}\n", self.endpoint));
        out.push_str(&format!(
            "AllowedIPs = {}\n",
            join(self.allowed_ranges.iter().map(ToString::to_string).collect())
        ));
        out.push_str(&format!("PersistentKeepalive = {}\n", PERSISTENT_KEEPALIVE));
        out
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("endpoint", &self.endpoint.to_string())
            .field("server_public_key", &self.server_public_key)
            .field("client_address", &self.client_address)
            .field("allowed_ranges", &self.allowed_ranges.len())
            .field("dns_servers", &self.dns_servers)
            .finish_non_exhaustive()
    }
}

/// JSON object passed to the tunnel engine's `start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireConfig {
    #[serde(rename = "serverEndpoint")]
    pub server_endpoint: Endpoint,
    /// Server public key
    #[serde(rename = "publicKey")]
    pub public_key: PublicKey,
    /// Client private key
    #[serde(rename = "privateKey")]
    pub private_key: PrivateKey,
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<IpNet>,
    pub dns: Vec<IpAddr>,
}

impl WireConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Serialization(e.to_string()))
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid endpoint: {0:?}")]
    InvalidEndpoint(String),

    #[error("Invalid port")]
    InvalidPort,

    #[error("No allowed ranges to route")]
    NoAllowedRanges,

    #[error("Client key pair matches the server key")]
    KeyReuse,

    #[error("Invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<ConfigError> for VpnError {
    fn from(e: ConfigError) -> Self {
        VpnError::InvalidConfig(e.to_string())
    }
}
