//! Kuza VPN - Client Control Plane
//!
//! Decides what goes through the tunnel and drives a platform tunnel
//! engine through its connection lifecycle. Packet encryption and key
//! exchange stay inside the engine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Control Plane                          │
//! │                                                               │
//! │  AppSelectionRegistry ──snapshot──▶ RoutingRuleCompiler        │
//! │          ▲                               │  (AddressResolver)  │
//! │          │ toggle / mode                 ▼                     │
//! │                          SessionController ──▶ TelemetryPoller │
//! │                                  │                             │
//! └──────────────────────────────────│─────────────────────────────┘
//!                                    ▼
//!                      NativeTunnelAdapter (platform engine)
//! ```
//!
//! # Features
//!
//! - **Encrypt all / Custom**: full route or only the selected apps' domains
//! - **Popular-services fallback**: a custom selection never yields an empty tunnel
//! - **Single state owner**: the controller serializes every transition
//! - **Capability-aware**: engines without per-app filtering route by address

mod catalog;
mod config;
mod controller;
mod error;
mod keys;
mod model;
mod registry;
mod routing;
mod settings;
mod state;
mod telemetry;

pub mod adapter;

pub use adapter::{AdapterCapabilities, AdapterError, NativeTunnelAdapter};
pub use catalog::{convert_package_id, equivalent_ids, mock_catalog, Platform};
pub use config::{
    default_client_address, default_dns_servers, full_route_ranges, ConfigError, Endpoint,
    TunnelConfig, WireConfig, DEFAULT_PORT, PERSISTENT_KEEPALIVE,
};
pub use controller::{ControllerConfig, SessionController};
pub use error::VpnError;
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey, KEY_LEN};
pub use model::{
    AppIdentity, AppSelection, BandwidthSample, IconRef, SelectionMode, TunnelStatus,
    DEFAULT_BANDWIDTH_LIMIT,
};
pub use registry::{AppSelectionRegistry, RegistryError};
pub use routing::{DomainRoutingTable, RoutePlan, RoutingRule, RoutingRuleCompiler};
pub use settings::{
    CatalogSettings, ClientSettings, PollingSettings, ResolverSettings, RoutingSettings,
    SettingsError, TunnelProfile,
};
pub use state::{ConnectionState, ControlEvent, Transition};
pub use telemetry::TelemetryPoller;
