//! Shared data model
//!
//! Application identities, the selection set, the tunnel engine's status
//! vocabulary and bandwidth samples. Field names on the serde side follow
//! the tunnel engine's JSON so values cross the boundary unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Default monthly data allowance shown next to usage (1040 MiB)
pub const DEFAULT_BANDWIDTH_LIMIT: u64 = 1040 * 1024 * 1024;

/// Opaque reference to an app icon (base64 image data from the platform)
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IconRef(pub String);

impl fmt::Debug for IconRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IconRef({} bytes)", self.0.len())
    }
}

/// An installed application that can be routed through the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppIdentity {
    /// Platform package / bundle identifier
    #[serde(rename = "packageName")]
    pub id: String,
    #[serde(rename = "appName")]
    pub display_name: String,
    #[serde(rename = "isSystemApp", default)]
    pub is_system_app: bool,
    #[serde(rename = "iconBase64", default, skip_serializing_if = "Option::is_none")]
    pub icon_ref: Option<IconRef>,
}

impl AppIdentity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            is_system_app: false,
            icon_ref: None,
        }
    }

    pub fn system(mut self) -> Self {
        self.is_system_app = true;
        self
    }
}

/// How the selection is interpreted when routing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMode {
    /// Route all traffic, whatever the selection holds
    #[default]
    EncryptAll,
    /// Route only traffic of the selected apps
    Custom,
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionMode::EncryptAll => f.write_str("encrypt-all"),
            SelectionMode::Custom => f.write_str("custom"),
        }
    }
}

/// Set of selected apps, keyed by id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppSelection {
    apps: BTreeMap<String, AppIdentity>,
}

impl AppSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an app, replacing any entry with the same id.
    pub fn insert(&mut self, app: AppIdentity) {
        self.apps.insert(app.id.clone(), app);
    }

    pub fn remove(&mut self, id: &str) -> Option<AppIdentity> {
        self.apps.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.apps.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Apps in id order
    pub fn iter(&self) -> impl Iterator<Item = &AppIdentity> {
        self.apps.values()
    }

    /// Selected ids in sorted order
    pub fn ids(&self) -> Vec<String> {
        self.apps.keys().cloned().collect()
    }
}

impl FromIterator<AppIdentity> for AppSelection {
    fn from_iter<I: IntoIterator<Item = AppIdentity>>(iter: I) -> Self {
        let mut selection = Self::new();
        for app in iter {
            selection.insert(app);
        }
        selection
    }
}

/// Status vocabulary of the tunnel engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Connected,
    Connecting,
    Disconnected,
}

impl TunnelStatus {
    /// Map a raw platform status string.
    ///
    /// Reasserting counts as connecting; anything unrecognized (invalid,
    /// disconnecting, empty) counts as disconnected.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "connected" => TunnelStatus::Connected,
            "connecting" | "reasserting" => TunnelStatus::Connecting,
            _ => TunnelStatus::Disconnected,
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Connected => f.write_str("connected"),
            TunnelStatus::Connecting => f.write_str("connecting"),
            TunnelStatus::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Cumulative byte counters read from the tunnel engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthSample {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub total_bytes: u64,
    #[serde(rename = "lastUpdated")]
    pub sampled_at: DateTime<Utc>,
}

impl BandwidthSample {
    /// Sample with `total_bytes` derived from the two directions.
    pub fn new(bytes_received: u64, bytes_sent: u64, sampled_at: DateTime<Utc>) -> Self {
        Self {
            bytes_received,
            bytes_sent,
            total_bytes: bytes_received.saturating_add(bytes_sent),
            sampled_at,
        }
    }

    /// Fraction of `limit` used, capped at 1.0
    pub fn usage_ratio(&self, limit: u64) -> f64 {
        if limit == 0 {
            return 1.0;
        }
        (self.total_bytes as f64 / limit as f64).min(1.0)
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "RX: {:.2}MB, TX: {:.2}MB, Total: {:.2}MB",
            self.bytes_received as f64 / (1024.0 * 1024.0),
            self.bytes_sent as f64 / (1024.0 * 1024.0),
            self.total_bytes as f64 / (1024.0 * 1024.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_identity_wire_names() {
        let json = r#"{"packageName":"com.whatsapp","appName":"WhatsApp","isSystemApp":false}"#;
        let app: AppIdentity = serde_json::from_str(json).unwrap();

        assert_eq!(app, AppIdentity::new("com.whatsapp", "WhatsApp"));
        assert_eq!(serde_json::to_string(&app).unwrap(), json);
    }

    #[test]
    fn test_selection_keyed_by_id() {
        let mut selection: AppSelection = [
            AppIdentity::new("b.app", "B"),
            AppIdentity::new("a.app", "A"),
            AppIdentity::new("b.app", "B renamed"),
        ]
        .into_iter()
        .collect();

        assert_eq!(selection.len(), 2);
        assert_eq!(selection.ids(), vec!["a.app", "b.app"]);

        selection.remove("a.app");
        assert!(!selection.contains("a.app"));
    }

    #[test]
    fn test_status_from_raw() {
        assert_eq!(TunnelStatus::from_raw("connected"), TunnelStatus::Connected);
        assert_eq!(TunnelStatus::from_raw("Reasserting"), TunnelStatus::Connecting);
        assert_eq!(TunnelStatus::from_raw("invalid"), TunnelStatus::Disconnected);
        assert_eq!(TunnelStatus::from_raw(""), TunnelStatus::Disconnected);
    }

    #[test]
    fn test_mode_serde() {
        assert_eq!(serde_json::to_string(&SelectionMode::EncryptAll).unwrap(), "\"encrypt-all\"");
        assert_eq!(SelectionMode::default(), SelectionMode::EncryptAll);
    }

    #[test]
    fn test_bandwidth_sample() {
        let sample = BandwidthSample::new(3 * 1024 * 1024, 1024 * 1024, Utc::now());

        assert_eq!(sample.total_bytes, 4 * 1024 * 1024);
        assert!(sample.format().contains("Total: 4.00MB"));
        assert!((sample.usage_ratio(8 * 1024 * 1024) - 0.5).abs() < f64::EPSILON);
        assert_eq!(sample.usage_ratio(1), 1.0);
    }
}
