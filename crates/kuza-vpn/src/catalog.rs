//! App catalog helpers
//!
//! Platform package-id conversion and the built-in catalog used when the
//! tunnel engine cannot enumerate installed apps.

use crate::model::AppIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mobile platform an app id belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub fn all() -> &'static [Platform] {
        &[Platform::Android, Platform::Ios]
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Android => f.write_str("android"),
            Platform::Ios => f.write_str("ios"),
        }
    }
}

/// (display name, android id, ios id)
const KNOWN_APPS: &[(&str, &str, &str)] = &[
    ("Snapchat", "com.snapchat.android", "com.snapchat.Snapchat"),
    ("WhatsApp", "com.whatsapp", "net.whatsapp.WhatsApp"),
    ("Instagram", "com.instagram.android", "com.burbn.instagram"),
    ("TikTok", "com.zhiliaoapp.musically", "com.zhiliaoapp.musically"),
    ("Twitter", "com.twitter.android", "com.twitter.app"),
    ("Spotify", "com.spotify.music", "com.spotify.client"),
];

fn id_for(entry: &(&'static str, &'static str, &'static str), platform: Platform) -> &'static str {
    match platform {
        Platform::Android => entry.1,
        Platform::Ios => entry.2,
    }
}

/// Convert a known package id to its counterpart on `target`.
///
/// Unknown ids are returned unchanged.
pub fn convert_package_id(id: &str, target: Platform) -> String {
    KNOWN_APPS
        .iter()
        .find(|entry| entry.1 == id || entry.2 == id)
        .map(|entry| id_for(entry, target).to_string())
        .unwrap_or_else(|| id.to_string())
}

/// `id` followed by its counterparts on other platforms, without duplicates.
pub fn equivalent_ids(id: &str) -> Vec<String> {
    let mut ids = vec![id.to_string()];
    for platform in Platform::all() {
        let converted = convert_package_id(id, *platform);
        if !ids.contains(&converted) {
            ids.push(converted);
        }
    }
    ids
}

/// Built-in catalog of popular apps with `platform` ids
pub fn mock_catalog(platform: Platform) -> Vec<AppIdentity> {
    KNOWN_APPS
        .iter()
        .map(|entry| AppIdentity::new(id_for(entry, platform), entry.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_package_id() {
        assert_eq!(convert_package_id("com.whatsapp", Platform::Ios), "net.whatsapp.WhatsApp");
        assert_eq!(convert_package_id("com.burbn.instagram", Platform::Android), "com.instagram.android");
        assert_eq!(convert_package_id("com.whatsapp", Platform::Android), "com.whatsapp");
        assert_eq!(convert_package_id("org.unknown", Platform::Ios), "org.unknown");
    }

    #[test]
    fn test_equivalent_ids() {
        assert_eq!(
            equivalent_ids("com.spotify.music"),
            vec!["com.spotify.music", "com.spotify.client"]
        );
        assert_eq!(equivalent_ids("com.zhiliaoapp.musically"), vec!["com.zhiliaoapp.musically"]);
    }

    #[test]
    fn test_mock_catalog() {
        let android = mock_catalog(Platform::Android);
        let ios = mock_catalog(Platform::Ios);

        assert_eq!(android.len(), 6);
        assert!(android.iter().all(|app| !app.is_system_app));
        assert_eq!(ios[0].id, "com.snapchat.Snapchat");
        assert_eq!(ios[0].display_name, android[0].display_name);
    }
}
