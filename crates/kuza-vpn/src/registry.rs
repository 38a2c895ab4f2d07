//! App Selection Registry
//!
//! Owns the catalog of selectable apps, the user's selection and the
//! selection mode. Independent of routing and of connection state: the
//! session controller reads it once per connect through [`snapshot`].
//!
//! [`snapshot`]: AppSelectionRegistry::snapshot

use crate::adapter::NativeTunnelAdapter;
use crate::catalog::{mock_catalog, Platform};
use crate::model::{AppIdentity, AppSelection, SelectionMode};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown app: {0}")]
    UnknownApp(String),
}

#[derive(Debug, Default)]
struct RegistryState {
    catalog: Vec<AppIdentity>,
    selection: AppSelection,
    mode: SelectionMode,
    defaults_applied: bool,
}

/// Catalog + selection + mode, behind one lock
pub struct AppSelectionRegistry {
    state: RwLock<RegistryState>,
    include_system_apps: bool,
}

impl Default for AppSelectionRegistry {
    fn default() -> Self {
        Self::new(SelectionMode::default(), false)
    }
}

impl AppSelectionRegistry {
    pub fn new(mode: SelectionMode, include_system_apps: bool) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                mode,
                ..RegistryState::default()
            }),
            include_system_apps,
        }
    }

    /// Replace the catalog. The selection is left untouched.
    ///
    /// Returns the number of apps kept after system-app filtering.
    pub async fn load_catalog(&self, apps: Vec<AppIdentity>) -> usize {
        let total = apps.len();
        let catalog: Vec<AppIdentity> = apps
            .into_iter()
            .filter(|app| self.include_system_apps || !app.is_system_app)
            .collect();

        let kept = catalog.len();
        self.state.write().await.catalog = catalog;

        info!(total, kept, "App catalog loaded");
        kept
    }

    /// Load the catalog from the tunnel engine.
    ///
    /// Falls back to the built-in catalog when the engine fails or
    /// reports no apps.
    pub async fn refresh_catalog(&self, adapter: &dyn NativeTunnelAdapter, platform: Platform) -> usize {
        let apps = match adapter.get_installed_apps().await {
            Ok(apps) if !apps.is_empty() => apps,
            Ok(_) => {
                debug!(adapter = adapter.name(), "No installed apps reported, using built-in catalog");
                mock_catalog(platform)
            }
            Err(e) => {
                warn!(adapter = adapter.name(), error = %e, "App enumeration failed, using built-in catalog");
                mock_catalog(platform)
            }
        };

        self.load_catalog(apps).await
    }

    /// Select the catalog apps whose display names appear in `names`.
    ///
    /// Applied once; later calls return 0 so a user's deselection of a
    /// default app survives catalog reloads.
    pub async fn select_defaults(&self, names: &[String]) -> usize {
        let mut state = self.state.write().await;
        if state.defaults_applied {
            return 0;
        }
        state.defaults_applied = true;

        let defaults: Vec<AppIdentity> = state
            .catalog
            .iter()
            .filter(|app| names.iter().any(|n| n.eq_ignore_ascii_case(&app.display_name)))
            .cloned()
            .collect();

        let count = defaults.len();
        for app in defaults {
            state.selection.insert(app);
        }

        debug!(count, "Default apps selected");
        count
    }

    /// Flip the membership of `app_id`. Valid in either mode.
    ///
    /// Returns whether the app is selected afterwards. Ids outside the
    /// catalog can only be deselected.
    pub async fn toggle(&self, app_id: &str) -> Result<bool, RegistryError> {
        let mut state = self.state.write().await;

        if state.selection.remove(app_id).is_some() {
            debug!(app = app_id, "App deselected");
            return Ok(false);
        }

        let app = state
            .catalog
            .iter()
            .find(|app| app.id == app_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownApp(app_id.to_string()))?;

        state.selection.insert(app);
        debug!(app = app_id, "App selected");
        Ok(true)
    }

    /// Replace the whole selection
    pub async fn replace(&self, selection: AppSelection) {
        let count = selection.len();
        self.state.write().await.selection = selection;
        debug!(count, "Selection replaced");
    }

    /// Switch mode. The stored selection is never modified.
    pub async fn set_mode(&self, mode: SelectionMode) {
        let mut state = self.state.write().await;
        if state.mode != mode {
            info!(from = %state.mode, to = %mode, "Selection mode changed");
            state.mode = mode;
        }
    }

    pub async fn mode(&self) -> SelectionMode {
        self.state.read().await.mode
    }

    /// The explicit selection, whatever the mode
    pub async fn selection(&self) -> AppSelection {
        self.state.read().await.selection.clone()
    }

    /// Apps shown as selected: the whole catalog under `EncryptAll`,
    /// the explicit selection under `Custom`.
    pub async fn current_selection(&self, mode: SelectionMode) -> Vec<AppIdentity> {
        let state = self.state.read().await;
        match mode {
            SelectionMode::EncryptAll => state.catalog.clone(),
            SelectionMode::Custom => state.selection.iter().cloned().collect(),
        }
    }

    /// Mode and selection, read together
    pub async fn snapshot(&self) -> (SelectionMode, AppSelection) {
        let state = self.state.read().await;
        (state.mode, state.selection.clone())
    }

    pub async fn catalog(&self) -> Vec<AppIdentity> {
        self.state.read().await.catalog.clone()
    }

    pub async fn is_selected(&self, app_id: &str) -> bool {
        self.state.read().await.selection.contains(app_id)
    }
}
