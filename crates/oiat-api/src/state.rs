//! Shared application state for the operator API.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use oiat_core::StateDir;
use oiat_flow::Dispatcher;
use oiat_store::Database;

use crate::auth::SessionStore;

/// Portal-wide settings, editable by operators with
/// `can_manage_portal_settings`.
///
/// Defaults come from `OIAT_DASHBOARD_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalSettings {
    /// Reconciliation differences above this render as warnings.
    pub reconcile_warn_threshold: f64,
    /// Tokens expiring within this many days are flagged.
    pub token_expiry_warn_days: u32,
    /// Default page size for run history.
    pub run_history_limit: u32,
}

impl Default for PortalSettings {
    fn default() -> Self {
        Self {
            reconcile_warn_threshold: env_f64("OIAT_DASHBOARD_RECONCILE_WARN_THRESHOLD", 1.0),
            token_expiry_warn_days: env_u32("OIAT_DASHBOARD_TOKEN_EXPIRY_WARN_DAYS", 7),
            run_history_limit: env_u32("OIAT_DASHBOARD_RUN_HISTORY_LIMIT", 50),
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Shared state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Dashboard database.
    pub db: Database,
    /// Persisted state layout.
    pub state_dir: StateDir,
    /// Company configuration directory.
    pub companies_dir: PathBuf,
    /// Job dispatcher.
    pub dispatcher: Arc<Dispatcher>,
    /// Live sessions.
    pub sessions: Arc<SessionStore>,
    /// Portal settings.
    pub settings: Arc<RwLock<PortalSettings>>,
}

impl AppState {
    /// Builds the state over an initialized database and dispatcher.
    #[must_use]
    pub fn new(db: Database, state_dir: StateDir, dispatcher: Arc<Dispatcher>) -> Self {
        let companies_dir = state_dir.companies_dir();
        Self {
            db,
            state_dir,
            companies_dir,
            dispatcher,
            sessions: Arc::new(SessionStore::new()),
            settings: Arc::new(RwLock::new(PortalSettings::default())),
        }
    }
}

impl AsRef<SessionStore> for AppState {
    fn as_ref(&self) -> &SessionStore {
        &self.sessions
    }
}
