//! Session-based authentication, permissions, and CSRF.
//!
//! Sessions are opaque server-side tokens delivered as cookies. Every
//! mutation must echo the session's CSRF token in the `x-oiat-csrf`
//! header (double submit); GETs never require it. Permissions are
//! granted per session and checked per route.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use ulid::Ulid;

use crate::error::ApiError;

/// Session cookie name.
pub const SESSION_COOKIE: &str = "oiat_session";

/// CSRF header mutations must carry.
pub const CSRF_HEADER: &str = "x-oiat-csrf";

/// Portal permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Permission {
    /// May trigger and cancel runs.
    TriggerRuns,
    /// May create, edit, toggle, and delete schedules.
    ManageSchedules,
    /// May create and edit company configurations.
    EditCompanies,
    /// May edit portal-wide settings.
    ManagePortalSettings,
}

impl Permission {
    /// Stable name used in session payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TriggerRuns => "can_trigger_runs",
            Self::ManageSchedules => "can_manage_schedules",
            Self::EditCompanies => "can_edit_companies",
            Self::ManagePortalSettings => "can_manage_portal_settings",
        }
    }

    /// Every permission (for admin sessions).
    #[must_use]
    pub fn all() -> BTreeSet<Self> {
        [
            Self::TriggerRuns,
            Self::ManageSchedules,
            Self::EditCompanies,
            Self::ManagePortalSettings,
        ]
        .into_iter()
        .collect()
    }
}

/// One live session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque session id (cookie value).
    pub id: String,
    /// Authenticated username.
    pub username: String,
    /// CSRF token bound to this session.
    pub csrf_token: String,
    /// Granted permissions.
    pub permissions: BTreeSet<Permission>,
}

impl Session {
    /// Checks one permission.
    ///
    /// # Errors
    ///
    /// Returns 403 when the permission is missing.
    pub fn require(&self, permission: Permission) -> Result<(), ApiError> {
        if self.permissions.contains(&permission) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!(
                "missing permission: {}",
                permission.as_str()
            )))
        }
    }
}

/// In-memory session store.
///
/// Sessions die with the process; operators re-authenticate after a
/// restart, which is acceptable for a single-host portal.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session and returns it (id doubles as the cookie value).
    pub fn create(&self, username: &str, permissions: BTreeSet<Permission>) -> Session {
        let session = Session {
            id: Ulid::new().to_string(),
            username: username.to_string(),
            csrf_token: Ulid::new().to_string(),
            permissions,
        };
        self.lock().insert(session.id.clone(), session.clone());
        session
    }

    /// Looks a session up by cookie value.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Session> {
        self.lock().get(id).cloned()
    }

    /// Drops a session (logout).
    pub fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Extractor: a valid session (any permissions).
pub struct Authenticated(
    /// The resolved session.
    pub Session,
);

/// Extractor: a valid session whose CSRF header matches (mutations).
pub struct CsrfChecked(
    /// The resolved session.
    pub Session,
);

fn session_from_parts(parts: &Parts, store: &SessionStore) -> Result<Session, ApiError> {
    let cookies = parts
        .headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let session_id = cookies
        .split(';')
        .filter_map(|pair| {
            let mut parts = pair.trim().splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some(name), Some(value)) if name == SESSION_COOKIE => Some(value.to_string()),
                _ => None,
            }
        })
        .next()
        .ok_or_else(|| ApiError::unauthorized("no session cookie"))?;

    store
        .get(&session_id)
        .ok_or_else(|| ApiError::unauthorized("session expired or unknown"))
}

impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync + AsRef<SessionStore>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        session_from_parts(parts, state.as_ref()).map(Authenticated)
    }
}

impl<S> FromRequestParts<S> for CsrfChecked
where
    S: Send + Sync + AsRef<SessionStore>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = session_from_parts(parts, state.as_ref())?;
        let header = parts
            .headers
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if header != session.csrf_token {
            return Err(ApiError::forbidden("missing or invalid CSRF token"));
        }
        Ok(CsrfChecked(session))
    }
}
