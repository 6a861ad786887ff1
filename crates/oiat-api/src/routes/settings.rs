//! Portal-wide settings endpoints.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::auth::{Authenticated, CsrfChecked, Permission};
use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, PortalSettings};

/// Routes under `/api/settings`.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_settings).put(put_settings))
}

async fn get_settings(
    State(state): State<AppState>,
    _session: Authenticated,
) -> ApiResult<Json<PortalSettings>> {
    Ok(Json(state.settings.read().await.clone()))
}

async fn put_settings(
    State(state): State<AppState>,
    CsrfChecked(session): CsrfChecked,
    Json(new_settings): Json<PortalSettings>,
) -> ApiResult<Json<PortalSettings>> {
    session.require(Permission::ManagePortalSettings)?;
    if new_settings.reconcile_warn_threshold < 0.0 {
        return Err(ApiError::bad_request(
            "reconcile_warn_threshold must be non-negative",
        ));
    }
    if new_settings.run_history_limit == 0 {
        return Err(ApiError::bad_request("run_history_limit must be positive"));
    }
    *state.settings.write().await = new_settings.clone();
    Ok(Json(new_settings))
}
