//! API server: router assembly, auth endpoints, health, serving.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use axum::extract::State;
use axum::http::header::SET_COOKIE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use oiat_core::Result;

use crate::auth::{Authenticated, Permission, SESSION_COOKIE};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Body of `POST /api/login`.
#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

/// Body returned on successful login. The CSRF token must be echoed in
/// the `x-oiat-csrf` header on every mutation.
#[derive(Debug, Serialize)]
struct LoginResponse {
    username: String,
    csrf_token: String,
    permissions: Vec<String>,
}

/// Operator credentials come from `OIAT_PORTAL_USERNAME` /
/// `OIAT_PORTAL_PASSWORD`. A production deployment sits behind the
/// reverse proxy's TLS; the portal is a single-operator tool.
async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Response> {
    let expected_user = std::env::var("OIAT_PORTAL_USERNAME").unwrap_or_default();
    let expected_password = std::env::var("OIAT_PORTAL_PASSWORD").unwrap_or_default();
    if expected_user.is_empty()
        || request.username != expected_user
        || request.password != expected_password
    {
        return Err(ApiError::unauthorized("invalid credentials"));
    }

    let session = state.sessions.create(&request.username, Permission::all());
    let body = LoginResponse {
        username: session.username.clone(),
        csrf_token: session.csrf_token.clone(),
        permissions: session
            .permissions
            .iter()
            .map(|p| p.as_str().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
    };

    let mut response = Json(body).into_response();
    let cookie = format!("{SESSION_COOKIE}={}; HttpOnly; SameSite=Strict; Path=/", session.id);
    response.headers_mut().insert(
        SET_COOKIE,
        cookie.parse().map_err(|_| ApiError::internal("bad cookie"))?,
    );
    Ok(response)
}

async fn logout(
    State(state): State<AppState>,
    Authenticated(session): Authenticated,
) -> Json<serde_json::Value> {
    state.sessions.remove(&session.id);
    Json(serde_json::json!({"logged_out": true}))
}

/// Assembles the full application router.
#[must_use]
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .nest("/api/runs", crate::routes::runs::router())
        .nest("/api/schedules", crate::routes::schedules::router())
        .nest("/api/companies", crate::routes::companies::router())
        .nest("/api/settings", crate::routes::settings::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the API until ctrl-c.
///
/// # Errors
///
/// Returns `Storage` when the listener cannot bind.
pub async fn serve(state: AppState, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| oiat_core::Error::storage_with_source("bind API listener", e))?;
    info!(%addr, "operator API listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .map_err(|e| oiat_core::Error::storage_with_source("serve API", e))
}
