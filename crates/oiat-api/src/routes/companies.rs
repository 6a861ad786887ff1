//! Company configuration endpoints.
//!
//! Company configs are the JSON files the pipeline reads; the API edits
//! them in place (atomically, temp-then-rename) so the portal and the
//! orchestrator can never see half-written configuration.

use axum::extract::{Path as AxumPath, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use oiat_core::config::{available_companies, load_company_config, CompanyConfig};
use oiat_core::TenantKey;

use crate::auth::{Authenticated, CsrfChecked, Permission};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Routes under `/api/companies`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_companies).post(create_company))
        .route("/{key}", get(get_company).put(update_company))
}

#[derive(Debug, Serialize)]
struct CompanySummary {
    company_key: String,
    display_name: String,
    realm_id: String,
    trading_day_enabled: bool,
    inventory_enabled: bool,
}

async fn list_companies(
    State(state): State<AppState>,
    _session: Authenticated,
) -> ApiResult<Json<Vec<CompanySummary>>> {
    let mut summaries = Vec::new();
    for key in available_companies(&state.companies_dir) {
        match load_company_config(&state.companies_dir, &key) {
            Ok(config) => summaries.push(CompanySummary {
                company_key: config.company_key.to_string(),
                display_name: config.display_name.clone(),
                realm_id: config.qbo.realm_id.clone(),
                trading_day_enabled: config.trading_day().enabled,
                inventory_enabled: config.inventory().enabled,
            }),
            Err(e) => {
                tracing::warn!(tenant = %key, "unreadable company config: {e}");
            }
        }
    }
    Ok(Json(summaries))
}

async fn get_company(
    State(state): State<AppState>,
    _session: Authenticated,
    AxumPath(key): AxumPath<String>,
) -> ApiResult<Json<CompanyConfig>> {
    let key = TenantKey::new(key)?;
    let config = load_company_config(&state.companies_dir, &key)
        .map_err(|_| ApiError::not_found(format!("company not found: {key}")))?;
    Ok(Json(config))
}

async fn create_company(
    State(state): State<AppState>,
    CsrfChecked(session): CsrfChecked,
    Json(config): Json<CompanyConfig>,
) -> ApiResult<Json<CompanyConfig>> {
    session.require(Permission::EditCompanies)?;

    let path = state
        .companies_dir
        .join(format!("{}.json", config.company_key));
    if path.exists() {
        return Err(ApiError::conflict(format!(
            "company already exists: {}",
            config.company_key
        )));
    }
    write_config(&state, &config)?;
    Ok(Json(config))
}

async fn update_company(
    State(state): State<AppState>,
    CsrfChecked(session): CsrfChecked,
    AxumPath(key): AxumPath<String>,
    Json(config): Json<CompanyConfig>,
) -> ApiResult<Json<CompanyConfig>> {
    session.require(Permission::EditCompanies)?;

    let key = TenantKey::new(key)?;
    if config.company_key != key {
        return Err(ApiError::bad_request(
            "company_key in body must match the path",
        ));
    }
    let path = state.companies_dir.join(format!("{key}.json"));
    if !path.exists() {
        return Err(ApiError::not_found(format!("company not found: {key}")));
    }
    write_config(&state, &config)?;
    Ok(Json(config))
}

fn write_config(state: &AppState, config: &CompanyConfig) -> Result<(), ApiError> {
    std::fs::create_dir_all(&state.companies_dir)
        .map_err(|e| ApiError::internal(format!("create companies dir: {e}")))?;
    let path = state
        .companies_dir
        .join(format!("{}.json", config.company_key));
    let payload = serde_json::to_vec_pretty(config)
        .map_err(|e| ApiError::internal(format!("serialize config: {e}")))?;

    let tmp = path.with_extension(format!("json.tmp.{}", std::process::id()));
    std::fs::write(&tmp, payload)
        .map_err(|e| ApiError::internal(format!("write config: {e}")))?;
    std::fs::rename(&tmp, &path)
        .map_err(|e| ApiError::internal(format!("replace config: {e}")))?;
    Ok(())
}
