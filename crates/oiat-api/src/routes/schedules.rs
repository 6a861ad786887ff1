//! Schedule endpoints: CRUD, toggle, run-now.

use axum::extract::{Path, State};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Serialize;

use oiat_store::jobs::{DateSelection, NewRunJob};
use oiat_store::schedules::{self, ScheduleSpec};
use oiat_store::RunSchedule;

use crate::auth::{Authenticated, CsrfChecked, Permission};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Routes under `/api/schedules`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_schedules).post(create_schedule))
        .route("/{id}", put(update_schedule).delete(delete_schedule))
        .route("/{id}/toggle", post(toggle_schedule))
        .route("/{id}/run-now", post(run_now))
}

async fn list_schedules(
    State(state): State<AppState>,
    _session: Authenticated,
) -> ApiResult<Json<Vec<RunSchedule>>> {
    let schedules = state.db.call(|conn| schedules::list(conn)).await?;
    Ok(Json(schedules))
}

fn validate_spec(spec: &ScheduleSpec) -> Result<(), ApiError> {
    if spec.name.trim().is_empty() {
        return Err(ApiError::bad_request("schedule name cannot be empty"));
    }
    let fields = spec.cron_expr.split_whitespace().count();
    if !(5..=6).contains(&fields) {
        return Err(ApiError::bad_request(
            "cron expression must have 5 or 6 fields",
        ));
    }
    if spec.timezone.parse::<chrono_tz::Tz>().is_err() {
        return Err(ApiError::bad_request(format!(
            "unknown timezone: {}",
            spec.timezone
        )));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CreatedResponse {
    id: i64,
}

async fn create_schedule(
    State(state): State<AppState>,
    CsrfChecked(session): CsrfChecked,
    Json(spec): Json<ScheduleSpec>,
) -> ApiResult<Json<CreatedResponse>> {
    session.require(Permission::ManageSchedules)?;
    validate_spec(&spec)?;
    let id = state
        .db
        .call(move |conn| schedules::create(conn, &spec, false))
        .await?;
    Ok(Json(CreatedResponse { id }))
}

async fn update_schedule(
    State(state): State<AppState>,
    CsrfChecked(session): CsrfChecked,
    Path(id): Path<i64>,
    Json(spec): Json<ScheduleSpec>,
) -> ApiResult<Json<RunSchedule>> {
    session.require(Permission::ManageSchedules)?;
    validate_spec(&spec)?;
    let schedule = state
        .db
        .call(move |conn| {
            schedules::update(conn, id, &spec)?;
            schedules::get(conn, id)
        })
        .await?;
    Ok(Json(schedule))
}

#[derive(Debug, Serialize)]
struct ToggleResponse {
    enabled: bool,
}

async fn toggle_schedule(
    State(state): State<AppState>,
    CsrfChecked(session): CsrfChecked,
    Path(id): Path<i64>,
) -> ApiResult<Json<ToggleResponse>> {
    session.require(Permission::ManageSchedules)?;
    let enabled = state
        .db
        .call(move |conn| schedules::toggle(conn, id))
        .await?;
    Ok(Json(ToggleResponse { enabled }))
}

async fn delete_schedule(
    State(state): State<AppState>,
    CsrfChecked(session): CsrfChecked,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    session.require(Permission::ManageSchedules)?;
    state
        .db
        .call(move |conn| schedules::delete(conn, id))
        .await?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

#[derive(Debug, Serialize)]
struct RunNowResponse {
    job_id: String,
}

/// Enqueues a job for a schedule immediately, outside its cron cadence.
async fn run_now(
    State(state): State<AppState>,
    CsrfChecked(session): CsrfChecked,
    Path(id): Path<i64>,
) -> ApiResult<Json<RunNowResponse>> {
    session.require(Permission::ManageSchedules)?;
    let schedule = state.db.call(move |conn| schedules::get(conn, id)).await?;

    let job_id = state
        .dispatcher
        .enqueue(NewRunJob {
            scope: schedule.scope,
            dates: DateSelection::Auto,
            skip_download: false,
            dry_run: false,
            requested_by: Some(format!("{}:run-now", session.username)),
        })
        .await?;
    let _ = state.dispatcher.dispatch_next().await?;
    Ok(Json(RunNowResponse {
        job_id: job_id.to_string(),
    }))
}
