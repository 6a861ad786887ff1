//! Run endpoints: list, get, trigger, cancel, log tail.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use oiat_core::{RunJobId, TenantKey};
use oiat_store::jobs::{self, DateSelection, NewRunJob};
use oiat_store::{JobScope, RunJob};

use crate::auth::{Authenticated, CsrfChecked, Permission};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Maximum bytes returned per log-tail request.
const LOG_CHUNK_BYTES: u64 = 64 * 1024;

/// Routes under `/api/runs`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_runs).post(trigger_run))
        .route("/{id}", get(get_run))
        .route("/{id}/cancel", post(cancel_run))
        .route("/{id}/log", get(tail_log))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<u32>,
}

async fn list_runs(
    State(state): State<AppState>,
    _session: Authenticated,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<RunJob>>> {
    let default_limit = state.settings.read().await.run_history_limit;
    let limit = query.limit.unwrap_or(default_limit).min(500);
    let runs = state
        .db
        .call(move |conn| jobs::list_recent(conn, limit))
        .await?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<AppState>,
    _session: Authenticated,
    Path(id): Path<String>,
) -> ApiResult<Json<RunJob>> {
    let id: RunJobId = id.parse()?;
    let job = state.db.call(move |conn| jobs::get(conn, id)).await?;
    Ok(Json(job))
}

/// Body of `POST /api/runs`.
#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    /// Tenant to run, or absent for all tenants.
    pub tenant: Option<String>,
    /// Single target date.
    pub date: Option<NaiveDate>,
    /// Range start (with `to`).
    pub from: Option<NaiveDate>,
    /// Range end (with `from`).
    pub to: Option<NaiveDate>,
    /// Reuse staged split files.
    #[serde(default)]
    pub skip_download: bool,
    /// No remote writes.
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    job_id: RunJobId,
}

async fn trigger_run(
    State(state): State<AppState>,
    CsrfChecked(session): CsrfChecked,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<Json<TriggerResponse>> {
    session.require(Permission::TriggerRuns)?;

    let scope = match request.tenant {
        Some(tenant) => JobScope::Single(TenantKey::new(tenant)?),
        None => JobScope::All,
    };
    let dates = match (request.date, request.from, request.to) {
        (Some(date), None, None) => DateSelection::Single(date),
        (None, Some(from), Some(to)) if from <= to => DateSelection::Range { from, to },
        (None, Some(_), Some(_)) => {
            return Err(ApiError::bad_request("from must not be after to"));
        }
        (None, None, None) => DateSelection::Auto,
        _ => {
            return Err(ApiError::bad_request(
                "provide either date, or from and to together",
            ));
        }
    };

    let job_id = state
        .dispatcher
        .enqueue(NewRunJob {
            scope,
            dates,
            skip_download: request.skip_download,
            dry_run: request.dry_run,
            requested_by: Some(session.username.clone()),
        })
        .await?;
    // Kick the queue; LockHeld just leaves the job queued.
    let _ = state.dispatcher.dispatch_next().await?;

    Ok(Json(TriggerResponse { job_id }))
}

async fn cancel_run(
    State(state): State<AppState>,
    CsrfChecked(session): CsrfChecked,
    Path(id): Path<String>,
) -> ApiResult<Json<RunJob>> {
    session.require(Permission::TriggerRuns)?;
    let id: RunJobId = id.parse()?;
    let job = state
        .db
        .call(move |conn| {
            jobs::request_cancel(conn, id)?;
            jobs::get(conn, id)
        })
        .await?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
struct TailQuery {
    #[serde(default)]
    offset: u64,
}

#[derive(Debug, Serialize)]
struct TailResponse {
    chunk: String,
    next_offset: u64,
}

/// Byte-offset log tailing for the live run view.
async fn tail_log(
    State(state): State<AppState>,
    _session: Authenticated,
    Path(id): Path<String>,
    Query(query): Query<TailQuery>,
) -> ApiResult<Json<TailResponse>> {
    let id: RunJobId = id.parse()?;
    let job = state.db.call(move |conn| jobs::get(conn, id)).await?;
    let Some(log_path) = job.log_path else {
        return Ok(Json(TailResponse {
            chunk: String::new(),
            next_offset: query.offset,
        }));
    };

    let offset = query.offset;
    let (chunk, next_offset) = tokio::task::spawn_blocking(move || {
        read_chunk(std::path::Path::new(&log_path), offset)
    })
    .await
    .map_err(|e| ApiError::internal(format!("log read task failed: {e}")))?;

    Ok(Json(TailResponse { chunk, next_offset }))
}

fn read_chunk(path: &std::path::Path, offset: u64) -> (String, u64) {
    use std::io::{Read, Seek, SeekFrom};
    let Ok(mut file) = std::fs::File::open(path) else {
        return (String::new(), offset);
    };
    if file.seek(SeekFrom::Start(offset)).is_err() {
        return (String::new(), offset);
    }
    let mut buffer = vec![0_u8; LOG_CHUNK_BYTES as usize];
    let read = file.read(&mut buffer).unwrap_or(0);
    buffer.truncate(read);
    (
        String::from_utf8_lossy(&buffer).into_owned(),
        offset + read as u64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_chunk_pages_by_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        std::fs::write(&path, "hello world").unwrap();

        let (chunk, next) = read_chunk(&path, 0);
        assert_eq!(chunk, "hello world");
        assert_eq!(next, 11);

        let (chunk, next) = read_chunk(&path, 6);
        assert_eq!(chunk, "world");
        assert_eq!(next, 11);

        // Reading past the end yields an empty chunk, same offset.
        let (chunk, next) = read_chunk(&path, 11);
        assert!(chunk.is_empty());
        assert_eq!(next, 11);
    }

    #[test]
    fn missing_file_reads_empty() {
        let (chunk, next) = read_chunk(std::path::Path::new("/nonexistent/job.log"), 5);
        assert!(chunk.is_empty());
        assert_eq!(next, 5);
    }
}
