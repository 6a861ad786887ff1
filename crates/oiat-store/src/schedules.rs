//! Persisted run schedules and the scheduler worker heartbeat.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use oiat_core::{Error, Result, TenantKey};

use crate::jobs::JobScope;

/// A persisted cron schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSchedule {
    /// Row identifier.
    pub id: i64,
    /// Unique human-readable name.
    pub name: String,
    /// Cron expression (5-field, standard semantics).
    pub cron_expr: String,
    /// IANA timezone the cron is evaluated in.
    pub timezone: String,
    /// Tenant scope derived from `scope`/`tenant_key`.
    pub scope: JobScope,
    /// Whether the schedule fires.
    pub enabled: bool,
    /// Whether this row is the env-fallback schedule (worker-owned).
    pub is_system_managed: bool,
    /// Last evaluation instant.
    pub last_evaluated: Option<DateTime<Utc>>,
    /// Next computed fire instant.
    pub next_fire: Option<DateTime<Utc>>,
    /// Last evaluation error (empty while healthy).
    pub last_error: String,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
}

/// Fields accepted when creating or updating a schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSpec {
    /// Unique human-readable name.
    pub name: String,
    /// Cron expression (5-field).
    pub cron_expr: String,
    /// IANA timezone.
    pub timezone: String,
    /// Tenant scope.
    pub scope: JobScope,
    /// Whether the schedule fires.
    pub enabled: bool,
}

fn parse_instant(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|v| {
        DateTime::parse_from_rfc3339(&v)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<RunSchedule> {
    let scope_str: String = row.get("scope")?;
    let tenant: Option<String> = row.get("tenant_key")?;
    let scope = if scope_str == "single" {
        JobScope::Single(TenantKey::new_unchecked(tenant.unwrap_or_default()))
    } else {
        JobScope::All
    };
    let created: String = row.get("created_at")?;

    Ok(RunSchedule {
        id: row.get("id")?,
        name: row.get("name")?,
        cron_expr: row.get("cron_expr")?,
        timezone: row.get("timezone")?,
        scope,
        enabled: row.get("enabled")?,
        is_system_managed: row.get("is_system_managed")?,
        last_evaluated: parse_instant(row.get("last_evaluated")?),
        next_fire: parse_instant(row.get("next_fire")?),
        last_error: row.get("last_error")?,
        created_at: parse_instant(Some(created)).unwrap_or_else(Utc::now),
    })
}

const SCHEDULE_COLUMNS: &str = "id, name, cron_expr, timezone, scope, tenant_key, enabled, \
     is_system_managed, last_evaluated, next_fire, last_error, created_at";

fn scope_fields(scope: &JobScope) -> (&'static str, Option<&str>) {
    match scope {
        JobScope::Single(key) => ("single", Some(key.as_str())),
        JobScope::All => ("all", None),
    }
}

/// Creates a schedule and returns its id.
///
/// # Errors
///
/// Returns `Storage` on database failure (including duplicate names).
pub fn create(conn: &Connection, spec: &ScheduleSpec, system_managed: bool) -> Result<i64> {
    let (scope, tenant) = scope_fields(&spec.scope);
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO run_schedules \
         (name, cron_expr, timezone, scope, tenant_key, enabled, is_system_managed, \
          created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            spec.name,
            spec.cron_expr,
            spec.timezone,
            scope,
            tenant,
            spec.enabled,
            system_managed,
            now,
        ],
    )
    .map_err(|e| Error::storage_with_source("create schedule", e))?;
    Ok(conn.last_insert_rowid())
}

/// Updates an existing schedule in place.
///
/// # Errors
///
/// Returns `ResourceNotFound` when the id is unknown.
pub fn update(conn: &Connection, id: i64, spec: &ScheduleSpec) -> Result<()> {
    let (scope, tenant) = scope_fields(&spec.scope);
    let changed = conn
        .execute(
            "UPDATE run_schedules SET name = ?2, cron_expr = ?3, timezone = ?4, scope = ?5, \
             tenant_key = ?6, enabled = ?7, next_fire = NULL, last_error = '', updated_at = ?8 \
             WHERE id = ?1",
            params![
                id,
                spec.name,
                spec.cron_expr,
                spec.timezone,
                scope,
                tenant,
                spec.enabled,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| Error::storage_with_source("update schedule", e))?;
    if changed == 0 {
        return Err(Error::resource_not_found("schedule", id));
    }
    Ok(())
}

/// Flips the enabled flag and returns the new value.
///
/// # Errors
///
/// Returns `ResourceNotFound` when the id is unknown.
pub fn toggle(conn: &Connection, id: i64) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE run_schedules SET enabled = NOT enabled, next_fire = NULL, updated_at = ?2 \
             WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )
        .map_err(|e| Error::storage_with_source("toggle schedule", e))?;
    if changed == 0 {
        return Err(Error::resource_not_found("schedule", id));
    }
    conn.query_row(
        "SELECT enabled FROM run_schedules WHERE id = ?1",
        [id],
        |row| row.get(0),
    )
    .map_err(|e| Error::storage_with_source("read toggled schedule", e))
}

/// Deletes a schedule.
///
/// # Errors
///
/// Returns `ResourceNotFound` when the id is unknown.
pub fn delete(conn: &Connection, id: i64) -> Result<()> {
    let changed = conn
        .execute("DELETE FROM run_schedules WHERE id = ?1", [id])
        .map_err(|e| Error::storage_with_source("delete schedule", e))?;
    if changed == 0 {
        return Err(Error::resource_not_found("schedule", id));
    }
    Ok(())
}

/// Fetches one schedule by id.
///
/// # Errors
///
/// Returns `ResourceNotFound` when the id is unknown.
pub fn get(conn: &Connection, id: i64) -> Result<RunSchedule> {
    conn.query_row(
        &format!("SELECT {SCHEDULE_COLUMNS} FROM run_schedules WHERE id = ?1"),
        [id],
        schedule_from_row,
    )
    .optional()
    .map_err(|e| Error::storage_with_source("get schedule", e))?
    .ok_or_else(|| Error::resource_not_found("schedule", id))
}

/// Lists every schedule, user-managed first.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn list(conn: &Connection) -> Result<Vec<RunSchedule>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM run_schedules ORDER BY is_system_managed, name"
        ))
        .map_err(|e| Error::storage_with_source("prepare schedule list", e))?;
    let rows = stmt
        .query_map([], schedule_from_row)
        .map_err(|e| Error::storage_with_source("list schedules", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::storage_with_source("collect schedules", e))?;
    Ok(rows)
}

/// Lists enabled schedules.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn enabled(conn: &Connection) -> Result<Vec<RunSchedule>> {
    Ok(list(conn)?.into_iter().filter(|s| s.enabled).collect())
}

/// Returns whether any enabled user (non-system) schedule exists.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn any_enabled_user_schedule(conn: &Connection) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM run_schedules WHERE enabled = 1 AND is_system_managed = 0",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::storage_with_source("count user schedules", e))?;
    Ok(count > 0)
}

/// Finds the system-managed fallback schedule, if present.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn system_fallback(conn: &Connection) -> Result<Option<RunSchedule>> {
    conn.query_row(
        &format!("SELECT {SCHEDULE_COLUMNS} FROM run_schedules WHERE is_system_managed = 1 LIMIT 1"),
        [],
        schedule_from_row,
    )
    .optional()
    .map_err(|e| Error::storage_with_source("get fallback schedule", e))
}

/// Records an evaluation: last-evaluated now, next fire as computed.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn set_evaluated(
    conn: &Connection,
    id: i64,
    evaluated_at: DateTime<Utc>,
    next_fire: Option<DateTime<Utc>>,
    last_error: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE run_schedules SET last_evaluated = ?2, next_fire = ?3, last_error = ?4, \
         updated_at = ?2 WHERE id = ?1",
        params![
            id,
            evaluated_at.to_rfc3339(),
            next_fire.map(|t| t.to_rfc3339()),
            last_error,
        ],
    )
    .map_err(|e| Error::storage_with_source("record evaluation", e))?;
    Ok(())
}

/// Updates the scheduler worker heartbeat (single row, id = 1).
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn record_heartbeat(conn: &Connection, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO worker_heartbeat (id, last_seen) VALUES (1, ?1) \
         ON CONFLICT(id) DO UPDATE SET last_seen = excluded.last_seen",
        [now.to_rfc3339()],
    )
    .map_err(|e| Error::storage_with_source("record heartbeat", e))?;
    Ok(())
}

/// Scheduler worker status derived from the heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// Whether the worker looks alive.
    pub running: bool,
    /// Last heartbeat, if any.
    pub last_seen: Option<DateTime<Utc>>,
}

/// Staleness multiplier: the worker is "not running" after missing this
/// many poll intervals.
const HEARTBEAT_STALE_MULTIPLIER: i64 = 3;

/// Reads the scheduler worker status for the portal.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn scheduler_status(conn: &Connection, poll_seconds: u64) -> Result<SchedulerStatus> {
    let last_seen: Option<String> = conn
        .query_row(
            "SELECT last_seen FROM worker_heartbeat WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::storage_with_source("read heartbeat", e))?;

    let last_seen = parse_instant(last_seen);
    let running = last_seen.is_some_and(|seen| {
        let age = Utc::now().signed_duration_since(seen).num_seconds();
        age <= poll_seconds as i64 * HEARTBEAT_STALE_MULTIPLIER
    });
    Ok(SchedulerStatus { running, last_seen })
}
