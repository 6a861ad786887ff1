//! Run job lifecycle and the dispatcher lock row.
//!
//! Jobs are created `queued` and promoted to `running` by the dispatcher
//! inside a single transaction that also activates the lock row, so two
//! dispatchers can never claim different jobs at the same time. Terminal
//! updates release the lock row in the same transaction.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use oiat_core::{Error, Result, RunJobId, TenantKey};

/// Tenant scope of a run request.
///
/// Serializes as `"all"` or `{"single": "<tenant_key>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobScope {
    /// One tenant.
    Single(TenantKey),
    /// Every configured tenant.
    All,
}

impl JobScope {
    fn scope_str(&self) -> &'static str {
        match self {
            Self::Single(_) => "single",
            Self::All => "all",
        }
    }

    fn tenant_str(&self) -> Option<&str> {
        match self {
            Self::Single(key) => Some(key.as_str()),
            Self::All => None,
        }
    }
}

/// Date selection for a run request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateSelection {
    /// Resolve the target trading date at run time.
    Auto,
    /// One explicit date.
    Single(NaiveDate),
    /// An inclusive date range.
    Range {
        /// First date, inclusive.
        from: NaiveDate,
        /// Last date, inclusive.
        to: NaiveDate,
    },
}

/// Run job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for the dispatcher.
    Queued,
    /// Orchestrator process is (or should be) alive.
    Running,
    /// Terminal: exit code 0.
    Succeeded,
    /// Terminal: non-zero exit or reaped.
    Failed,
    /// Terminal: cancelled by an operator.
    Cancelled,
}

impl JobStatus {
    /// Stable string form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::storage(format!("unknown job status '{other}'"))),
        }
    }

    /// Whether the status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// A run request before it is enqueued.
#[derive(Debug, Clone)]
pub struct NewRunJob {
    /// Tenant scope.
    pub scope: JobScope,
    /// Date selection.
    pub dates: DateSelection,
    /// Reuse staged split files instead of downloading.
    pub skip_download: bool,
    /// Perform no remote writes.
    pub dry_run: bool,
    /// Who asked for this run (username or "scheduler").
    pub requested_by: Option<String>,
}

/// A persisted run job.
#[derive(Debug, Clone, Serialize)]
pub struct RunJob {
    /// Immutable identifier.
    pub id: RunJobId,
    /// Tenant scope.
    pub scope: JobScope,
    /// Date selection.
    pub dates: DateSelection,
    /// Reuse staged split files instead of downloading.
    pub skip_download: bool,
    /// Perform no remote writes.
    pub dry_run: bool,
    /// Current status.
    pub status: JobStatus,
    /// Orchestrator PID while running.
    pub pid: Option<i32>,
    /// Exit code once terminal.
    pub exit_code: Option<i32>,
    /// Path to the job log file.
    pub log_path: Option<String>,
    /// Who asked for this run.
    pub requested_by: Option<String>,
    /// Concise failure reason (empty while healthy).
    pub failure_reason: String,
    /// Whether an operator asked for cancellation.
    pub cancel_requested: bool,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Promotion-to-running instant.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal instant.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Outcome of a transactional claim attempt.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// A job was flipped to running and the lock row is now active.
    Claimed(RunJob),
    /// The lock row is held by another run.
    LockHeld,
    /// No queued jobs exist.
    Empty,
}

fn parse_date(s: Option<String>, column: &str) -> Result<Option<NaiveDate>> {
    s.map(|v| {
        v.parse()
            .map_err(|e| Error::storage(format!("bad {column} '{v}': {e}")))
    })
    .transpose()
}

fn parse_instant(s: Option<String>, column: &str) -> Result<Option<DateTime<Utc>>> {
    s.map(|v| {
        DateTime::parse_from_rfc3339(&v)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::storage(format!("bad {column} '{v}': {e}")))
    })
    .transpose()
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<RawJobRow> {
    Ok(RawJobRow {
        id: row.get("id")?,
        scope: row.get("scope")?,
        tenant_key: row.get("tenant_key")?,
        target_date: row.get("target_date")?,
        from_date: row.get("from_date")?,
        to_date: row.get("to_date")?,
        skip_download: row.get("skip_download")?,
        dry_run: row.get("dry_run")?,
        status: row.get("status")?,
        pid: row.get("pid")?,
        exit_code: row.get("exit_code")?,
        log_path: row.get("log_path")?,
        requested_by: row.get("requested_by")?,
        failure_reason: row.get("failure_reason")?,
        cancel_requested: row.get("cancel_requested")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
    })
}

struct RawJobRow {
    id: String,
    scope: String,
    tenant_key: Option<String>,
    target_date: Option<String>,
    from_date: Option<String>,
    to_date: Option<String>,
    skip_download: bool,
    dry_run: bool,
    status: String,
    pid: Option<i32>,
    exit_code: Option<i32>,
    log_path: Option<String>,
    requested_by: Option<String>,
    failure_reason: String,
    cancel_requested: bool,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl RawJobRow {
    fn into_job(self) -> Result<RunJob> {
        let scope = match self.scope.as_str() {
            "single" => {
                let key = self.tenant_key.ok_or_else(|| {
                    Error::storage("single-scope job row missing tenant_key")
                })?;
                JobScope::Single(TenantKey::new_unchecked(key))
            }
            "all" => JobScope::All,
            other => return Err(Error::storage(format!("unknown job scope '{other}'"))),
        };

        let dates = match (
            parse_date(self.target_date, "target_date")?,
            parse_date(self.from_date, "from_date")?,
            parse_date(self.to_date, "to_date")?,
        ) {
            (Some(date), _, _) => DateSelection::Single(date),
            (None, Some(from), Some(to)) => DateSelection::Range { from, to },
            _ => DateSelection::Auto,
        };

        Ok(RunJob {
            id: self.id.parse()?,
            scope,
            dates,
            skip_download: self.skip_download,
            dry_run: self.dry_run,
            status: JobStatus::parse(&self.status)?,
            pid: self.pid,
            exit_code: self.exit_code,
            log_path: self.log_path,
            requested_by: self.requested_by,
            failure_reason: self.failure_reason,
            cancel_requested: self.cancel_requested,
            created_at: parse_instant(Some(self.created_at), "created_at")?
                .unwrap_or_else(Utc::now),
            started_at: parse_instant(self.started_at, "started_at")?,
            finished_at: parse_instant(self.finished_at, "finished_at")?,
        })
    }
}

const JOB_COLUMNS: &str = "id, scope, tenant_key, target_date, from_date, to_date, \
     skip_download, dry_run, status, pid, exit_code, log_path, requested_by, \
     failure_reason, cancel_requested, created_at, started_at, finished_at";

/// Inserts a new queued job and returns its id.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn enqueue(conn: &Connection, new: &NewRunJob) -> Result<RunJobId> {
    let id = RunJobId::generate();
    let (target, from, to) = match new.dates {
        DateSelection::Auto => (None, None, None),
        DateSelection::Single(d) => (Some(d.to_string()), None, None),
        DateSelection::Range { from, to } => (None, Some(from.to_string()), Some(to.to_string())),
    };
    conn.execute(
        "INSERT INTO run_jobs \
         (id, scope, tenant_key, target_date, from_date, to_date, skip_download, dry_run, \
          status, requested_by, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'queued', ?9, ?10)",
        params![
            id.to_string(),
            new.scope.scope_str(),
            new.scope.tenant_str(),
            target,
            from,
            to,
            new.skip_download,
            new.dry_run,
            new.requested_by,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| Error::storage_with_source("enqueue run job", e))?;
    Ok(id)
}

/// Fetches one job by id.
///
/// # Errors
///
/// Returns `ResourceNotFound` when the id is unknown.
pub fn get(conn: &Connection, id: RunJobId) -> Result<RunJob> {
    let raw = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM run_jobs WHERE id = ?1"),
            [id.to_string()],
            job_from_row,
        )
        .optional()
        .map_err(|e| Error::storage_with_source("get run job", e))?;
    raw.ok_or_else(|| Error::resource_not_found("run job", id))?
        .into_job()
}

/// Lists the most recent jobs, newest first.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn list_recent(conn: &Connection, limit: u32) -> Result<Vec<RunJob>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM run_jobs ORDER BY created_at DESC LIMIT ?1"
        ))
        .map_err(|e| Error::storage_with_source("prepare list", e))?;
    let rows = stmt
        .query_map([limit], job_from_row)
        .map_err(|e| Error::storage_with_source("list run jobs", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::storage_with_source("collect run jobs", e))?;
    rows.into_iter().map(RawJobRow::into_job).collect()
}

/// Lists jobs currently in `running` status.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn running_jobs(conn: &Connection) -> Result<Vec<RunJob>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM run_jobs WHERE status = 'running' ORDER BY started_at"
        ))
        .map_err(|e| Error::storage_with_source("prepare running query", e))?;
    let rows = stmt
        .query_map([], job_from_row)
        .map_err(|e| Error::storage_with_source("query running jobs", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::storage_with_source("collect running jobs", e))?;
    rows.into_iter().map(RawJobRow::into_job).collect()
}

/// Returns whether the given scope already has a queued or running job.
///
/// Used by the schedule worker to coalesce overlapping fire instants.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn active_job_exists_for_scope(conn: &Connection, scope: &JobScope) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM run_jobs \
             WHERE status IN ('queued', 'running') AND scope = ?1 \
               AND (tenant_key IS ?2 OR tenant_key = ?2)",
            params![scope.scope_str(), scope.tenant_str()],
            |row| row.get(0),
        )
        .map_err(|e| Error::storage_with_source("count active jobs", e))?;
    Ok(count > 0)
}

/// Claims the oldest queued job: flips it to running and activates the
/// lock row in one transaction.
///
/// A stale lock row (active but owned by a terminal job) is self-healed
/// before the check.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn claim_next(conn: &mut Connection, holder: &str) -> Result<ClaimOutcome> {
    let tx = conn
        .transaction()
        .map_err(|e| Error::storage_with_source("start claim transaction", e))?;

    // Self-heal: clear the lock row if its owning job is already terminal.
    tx.execute(
        "UPDATE run_lock SET active = 0, holder = '', owner_job_id = NULL, acquired_at = NULL \
         WHERE id = 1 AND active = 1 AND owner_job_id IS NOT NULL \
           AND owner_job_id NOT IN (SELECT id FROM run_jobs WHERE status IN ('queued', 'running'))",
        [],
    )
    .map_err(|e| Error::storage_with_source("self-heal lock row", e))?;

    tx.execute(
        "INSERT OR IGNORE INTO run_lock (id, active) VALUES (1, 0)",
        [],
    )
    .map_err(|e| Error::storage_with_source("ensure lock row", e))?;

    let active: bool = tx
        .query_row("SELECT active FROM run_lock WHERE id = 1", [], |row| {
            row.get(0)
        })
        .map_err(|e| Error::storage_with_source("read lock row", e))?;
    if active {
        return Ok(ClaimOutcome::LockHeld);
    }

    let raw = tx
        .query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM run_jobs WHERE status = 'queued' \
                 ORDER BY created_at LIMIT 1"
            ),
            [],
            job_from_row,
        )
        .optional()
        .map_err(|e| Error::storage_with_source("select queued job", e))?;
    let Some(raw) = raw else {
        return Ok(ClaimOutcome::Empty);
    };

    let now = Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE run_jobs SET status = 'running', started_at = ?2, pid = 0 WHERE id = ?1",
        params![raw.id, now],
    )
    .map_err(|e| Error::storage_with_source("promote job", e))?;

    tx.execute(
        "UPDATE run_lock SET active = 1, holder = ?1, owner_job_id = ?2, acquired_at = ?3 \
         WHERE id = 1",
        params![holder, raw.id, now],
    )
    .map_err(|e| Error::storage_with_source("activate lock row", e))?;

    tx.commit()
        .map_err(|e| Error::storage_with_source("commit claim", e))?;

    let mut job = raw.into_job()?;
    job.status = JobStatus::Running;
    job.pid = Some(0);
    Ok(ClaimOutcome::Claimed(job))
}

/// Records the real PID and log path of a launched orchestrator.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn set_launched(conn: &Connection, id: RunJobId, pid: i32, log_path: &str) -> Result<()> {
    conn.execute(
        "UPDATE run_jobs SET pid = ?2, log_path = ?3 WHERE id = ?1",
        params![id.to_string(), pid, log_path],
    )
    .map_err(|e| Error::storage_with_source("record pid", e))?;
    Ok(())
}

/// Marks a job terminal and releases the lock row in the same transaction.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn finish(
    conn: &mut Connection,
    id: RunJobId,
    status: JobStatus,
    exit_code: i32,
    failure_reason: &str,
) -> Result<()> {
    debug_assert!(status.is_terminal());
    let tx = conn
        .transaction()
        .map_err(|e| Error::storage_with_source("start finish transaction", e))?;

    tx.execute(
        "UPDATE run_jobs SET status = ?2, exit_code = ?3, failure_reason = ?4, finished_at = ?5 \
         WHERE id = ?1",
        params![
            id.to_string(),
            status.as_str(),
            exit_code,
            failure_reason,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| Error::storage_with_source("finish job", e))?;

    tx.execute(
        "UPDATE run_lock SET active = 0, holder = '', owner_job_id = NULL, acquired_at = NULL \
         WHERE id = 1 AND owner_job_id = ?1",
        [id.to_string()],
    )
    .map_err(|e| Error::storage_with_source("release lock row", e))?;

    tx.commit()
        .map_err(|e| Error::storage_with_source("commit finish", e))?;
    Ok(())
}

/// Forcibly releases the lock row regardless of owner.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn force_release_lock(conn: &Connection) -> Result<()> {
    conn.execute(
        "UPDATE run_lock SET active = 0, holder = '', owner_job_id = NULL, acquired_at = NULL \
         WHERE id = 1",
        [],
    )
    .map_err(|e| Error::storage_with_source("force release lock row", e))?;
    Ok(())
}

/// Sets the cancel flag on a queued or running job.
///
/// Queued jobs flip straight to cancelled; running jobs are cancelled
/// cooperatively by the orchestrator at its next safe point.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn request_cancel(conn: &mut Connection, id: RunJobId) -> Result<()> {
    let job = get(conn, id)?;
    match job.status {
        JobStatus::Queued => finish(conn, id, JobStatus::Cancelled, 0, "cancelled before start"),
        JobStatus::Running => {
            conn.execute(
                "UPDATE run_jobs SET cancel_requested = 1 WHERE id = ?1",
                [id.to_string()],
            )
            .map_err(|e| Error::storage_with_source("request cancel", e))?;
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Reads the cancel flag for a running job.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn cancel_requested(conn: &Connection, id: RunJobId) -> Result<bool> {
    conn.query_row(
        "SELECT cancel_requested FROM run_jobs WHERE id = ?1",
        [id.to_string()],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| Error::storage_with_source("read cancel flag", e))
    .map(|v| v.unwrap_or(false))
}
