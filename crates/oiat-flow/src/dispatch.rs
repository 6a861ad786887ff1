//! Job dispatcher.
//!
//! Consumes queued run jobs one at a time. Claiming a job is a single
//! database transaction (status flip + lock row); the filesystem run lock
//! is taken immediately after as the cross-process layer. The orchestrator
//! itself runs behind the [`JobLauncher`] seam, either as a subprocess of
//! the `oiat` binary (production: crash isolation, OS-probe-able PID) or
//! in-process (tests).
//!
//! Spawn failures are bounded: after five consecutive start failures the
//! dispatcher stops advancing and surfaces `StartFailed` so the caller can
//! alert instead of burning through the queue.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use metrics::counter;
use tracing::{error, info, warn};

use oiat_core::{Error, Result, RunJobId, StateDir};
use oiat_store::jobs::{self, ClaimOutcome, JobStatus, NewRunJob, RunJob};
use oiat_store::Database;

use crate::lock::{process_alive, AcquireOutcome, RunLock, RunLockGuard};

/// Consecutive start failures tolerated before giving up on the queue.
const MAX_CONSECUTIVE_START_FAILURES: u32 = 5;

/// Grace period for claimed-but-not-yet-launched jobs (placeholder PID).
const LAUNCH_GRACE_SECS: i64 = 60;

/// Exit code recorded when the reaper fails a job.
pub const REAPED_EXIT_CODE: i32 = -1;

/// Exit code for "blocked by existing lock".
pub const EXIT_BLOCKED_BY_LOCK: i32 = 2;

/// Exit code for "failed to spawn subprocess".
pub const EXIT_SPAWN_FAILED: i32 = 3;

/// Outcome of one dispatch attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchStatus {
    /// A job was launched.
    Started(RunJobId),
    /// A run is already active; the queue stays put.
    Queued,
    /// No queued jobs.
    Empty,
    /// Spawn failures hit the consecutive cap.
    StartFailed,
}

/// A launched orchestrator run.
pub struct LaunchedJob {
    /// OS process id (the current process for in-process launchers).
    pub pid: i32,
    /// Resolves to the run's exit code.
    pub wait: tokio::task::JoinHandle<i32>,
}

/// Seam between the dispatcher and the orchestrator execution style.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    /// Launches the orchestrator for a claimed job, logging to `log_path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the run cannot be started at all.
    async fn launch(&self, job: &RunJob, log_path: &Path) -> Result<LaunchedJob>;
}

/// Launches runs as subprocesses of the `oiat` binary.
///
/// Exit codes form the contract: 0 success, 1 failure, 2 blocked by lock,
/// 3 spawn failure, 126/127 unusable command.
pub struct SubprocessLauncher {
    program: PathBuf,
    state_dir: PathBuf,
}

impl SubprocessLauncher {
    /// Creates a launcher invoking `program` (normally the `oiat` binary).
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            state_dir: state_dir.into(),
        }
    }

    fn build_args(job: &RunJob) -> Vec<String> {
        let mut args = Vec::new();
        match &job.scope {
            oiat_store::JobScope::Single(tenant) => {
                args.push("run".to_string());
                args.push("--tenant".to_string());
                args.push(tenant.as_str().to_string());
            }
            oiat_store::JobScope::All => {
                args.push("run-all".to_string());
            }
        }
        match job.dates {
            oiat_store::DateSelection::Auto => {}
            oiat_store::DateSelection::Single(date) => {
                args.push("--date".to_string());
                args.push(date.to_string());
            }
            oiat_store::DateSelection::Range { from, to } => {
                args.push("--from".to_string());
                args.push(from.to_string());
                args.push("--to".to_string());
                args.push(to.to_string());
            }
        }
        if job.skip_download {
            args.push("--skip-download".to_string());
        }
        if job.dry_run {
            args.push("--dry-run".to_string());
        }
        args
    }
}

#[async_trait]
impl JobLauncher for SubprocessLauncher {
    async fn launch(&self, job: &RunJob, log_path: &Path) -> Result<LaunchedJob> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(parent.display().to_string(), e))?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| Error::io(log_path.display().to_string(), e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| Error::io(log_path.display().to_string(), e))?;

        let args = Self::build_args(job);
        info!(job_id = %job.id, program = %self.program.display(), ?args, "spawning orchestrator");

        let mut child = tokio::process::Command::new(&self.program)
            .args(&args)
            .env("OIAT_STATE_DIR", &self.state_dir)
            // The dispatcher already holds the filesystem lock on the
            // child's behalf; the child must not contend for it again.
            .env("OIAT_RUN_LOCK_HELD", "1")
            // Lets the child poll its own cancel flag and tag artifacts.
            .env("OIAT_JOB_ID", job.id.to_string())
            .stdout(std::process::Stdio::from(log))
            .stderr(std::process::Stdio::from(log_err))
            .spawn()
            .map_err(|e| Error::storage_with_source("spawn orchestrator subprocess", e))?;

        let pid = child.id().map_or(-1, |p| p as i32);
        let wait = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => status.code().unwrap_or(REAPED_EXIT_CODE),
                Err(_) => REAPED_EXIT_CODE,
            }
        });
        Ok(LaunchedJob { pid, wait })
    }
}

/// The dispatcher.
pub struct Dispatcher {
    db: Database,
    run_lock: RunLock,
    state: StateDir,
    launcher: Arc<dyn JobLauncher>,
    consecutive_start_failures: AtomicU32,
    /// Jobs running longer than this are reaped even if a (possibly
    /// recycled) PID still answers the liveness probe.
    stale_after: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher over the given store, lock, and launcher.
    #[must_use]
    pub fn new(db: Database, state: StateDir, launcher: Arc<dyn JobLauncher>) -> Self {
        let run_lock = RunLock::new(state.run_lock_file());
        Self {
            db,
            run_lock,
            state,
            launcher,
            consecutive_start_failures: AtomicU32::new(0),
            stale_after: Duration::hours(4),
        }
    }

    /// Overrides the stale-job threshold (tests).
    #[must_use]
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Enqueues a run request and returns the job id.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on database failure.
    pub async fn enqueue(&self, request: NewRunJob) -> Result<RunJobId> {
        let id = self
            .db
            .call(move |conn| jobs::enqueue(conn, &request))
            .await?;
        counter!("oiat_jobs_enqueued_total").increment(1);
        Ok(id)
    }

    /// Dispatches the oldest queued job, if any.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on database failure; launch problems are reported
    /// through the status, not as errors.
    pub fn dispatch_next<'a>(
        self: &'a Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<DispatchStatus>> + Send + 'a>>
    {
        Box::pin(self.dispatch_next_inner())
    }

    async fn dispatch_next_inner(self: &Arc<Self>) -> Result<DispatchStatus> {
        let claim = self
            .db
            .call(|conn| jobs::claim_next(conn, "dispatcher"))
            .await?;

        let job = match claim {
            ClaimOutcome::Empty => return Ok(DispatchStatus::Empty),
            ClaimOutcome::LockHeld => return Ok(DispatchStatus::Queued),
            ClaimOutcome::Claimed(job) => job,
        };

        // Second serialization layer: the cross-process filesystem lock.
        let guard = match self.run_lock.try_acquire(&format!("dispatcher:{}", job.id))? {
            AcquireOutcome::Acquired(guard) => guard,
            AcquireOutcome::HeldBy(info) => {
                // Someone outside the dispatcher (manual CLI run) holds the
                // host; put the job back and report queued.
                warn!(job_id = %job.id, holder = %info.holder, pid = info.pid, "filesystem lock held, requeueing");
                self.requeue(job.id).await?;
                return Ok(DispatchStatus::Queued);
            }
        };

        let log_path = self.state.run_log_file(job.id);
        match self.launcher.launch(&job, &log_path).await {
            Ok(launched) => {
                self.consecutive_start_failures.store(0, Ordering::Relaxed);
                let job_id = job.id;
                let pid = launched.pid;
                let log_display = log_path.display().to_string();
                self.db
                    .call(move |conn| jobs::set_launched(conn, job_id, pid, &log_display))
                    .await?;
                counter!("oiat_jobs_dispatched_total").increment(1);

                let monitor_self = Arc::clone(self);
                tokio::spawn(async move {
                    monitor_self.monitor(job_id, launched.wait, guard).await;
                });
                Ok(DispatchStatus::Started(job_id))
            }
            Err(e) => {
                let reason = format!("failed to start orchestrator: {}", e.failure_reason());
                error!(job_id = %job.id, "{reason}");
                let job_id = job.id;
                let reason_db = reason.clone();
                self.db
                    .call(move |conn| {
                        jobs::finish(conn, job_id, JobStatus::Failed, EXIT_SPAWN_FAILED, &reason_db)
                    })
                    .await?;
                drop(guard);
                counter!("oiat_jobs_start_failed_total").increment(1);

                let failures = self
                    .consecutive_start_failures
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                if failures >= MAX_CONSECUTIVE_START_FAILURES {
                    error!(failures, "too many consecutive start failures, backing off");
                    return Ok(DispatchStatus::StartFailed);
                }
                // Advance to the next queued job.
                self.dispatch_next().await
            }
        }
    }

    /// Drains the queue until it is empty or degraded.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on database failure.
    pub async fn drain(self: &Arc<Self>) -> Result<DispatchStatus> {
        loop {
            match self.dispatch_next().await? {
                DispatchStatus::Started(_) => continue,
                other => return Ok(other),
            }
        }
    }

    /// Marks running jobs whose process is gone as failed and releases
    /// both locks. Also clears a stale filesystem lock.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on database failure.
    pub async fn reconcile(&self) -> Result<u32> {
        let running = self.db.call(|conn| jobs::running_jobs(conn)).await?;
        let mut reaped = 0;
        let now = Utc::now();

        for job in running {
            let started = job.started_at.unwrap_or(job.created_at);
            let age = now.signed_duration_since(started);

            let dead = match job.pid {
                Some(pid) if pid > 0 => !process_alive(pid),
                // Placeholder PID: the dispatcher crashed between claim and
                // launch. Give the launch a grace window first.
                _ => age.num_seconds() > LAUNCH_GRACE_SECS,
            };
            // PID reuse can make a dead job look alive; past the stale
            // threshold the job is reaped regardless.
            let stale = age > self.stale_after;
            if !dead && !stale {
                continue;
            }

            let reason = if dead {
                "reaped stale PID"
            } else {
                "reaped: running past stale threshold"
            };
            warn!(job_id = %job.id, pid = ?job.pid, reason, "reaping run job");
            let job_id = job.id;
            self.db
                .call(move |conn| {
                    jobs::finish(conn, job_id, JobStatus::Failed, REAPED_EXIT_CODE, reason)
                })
                .await?;
            counter!("oiat_jobs_reaped_total").increment(1);
            reaped += 1;
        }

        // The filesystem lock may be orphaned independently of job rows.
        if self.run_lock.reap_if_stale()?.is_some() {
            self.db.call(|conn| jobs::force_release_lock(conn)).await?;
        }

        Ok(reaped)
    }

    async fn requeue(&self, job_id: RunJobId) -> Result<()> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE run_jobs SET status = 'queued', started_at = NULL, pid = NULL \
                     WHERE id = ?1",
                    [job_id.to_string()],
                )
                .map_err(|e| Error::storage_with_source("requeue job", e))?;
                jobs::force_release_lock(conn)
            })
            .await
    }

    async fn monitor(
        self: Arc<Self>,
        job_id: RunJobId,
        wait: tokio::task::JoinHandle<i32>,
        guard: RunLockGuard,
    ) {
        let exit_code = wait.await.unwrap_or(REAPED_EXIT_CODE);

        let (status, reason) = match exit_code {
            0 => (JobStatus::Succeeded, String::new()),
            EXIT_BLOCKED_BY_LOCK => (
                JobStatus::Failed,
                "blocked by existing lock".to_string(),
            ),
            code => (
                JobStatus::Failed,
                format!("orchestrator exited with code {code}"),
            ),
        };

        let reason_db = reason.clone();
        if let Err(e) = self
            .db
            .call(move |conn| jobs::finish(conn, job_id, status, exit_code, &reason_db))
            .await
        {
            error!(job_id = %job_id, "failed to record job completion: {e}");
        }
        if let Err(e) = guard.release() {
            warn!(job_id = %job_id, "failed to release run lock: {e}");
        }
        info!(job_id = %job_id, exit_code, status = status.as_str(), "job finished");

        // Keep the queue moving.
        if let Err(e) = self.drain().await {
            error!("post-completion dispatch failed: {e}");
        }
    }
}
