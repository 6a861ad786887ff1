//! Schedule worker: cron evaluation and job enqueueing.
//!
//! Every poll tick the worker reconciles stuck jobs, evaluates enabled
//! schedules against wall clock in each schedule's own timezone, enqueues
//! at most one job per due schedule (overlapping fire instants coalesce),
//! maintains the env-fallback schedule, drains the dispatcher, and
//! records a heartbeat the portal can display.
//!
//! Cron expressions are standard 5-field; a 6-field form with seconds is
//! also accepted and 5-field input is normalized by prepending `0`.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use metrics::counter;
use tracing::{info, warn};

use oiat_core::business_date::{business_day_cutoff, business_timezone, target_trading_date};
use oiat_core::Result;
use oiat_store::jobs::{self, DateSelection, NewRunJob};
use oiat_store::schedules::{self, RunSchedule, ScheduleSpec};
use oiat_store::{Database, JobScope};

use crate::dispatch::{DispatchStatus, Dispatcher};

/// Default poll interval.
pub const DEFAULT_POLL_SECONDS: u64 = 15;

/// Default env-fallback cron (daily at 18:00).
const DEFAULT_FALLBACK_CRON: &str = "0 18 * * *";

/// Name of the worker-owned fallback schedule row.
const FALLBACK_SCHEDULE_NAME: &str = "Legacy Env Fallback";

/// Counters for one worker tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickStats {
    /// Schedules that were due.
    pub due: u32,
    /// Jobs enqueued.
    pub queued: u32,
    /// Due schedules skipped because a run was already active.
    pub skipped_overlap: u32,
    /// Schedules skipped as invalid (bad cron or timezone).
    pub skipped_invalid: u32,
    /// Jobs reaped by the reconcile sweep.
    pub reaped: u32,
}

/// The schedule worker.
pub struct ScheduleWorker {
    db: Database,
    dispatcher: Arc<Dispatcher>,
    poll_interval: StdDuration,
}

impl ScheduleWorker {
    /// Creates a worker with the poll interval from
    /// `OIAT_SCHEDULER_POLL_SECONDS` (default 15).
    #[must_use]
    pub fn new(db: Database, dispatcher: Arc<Dispatcher>) -> Self {
        let poll_seconds = std::env::var("OIAT_SCHEDULER_POLL_SECONDS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(DEFAULT_POLL_SECONDS);
        Self::with_poll_interval(db, dispatcher, StdDuration::from_secs(poll_seconds))
    }

    /// Creates a worker with an explicit poll interval.
    #[must_use]
    pub fn with_poll_interval(
        db: Database,
        dispatcher: Arc<Dispatcher>,
        poll_interval: StdDuration,
    ) -> Self {
        Self {
            db,
            dispatcher,
            poll_interval,
        }
    }

    /// Poll interval in use.
    #[must_use]
    pub fn poll_interval(&self) -> StdDuration {
        self.poll_interval
    }

    /// Runs the worker loop until the process exits.
    pub async fn run(&self) {
        info!(poll_secs = self.poll_interval.as_secs(), "schedule worker started");
        loop {
            if let Err(e) = self.tick(Utc::now()).await {
                warn!("schedule worker tick failed: {e}");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One evaluation cycle at `now`.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on database failure; per-schedule problems are
    /// recorded on the schedule row instead.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickStats> {
        let mut stats = TickStats::default();

        stats.reaped = self.dispatcher.reconcile().await?;

        self.maintain_env_fallback(now).await?;

        let enabled = self.db.call(|conn| schedules::enabled(conn)).await?;
        for schedule in enabled {
            match self.evaluate_schedule(&schedule, now).await? {
                Evaluation::Queued => {
                    stats.due += 1;
                    stats.queued += 1;
                }
                Evaluation::SkippedOverlap => {
                    stats.due += 1;
                    stats.skipped_overlap += 1;
                }
                Evaluation::SkippedInvalid => stats.skipped_invalid += 1,
                Evaluation::NotDue => {}
            }
        }

        if stats.queued > 0 {
            match self.dispatcher.drain().await? {
                DispatchStatus::StartFailed => {
                    warn!("dispatcher degraded (consecutive start failures)");
                }
                _ => {}
            }
        }

        let heartbeat_now = now;
        self.db
            .call(move |conn| schedules::record_heartbeat(conn, heartbeat_now))
            .await?;

        counter!("oiat_scheduler_ticks_total").increment(1);
        Ok(stats)
    }

    async fn evaluate_schedule(
        &self,
        schedule: &RunSchedule,
        now: DateTime<Utc>,
    ) -> Result<Evaluation> {
        let parsed = match parse_cron(&schedule.cron_expr) {
            Ok(parsed) => parsed,
            Err(message) => {
                warn!(schedule = %schedule.name, "invalid cron expression: {message}");
                let id = schedule.id;
                self.db
                    .call(move |conn| schedules::set_evaluated(conn, id, now, None, &message))
                    .await?;
                return Ok(Evaluation::SkippedInvalid);
            }
        };
        let Ok(tz) = schedule.timezone.parse::<Tz>() else {
            let message = format!("invalid timezone: {}", schedule.timezone);
            warn!(schedule = %schedule.name, "{message}");
            let id = schedule.id;
            self.db
                .call(move |conn| schedules::set_evaluated(conn, id, now, None, &message))
                .await?;
            return Ok(Evaluation::SkippedInvalid);
        };

        // Fire when the next instant after the last evaluation has passed.
        // One enqueue per tick: overlapping missed instants coalesce.
        let base = schedule.last_evaluated.unwrap_or(schedule.created_at);
        let next_fire = next_fire_after(&parsed, base, tz);
        let due = next_fire.is_some_and(|t| t <= now);
        let upcoming = next_fire_after(&parsed, now, tz);

        if !due {
            let id = schedule.id;
            self.db
                .call(move |conn| schedules::set_evaluated(conn, id, base, upcoming, ""))
                .await?;
            return Ok(Evaluation::NotDue);
        }

        // Overlap skip: a queued or running job for the same scope means
        // this tick only records the evaluation.
        let scope = schedule.scope.clone();
        let overlap = {
            let scope = scope.clone();
            self.db
                .call(move |conn| jobs::active_job_exists_for_scope(conn, &scope))
                .await?
        };
        let id = schedule.id;
        self.db
            .call(move |conn| schedules::set_evaluated(conn, id, now, upcoming, ""))
            .await?;

        if overlap {
            info!(schedule = %schedule.name, "due but a run is already active; skipping");
            counter!("oiat_scheduler_fires_total", "outcome" => "skipped_overlap").increment(1);
            return Ok(Evaluation::SkippedOverlap);
        }

        let request = NewRunJob {
            scope,
            dates: DateSelection::Single(target_trading_date(
                now,
                business_timezone(),
                business_day_cutoff(),
            )),
            skip_download: false,
            dry_run: false,
            requested_by: Some(format!("schedule:{}", schedule.name)),
        };
        let job_id = self.dispatcher.enqueue(request).await?;
        info!(schedule = %schedule.name, %job_id, "schedule fired, job queued");
        counter!("oiat_scheduler_fires_total", "outcome" => "queued").increment(1);
        Ok(Evaluation::Queued)
    }

    /// Keeps the env-fallback schedule in sync: enabled only when the
    /// fallback is allowed and no user schedule is enabled.
    async fn maintain_env_fallback(&self, now: DateTime<Utc>) -> Result<()> {
        let fallback_allowed = env_flag("OIAT_SCHEDULER_ENABLE_ENV_FALLBACK", true);
        let (any_user, existing) = self
            .db
            .call(|conn| {
                Ok((
                    schedules::any_enabled_user_schedule(conn)?,
                    schedules::system_fallback(conn)?,
                ))
            })
            .await?;

        if !fallback_allowed || any_user {
            if let Some(fallback) = existing {
                if fallback.enabled {
                    info!("disabling env-fallback schedule (user schedules take precedence)");
                    let id = fallback.id;
                    self.db
                        .call(move |conn| {
                            schedules::toggle(conn, id)?;
                            Ok(())
                        })
                        .await?;
                }
            }
            return Ok(());
        }

        let cron_expr = std::env::var("SCHEDULE_CRON")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_FALLBACK_CRON.to_string());
        let timezone = std::env::var("SCHEDULE_TZ")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| business_timezone().name().to_string());

        let spec = ScheduleSpec {
            name: FALLBACK_SCHEDULE_NAME.to_string(),
            cron_expr,
            timezone,
            scope: JobScope::All,
            enabled: true,
        };

        match existing {
            Some(fallback) => {
                if fallback.cron_expr != spec.cron_expr
                    || fallback.timezone != spec.timezone
                    || !fallback.enabled
                {
                    let id = fallback.id;
                    self.db
                        .call(move |conn| schedules::update(conn, id, &spec))
                        .await?;
                    info!("env-fallback schedule refreshed from SCHEDULE_CRON/SCHEDULE_TZ");
                }
            }
            None => {
                self.db
                    .call(move |conn| schedules::create(conn, &spec, true))
                    .await?;
                info!(at = %now, "env-fallback schedule created");
            }
        }
        Ok(())
    }
}

enum Evaluation {
    Queued,
    SkippedOverlap,
    SkippedInvalid,
    NotDue,
}

/// Parses a cron expression, normalizing 5-field syntax to 6-field with
/// seconds.
fn parse_cron(expression: &str) -> std::result::Result<Schedule, String> {
    let field_count = expression.split_whitespace().count();
    let normalized = match field_count {
        5 => format!("0 {expression}"),
        6 => expression.to_string(),
        _ => {
            return Err(format!(
                "invalid cron expression (expected 5 or 6 fields): {expression}"
            ));
        }
    };
    Schedule::from_str(&normalized).map_err(|e| format!("invalid cron expression: {e}"))
}

/// Next fire instant strictly after `base`, evaluated in `tz`.
fn next_fire_after(schedule: &Schedule, base: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    schedule
        .after(&base.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{JobLauncher, LaunchedJob};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use oiat_core::StateDir;
    use std::path::Path;

    struct NeverLauncher;

    #[async_trait]
    impl JobLauncher for NeverLauncher {
        async fn launch(
            &self,
            _job: &oiat_store::RunJob,
            _log_path: &Path,
        ) -> Result<LaunchedJob> {
            Ok(LaunchedJob {
                pid: std::process::id() as i32,
                wait: tokio::spawn(async { 0 }),
            })
        }
    }

    async fn setup() -> (tempfile::TempDir, ScheduleWorker) {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());
        let db = Database::init(state.portal_db()).await.unwrap();
        let dispatcher = Arc::new(Dispatcher::new(db.clone(), state, Arc::new(NeverLauncher)));
        let worker =
            ScheduleWorker::with_poll_interval(db, dispatcher, StdDuration::from_secs(15));
        (dir, worker)
    }

    fn spec(name: &str, cron: &str) -> ScheduleSpec {
        ScheduleSpec {
            name: name.into(),
            cron_expr: cron.into(),
            timezone: "UTC".into(),
            scope: JobScope::All,
            enabled: true,
        }
    }

    #[test]
    fn five_field_cron_is_normalized() {
        assert!(parse_cron("0 18 * * *").is_ok());
        assert!(parse_cron("0 0 18 * * *").is_ok());
        assert!(parse_cron("whenever").is_err());
        assert!(parse_cron("* * *").is_err());
    }

    #[test]
    fn next_fire_respects_timezone() {
        let schedule = parse_cron("0 18 * * *").unwrap();
        let tz: Tz = "Africa/Lagos".parse().unwrap();
        let base = Utc.with_ymd_and_hms(2025, 12, 27, 12, 0, 0).unwrap();
        // 18:00 WAT == 17:00 UTC.
        let next = next_fire_after(&schedule, base, tz).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 12, 27, 17, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn due_schedule_enqueues_one_job() {
        std::env::set_var("OIAT_SCHEDULER_ENABLE_ENV_FALLBACK", "0");
        let (_dir, worker) = setup().await;

        // Runs every minute; the schedule was created "in the past" by
        // backdating last_evaluated.
        let id = worker
            .db
            .call(|conn| schedules::create(conn, &spec("minutely", "* * * * *"), false))
            .await
            .unwrap();
        let past = Utc::now() - chrono::Duration::minutes(10);
        worker
            .db
            .call(move |conn| schedules::set_evaluated(conn, id, past, None, ""))
            .await
            .unwrap();

        let stats = worker.tick(Utc::now()).await.unwrap();
        assert_eq!(stats.queued, 1);

        // Overlapping next tick coalesces: the queued job blocks a second
        // enqueue for the same scope... and the evaluation already moved
        // last_evaluated forward.
        let stats = worker.tick(Utc::now()).await.unwrap();
        assert_eq!(stats.queued, 0);
        std::env::remove_var("OIAT_SCHEDULER_ENABLE_ENV_FALLBACK");
    }

    #[tokio::test]
    async fn invalid_cron_is_recorded_not_fatal() {
        std::env::set_var("OIAT_SCHEDULER_ENABLE_ENV_FALLBACK", "0");
        let (_dir, worker) = setup().await;

        let id = worker
            .db
            .call(|conn| schedules::create(conn, &spec("broken", "not a cron"), false))
            .await
            .unwrap();

        let stats = worker.tick(Utc::now()).await.unwrap();
        assert_eq!(stats.skipped_invalid, 1);

        let schedule = worker
            .db
            .call(move |conn| schedules::get(conn, id))
            .await
            .unwrap();
        assert!(schedule.last_error.contains("invalid cron"));
        std::env::remove_var("OIAT_SCHEDULER_ENABLE_ENV_FALLBACK");
    }

    #[tokio::test]
    async fn not_due_schedule_records_next_fire() {
        std::env::set_var("OIAT_SCHEDULER_ENABLE_ENV_FALLBACK", "0");
        let (_dir, worker) = setup().await;

        let id = worker
            .db
            .call(|conn| schedules::create(conn, &spec("nightly", "0 18 * * *"), false))
            .await
            .unwrap();

        let stats = worker.tick(Utc::now()).await.unwrap();
        assert_eq!(stats.queued + stats.skipped_overlap, 0);

        let schedule = worker
            .db
            .call(move |conn| schedules::get(conn, id))
            .await
            .unwrap();
        assert!(schedule.next_fire.is_some());
        std::env::remove_var("OIAT_SCHEDULER_ENABLE_ENV_FALLBACK");
    }
}
