//! `oiat run` - the pipeline for one tenant.

use std::path::Path;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::Args;
use tracing::{error, info};

use oiat_core::business_date::{business_day_cutoff, business_timezone, target_trading_date};
use oiat_core::config::{load_company_config, InventorySyncMode};
use oiat_core::{CompanyConfig, Error, Result, RunJobId, StateDir, TenantKey};
use oiat_flow::lock::{AcquireOutcome, RunLock};
use oiat_flow::notify::{reconcile_label, Notifier, RunSummary};
use oiat_flow::pipeline::{Pipeline, PipelineReport, RunOptions, RunScope};
use oiat_flow::{CommandDownloader, CsvTransformer, PosDownloader, TracingSink};
use oiat_qbo::{OAuthCredentials, QboClient, TokenManager, TokenStore};
use oiat_store::artifacts::{self, ReconcileStatus, RunArtifact};
use oiat_store::{jobs, Database};

use super::{EXIT_BLOCKED, EXIT_FAILURE, EXIT_OK};

/// Arguments for `oiat run`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Tenant key to run.
    #[arg(long)]
    pub tenant: String,

    /// Single target date (YYYY-MM-DD). Default: the last closed trading
    /// day.
    #[arg(long, conflicts_with_all = ["from", "to"])]
    pub date: Option<NaiveDate>,

    /// Range start (requires --to).
    #[arg(long, requires = "to")]
    pub from: Option<NaiveDate>,

    /// Range end (requires --from).
    #[arg(long, requires = "from")]
    pub to: Option<NaiveDate>,

    /// Reuse staged split files instead of downloading.
    #[arg(long)]
    pub skip_download: bool,

    /// Inventory catalog sync behaviour for this run.
    #[arg(long, value_parser = ["inline", "upload_fast"])]
    pub inventory_sync_mode: Option<String>,

    /// Swap backdated-inventory lines to the fallback service item.
    #[arg(long = "bypass-inventory-startdate")]
    pub bypass_inventory_startdate: bool,

    /// Compute everything but issue no remote writes.
    #[arg(long)]
    pub dry_run: bool,

    /// External downloader command (the headless-browser driver).
    #[arg(long, env = "OIAT_DOWNLOADER", default_value = "epos-downloader")]
    pub downloader: String,
}

/// Runs the pipeline and maps the outcome to an exit code.
pub async fn execute(args: RunArgs) -> i32 {
    match run_tenant(&args).await {
        Ok(ExitDisposition::Success) => EXIT_OK,
        Ok(ExitDisposition::Blocked) => EXIT_BLOCKED,
        Err(e) => {
            error!(kind = e.kind(), "run failed: {}", e.failure_reason());
            match e {
                Error::LockHeld { .. } => EXIT_BLOCKED,
                _ => EXIT_FAILURE,
            }
        }
    }
}

pub(crate) enum ExitDisposition {
    Success,
    Blocked,
}

pub(crate) async fn run_tenant(args: &RunArgs) -> Result<ExitDisposition> {
    let state = StateDir::from_env();
    let tenant = TenantKey::new(args.tenant.clone())?;
    let mut config = load_company_config(&state.companies_dir(), &tenant)?;

    if let Some(mode) = &args.inventory_sync_mode {
        let inventory = config
            .inventory
            .get_or_insert_with(Default::default);
        inventory.sync_mode = match mode.as_str() {
            "upload_fast" => InventorySyncMode::UploadFast,
            _ => InventorySyncMode::Inline,
        };
    }

    let scope = resolve_scope(args, &config);
    info!(
        tenant = %tenant,
        scope = %scope.display(),
        realm = %config.qbo.realm_id,
        tax = ?config.qbo.tax,
        "starting pipeline run"
    );

    // Token store + realm safety check before anything touches the remote.
    let store = Arc::new(TokenStore::open(&state.token_db())?);
    store.verify_realm_match(&tenant, &config.qbo.realm_id)?;
    let manager = Arc::new(TokenManager::new(store, OAuthCredentials::from_env()?));
    let client = QboClient::connect(manager, tenant.clone(), config.qbo.realm_id.clone()).await?;

    // Host-wide exclusion, unless a parent dispatcher already holds it.
    let lock_held_by_parent = std::env::var("OIAT_RUN_LOCK_HELD").as_deref() == Ok("1");
    let _guard = if lock_held_by_parent {
        None
    } else {
        let lock = RunLock::new(state.run_lock_file());
        match lock.try_acquire(&format!("cli:run:{tenant}"))? {
            AcquireOutcome::Acquired(guard) => Some(guard),
            AcquireOutcome::HeldBy(info) => {
                eprintln!(
                    "blocked by existing lock (holder {}, pid {})",
                    info.holder, info.pid
                );
                return Ok(ExitDisposition::Blocked);
            }
        }
    };

    let downloader: Arc<dyn PosDownloader> =
        Arc::new(CommandDownloader::new(Path::new(&args.downloader)));
    let mut pipeline = Pipeline::new(
        state.clone(),
        config.clone(),
        downloader,
        Arc::new(CsvTransformer),
        client,
        Arc::new(TracingSink),
    );

    // When spawned by the dispatcher, poll our own cancel flag.
    let job_id = std::env::var("OIAT_JOB_ID")
        .ok()
        .and_then(|raw| raw.parse::<RunJobId>().ok());
    if let Some(job_id) = job_id {
        let portal_db = state.portal_db();
        pipeline = pipeline.with_cancel(Arc::new(move || {
            Database::init_blocking(portal_db.clone())
                .and_then(|db| {
                    let conn = db.connect()?;
                    jobs::cancel_requested(&conn, job_id)
                })
                .unwrap_or(false)
        }));
    }

    let options = RunOptions {
        skip_download: args.skip_download,
        dry_run: args.dry_run,
        bypass_inventory_start_date: args.bypass_inventory_startdate,
        reconcile_tolerance: None,
    };

    let report = pipeline.run(scope, &options).await;

    match report {
        Ok(report) => {
            record_artifacts(&state, &tenant, job_id, &report).await;
            send_summary(&config, &report, "succeeded").await;
            Ok(ExitDisposition::Success)
        }
        Err(e) => {
            let summary = RunSummary {
                tenant: tenant.to_string(),
                company_name: config.display_name.clone(),
                scope: scope.display(),
                status: "failed".to_string(),
                created: 0,
                skipped: 0,
                failed: 0,
                source_total: 0.0,
                remote_total: 0.0,
                reconcile_status: "not_run".to_string(),
                difference: 0.0,
                warnings: vec![e.failure_reason()],
            };
            Notifier::new().send(&config, &summary).await;
            Err(e)
        }
    }
}

fn resolve_scope(args: &RunArgs, config: &CompanyConfig) -> RunScope {
    match (args.date, args.from, args.to) {
        (Some(date), _, _) => RunScope::single(date),
        (None, Some(from), Some(to)) => RunScope { from, to },
        _ => {
            let trading = config.trading_day();
            let cutoff = if trading.enabled {
                oiat_core::business_date::Cutoff::new(trading.start_hour, trading.start_minute)
            } else {
                business_day_cutoff()
            };
            RunScope::single(target_trading_date(Utc::now(), business_timezone(), cutoff))
        }
    }
}

/// Writes one artifact row per processed date, superseding prior runs.
async fn record_artifacts(
    state: &StateDir,
    tenant: &TenantKey,
    job_id: Option<RunJobId>,
    report: &PipelineReport,
) {
    let Ok(db) = Database::init(state.portal_db()).await else {
        return;
    };
    for day in &report.dates {
        let artifact = RunArtifact {
            job_id,
            tenant_key: tenant.clone(),
            target_date: day.date,
            rows_in: day.rows_in,
            docs_created: day.upload.created,
            docs_skipped_dup: day.upload.skipped_dup,
            docs_failed: day.upload.failed,
            source_total: day.upload.source_total,
            remote_total: day.upload.remote_total,
            difference: day.upload.difference,
            reconcile_status: match day.upload.reconcile {
                oiat_flow::ReconcileOutcome::Match => ReconcileStatus::Match,
                oiat_flow::ReconcileOutcome::Mismatch => ReconcileStatus::Mismatch,
                oiat_flow::ReconcileOutcome::NotRun => ReconcileStatus::NotRun,
            },
            processed_at: Utc::now(),
        };
        if let Err(e) = db
            .call(move |conn| artifacts::supersede_and_insert(conn, &artifact))
            .await
        {
            error!("failed to record run artifact: {e}");
        }
    }
}

async fn send_summary(config: &CompanyConfig, report: &PipelineReport, status: &str) {
    let (mut created, mut skipped, mut failed) = (0, 0, 0);
    let (mut source_total, mut remote_total) = (0.0, 0.0);
    let mut reconcile_status = "match";
    for day in &report.dates {
        created += day.upload.created;
        skipped += day.upload.skipped_dup;
        failed += day.upload.failed;
        source_total += day.upload.source_total;
        remote_total += day.upload.remote_total;
        if day.upload.reconcile != oiat_flow::ReconcileOutcome::Match {
            reconcile_status = reconcile_label(day.upload.reconcile);
        }
    }
    let summary = RunSummary {
        tenant: config.company_key.to_string(),
        company_name: config.display_name.clone(),
        scope: report.scope.display(),
        status: if report.cancelled {
            "cancelled".to_string()
        } else {
            status.to_string()
        },
        created,
        skipped,
        failed,
        source_total,
        remote_total,
        reconcile_status: reconcile_status.to_string(),
        difference: (source_total - remote_total).abs(),
        warnings: report.warnings.clone(),
    };
    Notifier::new().send(config, &summary).await;
}
