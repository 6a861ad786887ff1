//! `oiat run-all` - the pipeline for every configured tenant.

use chrono::NaiveDate;
use clap::Args;
use tracing::{error, info};

use oiat_core::config::available_companies;
use oiat_core::StateDir;
use oiat_flow::lock::{AcquireOutcome, RunLock};

use super::run::{run_tenant, ExitDisposition, RunArgs};
use super::{EXIT_BLOCKED, EXIT_FAILURE, EXIT_OK};

/// Arguments for `oiat run-all`.
#[derive(Debug, Args)]
pub struct RunAllArgs {
    /// Single target date for every tenant (YYYY-MM-DD).
    #[arg(long, conflicts_with_all = ["from", "to"])]
    pub date: Option<NaiveDate>,

    /// Range start (requires --to).
    #[arg(long, requires = "to")]
    pub from: Option<NaiveDate>,

    /// Range end (requires --from).
    #[arg(long, requires = "from")]
    pub to: Option<NaiveDate>,

    /// Subset of tenants to run (default: all configured).
    #[arg(long, num_args = 1..)]
    pub tenants: Vec<String>,

    /// Keep going after a tenant fails (default is fail-fast).
    #[arg(long)]
    pub continue_on_failure: bool,

    /// Reuse staged split files instead of downloading (per tenant).
    #[arg(long)]
    pub skip_download: bool,

    /// Compute everything but issue no remote writes.
    #[arg(long)]
    pub dry_run: bool,

    /// External downloader command.
    #[arg(long, env = "OIAT_DOWNLOADER", default_value = "epos-downloader")]
    pub downloader: String,
}

/// Runs every selected tenant sequentially under one lock acquisition.
pub async fn execute(args: RunAllArgs) -> i32 {
    let state = StateDir::from_env();

    let all = available_companies(&state.companies_dir());
    if all.is_empty() {
        eprintln!("no runnable companies found in {}", state.companies_dir().display());
        return EXIT_FAILURE;
    }

    let selected: Vec<_> = if args.tenants.is_empty() {
        all
    } else {
        let requested: std::collections::BTreeSet<_> = args.tenants.iter().cloned().collect();
        let selected: Vec<_> = all
            .into_iter()
            .filter(|key| requested.contains(key.as_str()))
            .collect();
        let known: std::collections::BTreeSet<_> =
            selected.iter().map(|k| k.as_str().to_string()).collect();
        for unknown in requested.difference(&known) {
            eprintln!("ignoring unknown tenant: {unknown}");
        }
        selected
    };
    if selected.is_empty() {
        eprintln!("no runnable companies selected");
        return EXIT_FAILURE;
    }

    // One lock acquisition covers the whole batch; the per-tenant runs see
    // it as held-by-parent.
    let lock_held_by_parent = std::env::var("OIAT_RUN_LOCK_HELD").as_deref() == Ok("1");
    let _guard = if lock_held_by_parent {
        None
    } else {
        let lock = RunLock::new(state.run_lock_file());
        match lock.try_acquire("cli:run-all") {
            Ok(AcquireOutcome::Acquired(guard)) => {
                std::env::set_var("OIAT_RUN_LOCK_HELD", "1");
                Some(guard)
            }
            Ok(AcquireOutcome::HeldBy(info)) => {
                eprintln!(
                    "blocked by existing lock (holder {}, pid {})",
                    info.holder, info.pid
                );
                return EXIT_BLOCKED;
            }
            Err(e) => {
                error!("could not acquire run lock: {e}");
                return EXIT_FAILURE;
            }
        }
    };

    let mut failures = Vec::new();
    for tenant in &selected {
        info!(tenant = %tenant, "running pipeline");
        let run_args = RunArgs {
            tenant: tenant.as_str().to_string(),
            date: args.date,
            from: args.from,
            to: args.to,
            skip_download: args.skip_download,
            inventory_sync_mode: None,
            bypass_inventory_startdate: false,
            dry_run: args.dry_run,
            downloader: args.downloader.clone(),
        };
        match run_tenant(&run_args).await {
            Ok(ExitDisposition::Success) => {}
            Ok(ExitDisposition::Blocked) => {
                // Cannot happen while we hold the lock; treat as failure.
                failures.push(tenant.clone());
                if !args.continue_on_failure {
                    break;
                }
            }
            Err(e) => {
                error!(tenant = %tenant, "pipeline failed: {}", e.failure_reason());
                failures.push(tenant.clone());
                if !args.continue_on_failure {
                    break;
                }
            }
        }
    }

    if !lock_held_by_parent {
        std::env::remove_var("OIAT_RUN_LOCK_HELD");
    }

    if failures.is_empty() {
        println!("all company pipelines completed successfully");
        EXIT_OK
    } else {
        let names: Vec<_> = failures.iter().map(|k| k.as_str()).collect();
        eprintln!("completed with failures: {}", names.join(", "));
        EXIT_FAILURE
    }
}
