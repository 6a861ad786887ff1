//! `oiat dispatch` - drain the job queue once.

use std::sync::Arc;

use clap::Args;
use tracing::error;

use oiat_core::StateDir;
use oiat_flow::dispatch::{DispatchStatus, Dispatcher, SubprocessLauncher};
use oiat_store::Database;

use super::{EXIT_FAILURE, EXIT_OK};

/// Arguments for `oiat dispatch`.
#[derive(Debug, Args)]
pub struct DispatchArgs {
    /// Orchestrator binary to spawn per job (default: this executable).
    #[arg(long)]
    pub orchestrator: Option<String>,
}

/// Builds the standard subprocess dispatcher for this host.
pub(crate) fn build_dispatcher(
    db: Database,
    state: &StateDir,
    orchestrator: Option<&str>,
) -> oiat_core::Result<Arc<Dispatcher>> {
    let program = match orchestrator {
        Some(path) => std::path::PathBuf::from(path),
        None => std::env::current_exe()
            .map_err(|e| oiat_core::Error::storage_with_source("resolve current executable", e))?,
    };
    let launcher = Arc::new(SubprocessLauncher::new(program, state.root()));
    Ok(Arc::new(Dispatcher::new(db, state.clone(), launcher)))
}

/// Drains the queue and prints the final status.
pub async fn execute(args: DispatchArgs) -> i32 {
    let state = StateDir::from_env();
    let db = match Database::init(state.portal_db()).await {
        Ok(db) => db,
        Err(e) => {
            error!("could not open portal database: {e}");
            return EXIT_FAILURE;
        }
    };
    let dispatcher = match build_dispatcher(db, &state, args.orchestrator.as_deref()) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!("{e}");
            return EXIT_FAILURE;
        }
    };

    match dispatcher.drain().await {
        Ok(DispatchStatus::Empty) => {
            println!("queue drained");
            EXIT_OK
        }
        Ok(DispatchStatus::Queued) => {
            println!("a run is active; queue left intact");
            EXIT_OK
        }
        Ok(DispatchStatus::StartFailed) => {
            eprintln!("dispatcher degraded: consecutive start failures");
            EXIT_FAILURE
        }
        Ok(DispatchStatus::Started(_)) => EXIT_OK,
        Err(e) => {
            error!("dispatch failed: {e}");
            EXIT_FAILURE
        }
    }
}
