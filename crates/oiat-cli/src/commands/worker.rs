//! `oiat worker` - the schedule worker loop.

use clap::Args;
use tracing::error;

use oiat_core::StateDir;
use oiat_flow::ScheduleWorker;
use oiat_store::Database;

use super::dispatch::build_dispatcher;
use super::EXIT_FAILURE;

/// Arguments for `oiat worker`.
#[derive(Debug, Args)]
pub struct WorkerArgs {
    /// Orchestrator binary to spawn per job (default: this executable).
    #[arg(long)]
    pub orchestrator: Option<String>,
}

/// Runs the worker until the process is stopped.
pub async fn execute(args: WorkerArgs) -> i32 {
    let state = StateDir::from_env();
    let db = match Database::init(state.portal_db()).await {
        Ok(db) => db,
        Err(e) => {
            error!("could not open portal database: {e}");
            return EXIT_FAILURE;
        }
    };
    let dispatcher = match build_dispatcher(db.clone(), &state, args.orchestrator.as_deref()) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!("{e}");
            return EXIT_FAILURE;
        }
    };

    ScheduleWorker::new(db, dispatcher).run().await;
    EXIT_FAILURE // the loop never returns in normal operation
}
