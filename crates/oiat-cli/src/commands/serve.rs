//! `oiat serve` - the operator API with an embedded schedule worker.
//!
//! The API, the schedule worker, and the dispatcher's reconcile sweep run
//! as concurrent tasks in one process; pipeline runs themselves are
//! spawned as subprocesses for crash isolation.

use std::net::SocketAddr;

use clap::Args;
use tracing::error;

use oiat_api::AppState;
use oiat_core::StateDir;
use oiat_flow::ScheduleWorker;
use oiat_store::Database;

use super::dispatch::build_dispatcher;
use super::{EXIT_FAILURE, EXIT_OK};

/// Arguments for `oiat serve`.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Listen address.
    #[arg(long, env = "OIAT_API_ADDR", default_value = "127.0.0.1:8488")]
    pub addr: SocketAddr,

    /// Orchestrator binary to spawn per job (default: this executable).
    #[arg(long)]
    pub orchestrator: Option<String>,

    /// Disable the embedded schedule worker (run it separately).
    #[arg(long)]
    pub no_worker: bool,
}

/// Serves until ctrl-c.
pub async fn execute(args: ServeArgs) -> i32 {
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

    if !args.no_worker {
        let worker = ScheduleWorker::new(db.clone(), dispatcher.clone());
        tokio::spawn(async move { worker.run().await });
    }

    let app_state = AppState::new(db, state, dispatcher);
    match oiat_api::serve(app_state, args.addr).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!("API server failed: {e}");
            EXIT_FAILURE
        }
    }
}
