//! `oiat reconcile-jobs` - one reaper sweep over running jobs.

use clap::Args;
use tracing::error;

use oiat_core::StateDir;
use oiat_store::Database;

use super::dispatch::build_dispatcher;
use super::{EXIT_FAILURE, EXIT_OK};

/// Arguments for `oiat reconcile-jobs`.
#[derive(Debug, Args)]
pub struct ReconcileArgs {}

/// Runs one sweep and prints the count.
pub async fn execute(_args: ReconcileArgs) -> i32 {
    let state = StateDir::from_env();
    let db = match Database::init(state.portal_db()).await {
        Ok(db) => db,
        Err(e) => {
            error!("could not open portal database: {e}");
            return EXIT_FAILURE;
        }
    };
    let dispatcher = match build_dispatcher(db, &state, None) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!("{e}");
            return EXIT_FAILURE;
        }
    };

    match dispatcher.reconcile().await {
        Ok(reaped) => {
            println!("reconciled {reaped} run job(s)");
            EXIT_OK
        }
        Err(e) => {
            error!("reconcile failed: {e}");
            EXIT_FAILURE
        }
    }
}
