//! The `oiat` binary entry point.

use clap::Parser;

use oiat_cli::{Cli, Commands};
use oiat_core::observability::{init_logging, LogFormat};

fn main() {
    let format = if std::env::var("OIAT_LOG_FORMAT").as_deref() == Ok("json") {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_logging(format);

    let cli = Cli::parse();
    std::env::set_var("OIAT_STATE_DIR", &cli.state_dir);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(async {
        match cli.command {
            Commands::Run(args) => oiat_cli::commands::run::execute(args).await,
            Commands::RunAll(args) => oiat_cli::commands::run_all::execute(args).await,
            Commands::Dispatch(args) => oiat_cli::commands::dispatch::execute(args).await,
            Commands::Worker(args) => oiat_cli::commands::worker::execute(args).await,
            Commands::Serve(args) => oiat_cli::commands::serve::execute(args).await,
            Commands::ReconcileJobs(args) => {
                oiat_cli::commands::reconcile_jobs::execute(args).await
            }
            Commands::StoreTokens(args) => oiat_cli::commands::store_tokens::execute(args).await,
        }
    });
    std::process::exit(exit_code);
}
