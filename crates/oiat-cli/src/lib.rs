//! # oiat-cli
//!
//! Command-line interface for the OIAT automation platform.
//!
//! ## Commands
//!
//! - `oiat run` - Run the pipeline for one tenant
//! - `oiat run-all` - Run the pipeline for every configured tenant
//! - `oiat dispatch` - Drain the job queue once
//! - `oiat worker` - Run the schedule worker loop
//! - `oiat serve` - Serve the operator API (with an embedded worker)
//! - `oiat reconcile-jobs` - One reaper sweep over running jobs
//! - `oiat store-tokens` - Bootstrap OAuth tokens for a tenant
//!
//! ## Exit codes
//!
//! `0` success, `1` pipeline failure, `2` blocked by lock or invalid
//! usage, `3` failed to spawn a subprocess.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod commands;

use clap::{Parser, Subcommand};

/// OIAT - POS-to-accounting automation.
#[derive(Debug, Parser)]
#[command(name = "oiat")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root of the persisted state layout.
    #[arg(long, env = "OIAT_STATE_DIR", default_value = ".")]
    pub state_dir: String,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the pipeline for one tenant.
    Run(commands::run::RunArgs),
    /// Run the pipeline for every configured tenant, fail-fast.
    RunAll(commands::run_all::RunAllArgs),
    /// Drain the job queue once.
    Dispatch(commands::dispatch::DispatchArgs),
    /// Run the schedule worker loop.
    Worker(commands::worker::WorkerArgs),
    /// Serve the operator API.
    Serve(commands::serve::ServeArgs),
    /// Mark running jobs whose PID is gone as failed.
    ReconcileJobs(commands::reconcile_jobs::ReconcileArgs),
    /// Store OAuth tokens from the operator bootstrap flow.
    StoreTokens(commands::store_tokens::StoreTokensArgs),
}
