//! Command implementations, one module per subcommand.

pub mod dispatch;
pub mod reconcile_jobs;
pub mod run;
pub mod run_all;
pub mod serve;
pub mod store_tokens;
pub mod worker;

/// Exit code: success.
pub const EXIT_OK: i32 = 0;
/// Exit code: generic pipeline failure.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code: blocked by the run lock or invalid usage.
pub const EXIT_BLOCKED: i32 = 2;
