//! # oiat-store
//!
//! SQLite persistence for the OIAT dashboard state: run jobs, run
//! artifacts, run schedules, the dispatcher lock row, and the scheduler
//! worker heartbeat.
//!
//! The database is single-writer by convention (the dispatcher owns job
//! transitions, the orchestrator owns artifacts); readers use short
//! transactions over WAL.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod artifacts;
pub mod database;
pub mod jobs;
pub mod schedules;

pub use artifacts::{ReconcileStatus, RunArtifact};
pub use database::Database;
pub use jobs::{ClaimOutcome, DateSelection, JobScope, JobStatus, NewRunJob, RunJob};
pub use schedules::{RunSchedule, ScheduleSpec};
