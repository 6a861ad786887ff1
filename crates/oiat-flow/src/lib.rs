//! # oiat-flow
//!
//! The OIAT pipeline substrate: date split and spill store, the document
//! ledger, the transformer seam, the idempotent upload engine, the
//! per-run orchestrator state machine, the host-wide run lock, the job
//! dispatcher, the schedule worker, and the notification sink.
//!
//! ## Control flow
//!
//! The schedule worker (or the operator API) enqueues a `RunJob`. The
//! dispatcher claims it transactionally, takes the filesystem run lock,
//! and launches the orchestrator. The orchestrator drives
//! download → split → merge → transform → upload → reconcile → archive
//! per date, with the upload engine consulting the token store and the
//! ledger. Artifacts and a notification summary come out the other end.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod dispatch;
pub mod download;
pub mod events;
pub mod inventory;
pub mod ledger;
pub mod lock;
pub mod notify;
pub mod pipeline;
pub mod scheduler;
pub mod split;
pub mod transform;
pub mod upload;

pub use dispatch::{DispatchStatus, Dispatcher, JobLauncher, SubprocessLauncher};
pub use download::{CommandDownloader, FixtureDownloader, PosDownloader};
pub use events::{CollectingSink, EventSink, PipelineEvent, PipelineEventData, TracingSink};
pub use ledger::Ledger;
pub use lock::{AcquireOutcome, RunLock, RunLockGuard};
pub use notify::{Notifier, RunSummary};
pub use pipeline::{Pipeline, PipelineReport, RunOptions, RunScope};
pub use scheduler::ScheduleWorker;
pub use transform::{CsvTransformer, Transformer};
pub use upload::{ReconcileOutcome, UploadOptions, UploadResult};
