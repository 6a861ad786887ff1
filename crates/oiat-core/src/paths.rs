//! Typed helpers for the on-disk state layout.
//!
//! All runtime state hangs off one root directory (`OIAT_STATE_DIR`,
//! default `.`). Keeping the layout in one place means the orchestrator,
//! the dispatcher, and the archive step can never disagree about where a
//! spill file or a lock lives.
//!
//! ```text
//! <state>/
//!   qbo_tokens.sqlite
//!   oiat_portal.sqlite
//!   companies/<tenant_key>.json
//!   downloads/<Tenant_Dir>/
//!   uploads/range_raw/<Tenant_Dir>/<from>_to_<to>/
//!   uploads/spill_raw/<Tenant_Dir>/BookKeeping_raw_spill_<date>.csv
//!   Uploaded/<date>/
//!   <Tenant_Dir>/uploaded_docnumbers.json
//!   runtime/global_run.lock
//!   runtime/run_logs/<job_id>.log
//! ```

use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::id::RunJobId;

/// Root of the persisted state layout.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Creates a state directory handle rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves the root from `OIAT_STATE_DIR` (default: current directory).
    #[must_use]
    pub fn from_env() -> Self {
        let root = std::env::var("OIAT_STATE_DIR").unwrap_or_else(|_| ".".to_string());
        Self::new(root)
    }

    /// Returns the root path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Token store database file.
    #[must_use]
    pub fn token_db(&self) -> PathBuf {
        self.root.join("qbo_tokens.sqlite")
    }

    /// Dashboard database file (jobs, artifacts, schedules).
    #[must_use]
    pub fn portal_db(&self) -> PathBuf {
        self.root.join("oiat_portal.sqlite")
    }

    /// Per-tenant configuration directory.
    #[must_use]
    pub fn companies_dir(&self) -> PathBuf {
        self.root.join("companies")
    }

    /// Download area for raw POS exports.
    #[must_use]
    pub fn downloads_dir(&self, tenant_dir: &str) -> PathBuf {
        self.root.join("downloads").join(tenant_dir)
    }

    /// Staging directory for per-date split files of one range.
    #[must_use]
    pub fn staging_dir(&self, tenant_dir: &str, from: NaiveDate, to: NaiveDate) -> PathBuf {
        self.root
            .join("uploads")
            .join("range_raw")
            .join(tenant_dir)
            .join(format!("{from}_to_{to}"))
    }

    /// Spill directory for one tenant.
    #[must_use]
    pub fn spill_dir(&self, tenant_dir: &str) -> PathBuf {
        self.root.join("uploads").join("spill_raw").join(tenant_dir)
    }

    /// Spill file for one (tenant, date).
    #[must_use]
    pub fn spill_file(&self, tenant_dir: &str, date: NaiveDate) -> PathBuf {
        self.spill_dir(tenant_dir)
            .join(format!("BookKeeping_raw_spill_{date}.csv"))
    }

    /// Split file name for one date inside a staging directory.
    #[must_use]
    pub fn split_file_name(date: NaiveDate) -> String {
        format!("BookKeeping_{date}.csv")
    }

    /// Combined (split + spill) file name for one date.
    #[must_use]
    pub fn combined_file_name(date: NaiveDate) -> String {
        format!("CombinedRaw_{date}.csv")
    }

    /// Archive directory for one processed date.
    #[must_use]
    pub fn archive_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join("Uploaded").join(date.to_string())
    }

    /// Ledger file of uploaded document numbers for one tenant.
    #[must_use]
    pub fn ledger_file(&self, tenant_dir: &str, file_name: &str) -> PathBuf {
        self.root.join(tenant_dir).join(file_name)
    }

    /// Global run lock file.
    #[must_use]
    pub fn run_lock_file(&self) -> PathBuf {
        self.root.join("runtime").join("global_run.lock")
    }

    /// Log file for one run job.
    #[must_use]
    pub fn run_log_file(&self, job_id: RunJobId) -> PathBuf {
        self.root
            .join("runtime")
            .join("run_logs")
            .join(format!("{job_id}.log"))
    }
}
