//! Host-wide run lock.
//!
//! Two layers serialize pipeline runs: this filesystem lock (exclusive
//! create of a file carrying the owner PID) and the database lock row the
//! dispatcher flips transactionally. Neither is trusted alone.
//!
//! Stale detection probes whether the recorded PID is alive. The probe is
//! advisory and racy only against PID reuse, which is tolerated because
//! the reaper additionally requires the owning job to have been running
//! longer than a stale threshold before it clears anything.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use oiat_core::{Error, Result};

/// Contents of the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Description of the owner ("dispatcher:<job-id>", "cli:run").
    pub holder: String,
    /// Owning process id.
    pub pid: i32,
    /// Acquisition instant.
    pub acquired_at: DateTime<Utc>,
}

/// Result of a non-blocking acquire attempt.
#[derive(Debug)]
pub enum AcquireOutcome {
    /// The lock is now held; release by dropping or [`RunLockGuard::release`].
    Acquired(RunLockGuard),
    /// Another process holds the lock.
    HeldBy(LockInfo),
}

/// The filesystem run lock.
#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Creates a handle for the lock at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// # Errors
    ///
    /// Returns `Io`/`Storage` on filesystem failures. Contention is not an
    /// error; it is the `HeldBy` outcome.
    pub fn try_acquire(&self, holder: &str) -> Result<AcquireOutcome> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent.display().to_string(), e))?;
        }

        let info = LockInfo {
            holder: holder.to_string(),
            pid: std::process::id() as i32,
            acquired_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&info).map_err(|e| Error::Internal {
            message: format!("serialize lock info: {e}"),
        })?;

        // Exclusive create is the atomicity point.
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                use std::io::Write;
                file.write_all(&payload)
                    .and_then(|()| file.sync_all())
                    .map_err(|e| Error::io(self.path.display().to_string(), e))?;
                info!(path = %self.path.display(), holder, "run lock acquired");
                Ok(AcquireOutcome::Acquired(RunLockGuard {
                    path: self.path.clone(),
                    pid: info.pid,
                    released: false,
                }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let existing = self.read()?.unwrap_or(LockInfo {
                    holder: "unknown".to_string(),
                    pid: -1,
                    acquired_at: Utc::now(),
                });
                Ok(AcquireOutcome::HeldBy(existing))
            }
            Err(e) => Err(Error::io(self.path.display().to_string(), e)),
        }
    }

    /// Reads the current lock contents, if the lock exists.
    ///
    /// # Errors
    ///
    /// Returns `Io` on filesystem failures other than absence.
    pub fn read(&self) -> Result<Option<LockInfo>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str(&raw).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(self.path.display().to_string(), e)),
        }
    }

    /// Clears the lock when its recorded PID is no longer alive.
    ///
    /// Returns the stale lock info when a reap happened.
    ///
    /// # Errors
    ///
    /// Returns `Io` on filesystem failures.
    pub fn reap_if_stale(&self) -> Result<Option<LockInfo>> {
        let Some(info) = self.read()? else {
            return Ok(None);
        };
        if process_alive(info.pid) {
            return Ok(None);
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                warn!(
                    pid = info.pid,
                    holder = %info.holder,
                    "reaped stale run lock (owner process is gone)"
                );
                Ok(Some(info))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(self.path.display().to_string(), e)),
        }
    }
}

/// Guard for a held run lock; releases on drop.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    pid: i32,
    released: bool,
}

impl RunLockGuard {
    /// Explicitly releases the lock, surfacing errors.
    ///
    /// # Errors
    ///
    /// Returns `Io` when the unlink fails.
    pub fn release(mut self) -> Result<()> {
        self.do_release()
    }

    fn do_release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        // Only unlink our own lock: a reaper may have cleared it and
        // another process may have acquired since.
        let still_ours = fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str::<LockInfo>(&raw).ok())
            .is_some_and(|info| info.pid == self.pid);
        if !still_ours {
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(self.path.display().to_string(), e)),
        }
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        let _ = self.do_release();
    }
}

/// Probes whether a PID refers to a live process.
#[cfg(unix)]
#[allow(unsafe_code)]
#[must_use]
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // kill(pid, 0): delivery check without a signal. EPERM still means
    // the process exists.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Non-unix fallback: never reports dead, so the reaper stays inert
/// rather than killing healthy jobs.
#[cfg(not(unix))]
#[must_use]
pub fn process_alive(_pid: i32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_in(dir: &Path) -> RunLock {
        RunLock::new(dir.join("runtime").join("global_run.lock"))
    }

    #[test]
    fn acquire_writes_pid_and_release_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path());

        let AcquireOutcome::Acquired(guard) = lock.try_acquire("cli:run").unwrap() else {
            panic!("expected acquisition");
        };

        let info = lock.read().unwrap().expect("lock file present");
        assert_eq!(info.pid, std::process::id() as i32);
        assert_eq!(info.holder, "cli:run");

        guard.release().unwrap();
        assert!(lock.read().unwrap().is_none());
    }

    #[test]
    fn second_acquire_reports_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path());

        let AcquireOutcome::Acquired(_guard) = lock.try_acquire("first").unwrap() else {
            panic!("expected acquisition");
        };
        match lock.try_acquire("second").unwrap() {
            AcquireOutcome::HeldBy(info) => {
                assert_eq!(info.holder, "first");
                assert_eq!(info.pid, std::process::id() as i32);
            }
            AcquireOutcome::Acquired(_) => panic!("lock should be held"),
        }
    }

    #[test]
    fn drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path());
        {
            let AcquireOutcome::Acquired(_guard) = lock.try_acquire("scoped").unwrap() else {
                panic!("expected acquisition");
            };
        }
        assert!(lock.read().unwrap().is_none());
    }

    #[test]
    fn reap_clears_dead_pid() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path());
        fs::create_dir_all(lock.path().parent().unwrap()).unwrap();

        // Write a lock owned by a PID that cannot be alive.
        let stale = LockInfo {
            holder: "crashed".to_string(),
            pid: i32::MAX - 7,
            acquired_at: Utc::now(),
        };
        fs::write(lock.path(), serde_json::to_vec(&stale).unwrap()).unwrap();

        let reaped = lock.reap_if_stale().unwrap().expect("stale lock reaped");
        assert_eq!(reaped.holder, "crashed");
        assert!(lock.read().unwrap().is_none());
    }

    #[test]
    fn reap_leaves_live_lock_alone() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path());

        let AcquireOutcome::Acquired(_guard) = lock.try_acquire("alive").unwrap() else {
            panic!("expected acquisition");
        };
        assert!(lock.reap_if_stale().unwrap().is_none());
        assert!(lock.read().unwrap().is_some());
    }

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id() as i32));
        assert!(!process_alive(0));
        assert!(!process_alive(-4));
    }
}
