//! SQLite database handle with schema migrations.
//!
//! One file holds the dashboard state: run jobs, artifacts, schedules, the
//! dispatcher lock row, and the scheduler heartbeat. Connections use WAL
//! mode with a busy timeout; migrations are forward-only and tracked with
//! `PRAGMA user_version`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;

use oiat_core::{Error, Result};

/// Current schema version. Increment when adding new migrations.
const SCHEMA_VERSION: i32 = 1;

/// V1 schema: creates all initial tables and indexes.
const V1_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS run_jobs (
    id TEXT PRIMARY KEY NOT NULL,
    scope TEXT NOT NULL,
    tenant_key TEXT,
    target_date TEXT,
    from_date TEXT,
    to_date TEXT,
    skip_download INTEGER NOT NULL DEFAULT 0,
    dry_run INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'queued',
    pid INTEGER,
    exit_code INTEGER,
    log_path TEXT,
    requested_by TEXT,
    failure_reason TEXT NOT NULL DEFAULT '',
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_run_jobs_status_created ON run_jobs(status, created_at);

CREATE TABLE IF NOT EXISTS run_artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT,
    tenant_key TEXT NOT NULL,
    target_date TEXT NOT NULL,
    rows_in INTEGER NOT NULL DEFAULT 0,
    docs_created INTEGER NOT NULL DEFAULT 0,
    docs_skipped_dup INTEGER NOT NULL DEFAULT 0,
    docs_failed INTEGER NOT NULL DEFAULT 0,
    source_total REAL NOT NULL DEFAULT 0,
    remote_total REAL NOT NULL DEFAULT 0,
    difference REAL NOT NULL DEFAULT 0,
    reconcile_status TEXT NOT NULL DEFAULT 'not_run',
    superseded INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_run_artifacts_tenant_date ON run_artifacts(tenant_key, target_date);

CREATE TABLE IF NOT EXISTS run_schedules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    cron_expr TEXT NOT NULL,
    timezone TEXT NOT NULL DEFAULT 'UTC',
    scope TEXT NOT NULL,
    tenant_key TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    is_system_managed INTEGER NOT NULL DEFAULT 0,
    last_evaluated TEXT,
    next_fire TEXT,
    last_error TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_lock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    active INTEGER NOT NULL DEFAULT 0,
    holder TEXT NOT NULL DEFAULT '',
    owner_job_id TEXT,
    acquired_at TEXT
);

CREATE TABLE IF NOT EXISTS worker_heartbeat (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_seen TEXT NOT NULL
);
";

/// SQLite database handle.
///
/// Cheap to clone; each operation opens its own connection, so the handle
/// can be shared across the scheduler, dispatcher and API tasks.
#[derive(Debug, Clone)]
pub struct Database {
    db_path: PathBuf,
}

impl Database {
    /// Initializes the database at the given path.
    ///
    /// Creates parent directories if needed, opens the SQLite file, and
    /// runs migrations.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the file cannot be opened or migrated.
    pub async fn init(db_path: PathBuf) -> Result<Self> {
        let path = db_path.clone();

        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::storage_with_source("create database directory", e))?;
            }
            let mut conn = open_connection(&path)?;
            run_migrations(&mut conn)?;
            Ok::<_, Error>(())
        })
        .await
        .map_err(|e| Error::Internal {
            message: format!("database init task failed: {e}"),
        })??;

        Ok(Self { db_path })
    }

    /// Synchronous variant of [`Database::init`] for CLI entry points that
    /// run before a runtime exists.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the file cannot be opened or migrated.
    pub fn init_blocking(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::storage_with_source("create database directory", e))?;
        }
        let mut conn = open_connection(&db_path)?;
        run_migrations(&mut conn)?;
        Ok(Self { db_path })
    }

    /// Runs a closure against a fresh connection on the blocking pool.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error, or `Internal` if the blocking task
    /// itself fails.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Internal {
            message: format!("database task failed: {e}"),
        })?
    }

    /// Opens a connection for synchronous callers (tests, CLI one-shots).
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the file cannot be opened.
    pub fn connect(&self) -> Result<Connection> {
        open_connection(&self.db_path)
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .map_err(|e| Error::storage_with_source("open database", e))?;
    configure_connection(&conn)?;
    Ok(conn)
}

/// Configures a connection with busy timeout and WAL mode.
fn configure_connection(conn: &Connection) -> Result<()> {
    conn.busy_timeout(Duration::from_secs(10))
        .map_err(|e| Error::storage_with_source("set busy timeout", e))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| Error::storage_with_source("set WAL mode", e))?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| Error::storage_with_source("enable foreign keys", e))?;
    Ok(())
}

/// Runs forward-only migrations tracked by `PRAGMA user_version`.
fn run_migrations(conn: &mut Connection) -> Result<()> {
    let current_version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| Error::storage_with_source("read schema version", e))?;

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .map_err(|e| Error::storage_with_source("start migration transaction", e))?;

    if current_version < 1 {
        tx.execute_batch(V1_SCHEMA)
            .map_err(|e| Error::storage_with_source("apply v1 schema", e))?;
    }

    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(|e| Error::storage_with_source("update schema version", e))?;
    tx.commit()
        .map_err(|e| Error::storage_with_source("commit migration", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_db_path() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("portal.sqlite");
        (dir, path)
    }

    #[tokio::test]
    async fn init_creates_tables_and_version() {
        let (_dir, path) = test_db_path();
        let db = Database::init(path.clone()).await.expect("init");

        let conn = db.connect().expect("connect");
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();

        for expected in [
            "run_jobs",
            "run_artifacts",
            "run_schedules",
            "run_lock",
            "worker_heartbeat",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }

        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let (_dir, path) = test_db_path();
        let _first = Database::init(path.clone()).await.expect("first init");
        let second = Database::init(path).await.expect("second init");
        second
            .call(|conn| {
                conn.query_row("SELECT 1", [], |_| Ok(()))
                    .map_err(|e| Error::storage_with_source("probe", e))
            })
            .await
            .expect("probe");
    }

    #[tokio::test]
    async fn init_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b").join("portal.sqlite");
        Database::init(nested.clone()).await.expect("init nested");
        assert!(nested.exists());
    }
}
