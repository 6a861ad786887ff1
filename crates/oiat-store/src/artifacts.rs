//! Run artifacts: the per-(tenant, date) record of what a run produced.
//!
//! Artifacts are written once by the orchestrator at completion and are
//! read-only afterwards. Re-running a date supersedes the prior artifact
//! rather than overwriting it, so history stays auditable.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use oiat_core::{Error, Result, RunJobId, TenantKey};

/// Reconciliation outcome attached to an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStatus {
    /// Source and remote totals agree within tolerance.
    Match,
    /// Totals disagree beyond tolerance.
    Mismatch,
    /// Reconciliation could not run.
    NotRun,
}

impl ReconcileStatus {
    /// Stable string form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::Mismatch => "mismatch",
            Self::NotRun => "not_run",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "match" => Ok(Self::Match),
            "mismatch" => Ok(Self::Mismatch),
            "not_run" => Ok(Self::NotRun),
            other => Err(Error::storage(format!("unknown reconcile status '{other}'"))),
        }
    }
}

/// One run artifact.
#[derive(Debug, Clone, Serialize)]
pub struct RunArtifact {
    /// Owning run job, if known.
    pub job_id: Option<RunJobId>,
    /// Tenant the artifact belongs to.
    pub tenant_key: TenantKey,
    /// Business date that was processed.
    pub target_date: NaiveDate,
    /// Rows read from the raw input.
    pub rows_in: u64,
    /// Documents created remotely.
    pub docs_created: u64,
    /// Documents skipped as duplicates.
    pub docs_skipped_dup: u64,
    /// Documents that failed remote validation.
    pub docs_failed: u64,
    /// Source-side monetary total.
    pub source_total: f64,
    /// Remote-side monetary total.
    pub remote_total: f64,
    /// `source_total - remote_total`.
    pub difference: f64,
    /// Reconciliation outcome.
    pub reconcile_status: ReconcileStatus,
    /// When the orchestrator finished this date.
    pub processed_at: DateTime<Utc>,
}

fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<(RunArtifact, bool)> {
    let job_id: Option<String> = row.get("job_id")?;
    let tenant: String = row.get("tenant_key")?;
    let date: String = row.get("target_date")?;
    let status: String = row.get("reconcile_status")?;
    let processed: String = row.get("processed_at")?;
    let superseded: bool = row.get("superseded")?;

    Ok((
        RunArtifact {
            job_id: job_id.and_then(|s| s.parse().ok()),
            tenant_key: TenantKey::new_unchecked(tenant),
            target_date: date.parse().unwrap_or_default(),
            rows_in: row.get::<_, i64>("rows_in")?.max(0) as u64,
            docs_created: row.get::<_, i64>("docs_created")?.max(0) as u64,
            docs_skipped_dup: row.get::<_, i64>("docs_skipped_dup")?.max(0) as u64,
            docs_failed: row.get::<_, i64>("docs_failed")?.max(0) as u64,
            source_total: row.get("source_total")?,
            remote_total: row.get("remote_total")?,
            difference: row.get("difference")?,
            reconcile_status: ReconcileStatus::parse(&status).unwrap_or(ReconcileStatus::NotRun),
            processed_at: DateTime::parse_from_rfc3339(&processed)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        },
        superseded,
    ))
}

const ARTIFACT_COLUMNS: &str = "job_id, tenant_key, target_date, rows_in, docs_created, \
     docs_skipped_dup, docs_failed, source_total, remote_total, difference, \
     reconcile_status, superseded, processed_at";

/// Marks prior artifacts for the (tenant, date) superseded, then inserts.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn supersede_and_insert(conn: &mut Connection, artifact: &RunArtifact) -> Result<()> {
    let tx = conn
        .transaction()
        .map_err(|e| Error::storage_with_source("start artifact transaction", e))?;

    tx.execute(
        "UPDATE run_artifacts SET superseded = 1 \
         WHERE tenant_key = ?1 AND target_date = ?2 AND superseded = 0",
        params![
            artifact.tenant_key.as_str(),
            artifact.target_date.to_string()
        ],
    )
    .map_err(|e| Error::storage_with_source("supersede artifacts", e))?;

    tx.execute(
        "INSERT INTO run_artifacts \
         (job_id, tenant_key, target_date, rows_in, docs_created, docs_skipped_dup, \
          docs_failed, source_total, remote_total, difference, reconcile_status, processed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            artifact.job_id.map(|id| id.to_string()),
            artifact.tenant_key.as_str(),
            artifact.target_date.to_string(),
            artifact.rows_in as i64,
            artifact.docs_created as i64,
            artifact.docs_skipped_dup as i64,
            artifact.docs_failed as i64,
            artifact.source_total,
            artifact.remote_total,
            artifact.difference,
            artifact.reconcile_status.as_str(),
            artifact.processed_at.to_rfc3339(),
        ],
    )
    .map_err(|e| Error::storage_with_source("insert artifact", e))?;

    tx.commit()
        .map_err(|e| Error::storage_with_source("commit artifact", e))?;
    Ok(())
}

/// Returns the current (non-superseded) artifact for a (tenant, date).
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn current_for(
    conn: &Connection,
    tenant: &TenantKey,
    date: NaiveDate,
) -> Result<Option<RunArtifact>> {
    use rusqlite::OptionalExtension;
    conn.query_row(
        &format!(
            "SELECT {ARTIFACT_COLUMNS} FROM run_artifacts \
             WHERE tenant_key = ?1 AND target_date = ?2 AND superseded = 0 \
             ORDER BY processed_at DESC LIMIT 1"
        ),
        params![tenant.as_str(), date.to_string()],
        artifact_from_row,
    )
    .optional()
    .map_err(|e| Error::storage_with_source("get current artifact", e))
    .map(|opt| opt.map(|(artifact, _)| artifact))
}

/// Lists artifacts attached to one job.
///
/// # Errors
///
/// Returns `Storage` on database failure.
pub fn list_for_job(conn: &Connection, job_id: RunJobId) -> Result<Vec<RunArtifact>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM run_artifacts WHERE job_id = ?1 \
             ORDER BY target_date"
        ))
        .map_err(|e| Error::storage_with_source("prepare artifact list", e))?;
    let rows = stmt
        .query_map([job_id.to_string()], artifact_from_row)
        .map_err(|e| Error::storage_with_source("list artifacts", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::storage_with_source("collect artifacts", e))?;
    Ok(rows.into_iter().map(|(artifact, _)| artifact).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn artifact(tenant: &str, date: &str, created: u64) -> RunArtifact {
        RunArtifact {
            job_id: Some(RunJobId::generate()),
            tenant_key: TenantKey::new(tenant).unwrap(),
            target_date: date.parse().unwrap(),
            rows_in: 500,
            docs_created: created,
            docs_skipped_dup: 0,
            docs_failed: 0,
            source_total: 125_000.0,
            remote_total: 125_000.0,
            difference: 0.0,
            reconcile_status: ReconcileStatus::Match,
            processed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::init(dir.path().join("p.sqlite")).await.unwrap();
        let mut conn = db.connect().unwrap();

        let a = artifact("company_a", "2025-12-27", 12);
        supersede_and_insert(&mut conn, &a).unwrap();

        let current = current_for(&conn, &a.tenant_key, a.target_date)
            .unwrap()
            .expect("artifact present");
        assert_eq!(current.docs_created, 12);
        assert_eq!(current.reconcile_status, ReconcileStatus::Match);
    }

    #[tokio::test]
    async fn rerun_supersedes_prior_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::init(dir.path().join("p.sqlite")).await.unwrap();
        let mut conn = db.connect().unwrap();

        let first = artifact("company_a", "2025-12-27", 12);
        supersede_and_insert(&mut conn, &first).unwrap();
        let second = artifact("company_a", "2025-12-27", 0);
        supersede_and_insert(&mut conn, &second).unwrap();

        let current = current_for(&conn, &first.tenant_key, first.target_date)
            .unwrap()
            .expect("artifact present");
        assert_eq!(current.docs_created, 0);

        // Both rows remain; only one is current.
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM run_artifacts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn list_for_job_filters_by_owner() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::init(dir.path().join("p.sqlite")).await.unwrap();
        let mut conn = db.connect().unwrap();

        let a = artifact("company_a", "2025-12-27", 1);
        supersede_and_insert(&mut conn, &a).unwrap();
        let b = artifact("company_a", "2025-12-28", 2);
        supersede_and_insert(&mut conn, &b).unwrap();

        let listed = list_for_job(&conn, a.job_id.unwrap()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].target_date, a.target_date);
    }
}
