//! Persistent OAuth token store, isolated per (tenant, realm).
//!
//! Tokens live in their own SQLite file with owner-only permissions; the
//! WAL/journal sidecars inherit the directory and are part of the store.
//! The store is opened once at startup and closed on shutdown, which is
//! also when the one-time DDL runs. All writes are single transactions.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use oiat_core::{Error, Result, TenantKey};

/// Safety margin before expiry: a token is refreshed this long before the
/// remote would reject it.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// One (tenant, realm) token record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    /// Bearer token for API calls.
    pub access_token: String,
    /// Long-lived refresh token.
    pub refresh_token: String,
    /// When the access token expires.
    pub access_expires_at: DateTime<Utc>,
    /// When the refresh token expires, if reported.
    pub refresh_expires_at: Option<DateTime<Utc>>,
    /// Environment tag ("production" or "sandbox").
    pub environment: String,
}

impl TokenRecord {
    /// Whether the access token is still usable (60 s safety margin).
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty()
            && now + Duration::seconds(EXPIRY_MARGIN_SECS) < self.access_expires_at
    }
}

/// File-backed token store.
#[derive(Debug)]
pub struct TokenStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl TokenStore {
    /// Opens (and if necessary creates) the store at `path`.
    ///
    /// Runs the DDL once and restricts file permissions to owner
    /// read/write. chmod failures on filesystems that do not support it
    /// (network shares) are tolerated.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the file cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::storage_with_source("create token store directory", e))?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::storage_with_source("open token store", e))?;
        conn.busy_timeout(std::time::Duration::from_secs(10))
            .map_err(|e| Error::storage_with_source("set token store busy timeout", e))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS qbo_tokens (
                tenant_key TEXT NOT NULL,
                realm_id TEXT NOT NULL UNIQUE,
                access_token TEXT NOT NULL DEFAULT '',
                refresh_token TEXT NOT NULL,
                access_expires_at INTEGER,
                refresh_expires_at INTEGER,
                updated_at INTEGER NOT NULL,
                environment TEXT NOT NULL DEFAULT 'production',
                PRIMARY KEY (tenant_key, realm_id)
            )",
        )
        .map_err(|e| Error::storage_with_source("initialize token store schema", e))?;

        restrict_permissions(path);

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the record for one (tenant, realm), if present.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on database failure.
    pub fn load(&self, tenant: &TenantKey, realm_id: &str) -> Result<Option<TokenRecord>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT access_token, refresh_token, access_expires_at, refresh_expires_at, environment \
             FROM qbo_tokens WHERE tenant_key = ?1 AND realm_id = ?2",
            params![tenant.as_str(), realm_id],
            |row| {
                Ok(TokenRecord {
                    access_token: row.get(0)?,
                    refresh_token: row.get(1)?,
                    access_expires_at: epoch_to_instant(row.get::<_, Option<i64>>(2)?),
                    refresh_expires_at: row
                        .get::<_, Option<i64>>(3)?
                        .map(|v| epoch_to_instant(Some(v))),
                    environment: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(|e| Error::storage_with_source("load tokens", e))
    }

    /// Loads records for many (tenant, realm) pairs in one pass.
    ///
    /// Missing pairs are simply absent from the result.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on database failure.
    pub fn load_batch(
        &self,
        keys: &[(TenantKey, String)],
    ) -> Result<Vec<((TenantKey, String), TokenRecord)>> {
        let mut out = Vec::with_capacity(keys.len());
        for (tenant, realm) in keys {
            if let Some(record) = self.load(tenant, realm)? {
                out.push(((tenant.clone(), realm.clone()), record));
            }
        }
        Ok(out)
    }

    /// Saves a record for one (tenant, realm) in a single transaction.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on database failure.
    pub fn save(&self, tenant: &TenantKey, realm_id: &str, record: &TokenRecord) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::storage_with_source("start token save", e))?;
        tx.execute(
            "INSERT OR REPLACE INTO qbo_tokens \
             (tenant_key, realm_id, access_token, refresh_token, access_expires_at, \
              refresh_expires_at, updated_at, environment) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tenant.as_str(),
                realm_id,
                record.access_token,
                record.refresh_token,
                record.access_expires_at.timestamp(),
                record.refresh_expires_at.map(|t| t.timestamp()),
                Utc::now().timestamp(),
                record.environment,
            ],
        )
        .map_err(|e| Error::storage_with_source("save tokens", e))?;
        tx.commit()
            .map_err(|e| Error::storage_with_source("commit token save", e))?;
        Ok(())
    }

    /// Bootstrap entry point: stores tokens handed back by the operator
    /// OAuth flow.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on database failure.
    pub fn store_from_oauth(
        &self,
        tenant: &TenantKey,
        realm_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_in_secs: i64,
        environment: &str,
    ) -> Result<()> {
        let record = TokenRecord {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            access_expires_at: Utc::now() + Duration::seconds(expires_in_secs),
            refresh_expires_at: None,
            environment: environment.to_string(),
        };
        self.save(tenant, realm_id, &record)
    }

    /// Safety check against cross-posting: errors when the tenant's stored
    /// realm differs from the configured one.
    ///
    /// # Errors
    ///
    /// Returns `Config` on a mismatch, `Storage` on database failure.
    pub fn verify_realm_match(&self, tenant: &TenantKey, expected_realm_id: &str) -> Result<()> {
        if self.load(tenant, expected_realm_id)?.is_some() {
            return Ok(());
        }
        let conn = self.lock();
        let stored: Option<String> = conn
            .query_row(
                "SELECT realm_id FROM qbo_tokens WHERE tenant_key = ?1",
                [tenant.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::storage_with_source("verify realm", e))?;
        match stored {
            Some(realm) if realm != expected_realm_id => Err(Error::config(format!(
                "realm mismatch for {tenant}: config says {expected_realm_id}, \
                 token store has {realm}; refusing to upload to the wrong company"
            ))),
            _ => Ok(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-write; the connection itself
        // is still usable for the next transaction.
        self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn epoch_to_instant(epoch: Option<i64>) -> DateTime<Utc> {
    epoch
        .and_then(|v| Utc.timestamp_opt(v, 0).single())
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        // Network shares may refuse chmod; reads and writes still work.
        tracing::warn!(path = %path.display(), error = %e, "could not restrict token store permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(key: &str) -> TenantKey {
        TenantKey::new(key).unwrap()
    }

    fn record(access: &str, expires_in: i64) -> TokenRecord {
        TokenRecord {
            access_token: access.into(),
            refresh_token: "refresh-1".into(),
            access_expires_at: Utc::now() + Duration::seconds(expires_in),
            refresh_expires_at: None,
            environment: "production".into(),
        }
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(&dir.path().join("qbo_tokens.sqlite")).unwrap();

        let t = tenant("company_a");
        store.save(&t, "9341", &record("tok", 3600)).unwrap();

        let loaded = store.load(&t, "9341").unwrap().expect("record present");
        assert_eq!(loaded.access_token, "tok");
        assert!(loaded.is_valid_at(Utc::now()));
    }

    #[test]
    fn missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(&dir.path().join("t.sqlite")).unwrap();
        assert!(store.load(&tenant("company_a"), "1").unwrap().is_none());
    }

    #[test]
    fn expiry_margin_is_sixty_seconds() {
        let fresh = record("tok", 120);
        let stale = record("tok", 30);
        let now = Utc::now();
        assert!(fresh.is_valid_at(now));
        assert!(!stale.is_valid_at(now));
    }

    #[test]
    fn batch_load_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(&dir.path().join("t.sqlite")).unwrap();

        let a = tenant("company_a");
        let b = tenant("company_b");
        store.save(&a, "1", &record("tok-a", 3600)).unwrap();

        let loaded = store
            .load_batch(&[(a.clone(), "1".into()), (b, "2".into())])
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].1.access_token, "tok-a");
    }

    #[test]
    fn realm_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(&dir.path().join("t.sqlite")).unwrap();

        let t = tenant("company_a");
        store.save(&t, "1111", &record("tok", 3600)).unwrap();

        assert!(store.verify_realm_match(&t, "1111").is_ok());
        let err = store.verify_realm_match(&t, "2222").unwrap_err();
        assert!(err.to_string().contains("realm mismatch"));
        // Unknown tenants pass (nothing stored to conflict with).
        assert!(store.verify_realm_match(&tenant("company_c"), "3").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn file_permissions_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sqlite");
        let _store = TokenStore::open(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn store_from_oauth_computes_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::open(&dir.path().join("t.sqlite")).unwrap();
        let t = tenant("company_a");

        store
            .store_from_oauth(&t, "1", "acc", "ref", 3600, "sandbox")
            .unwrap();
        let loaded = store.load(&t, "1").unwrap().unwrap();
        assert_eq!(loaded.environment, "sandbox");
        assert!(loaded.is_valid_at(Utc::now()));
    }
}
