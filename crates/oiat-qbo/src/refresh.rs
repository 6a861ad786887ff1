//! OAuth2 refresh-token grant with per-key single-flight.
//!
//! Refreshes are serialized per (tenant, realm): concurrent callers queue
//! on a per-key async mutex, and whoever arrives after a successful
//! refresh observes the fresh record from the store instead of issuing a
//! second network call.
//!
//! Transport failures are retried up to three times with exponential
//! backoff (base 500 ms, factor 2, ±20 % jitter). Grant rejections
//! (`invalid_grant`, 401) are not retried; they need operator re-auth.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use oiat_core::{Error, Result, TenantKey};

use crate::store::{TokenRecord, TokenStore};

/// Production token endpoint for the refresh-token grant.
pub const DEFAULT_TOKEN_URL: &str = "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer";

const MAX_TRANSPORT_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Response body from the token endpoint.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
    #[serde(default)]
    x_refresh_token_expires_in: Option<i64>,
}

fn default_expires_in() -> i64 {
    3600
}

/// OAuth application credentials.
#[derive(Clone)]
pub struct OAuthCredentials {
    client_id: String,
    client_secret: SecretString,
}

impl OAuthCredentials {
    /// Builds credentials from explicit values.
    #[must_use]
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
        }
    }

    /// Reads `QBO_CLIENT_ID` / `QBO_CLIENT_SECRET` from the environment.
    ///
    /// # Errors
    ///
    /// Returns `CredentialMissing` when either variable is unset.
    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("QBO_CLIENT_ID").map_err(|_| Error::CredentialMissing {
            env_key: "QBO_CLIENT_ID".to_string(),
        })?;
        let client_secret =
            std::env::var("QBO_CLIENT_SECRET").map_err(|_| Error::CredentialMissing {
                env_key: "QBO_CLIENT_SECRET".to_string(),
            })?;
        Ok(Self::new(client_id, client_secret))
    }
}

impl std::fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Token lifecycle coordinator: store access plus serialized refresh.
pub struct TokenManager {
    store: Arc<TokenStore>,
    credentials: OAuthCredentials,
    token_url: String,
    http: reqwest::Client,
    refresh_locks: Mutex<HashMap<(TenantKey, String), Arc<Mutex<()>>>>,
}

impl TokenManager {
    /// Creates a manager over an opened store.
    #[must_use]
    pub fn new(store: Arc<TokenStore>, credentials: OAuthCredentials) -> Self {
        Self::with_token_url(store, credentials, DEFAULT_TOKEN_URL)
    }

    /// Creates a manager with a custom token endpoint (tests, sandboxes).
    #[must_use]
    pub fn with_token_url(
        store: Arc<TokenStore>,
        credentials: OAuthCredentials,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            credentials,
            token_url: token_url.into(),
            http: reqwest::Client::new(),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the backing store.
    #[must_use]
    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Returns a valid access token, refreshing if expired.
    ///
    /// # Errors
    ///
    /// Returns `TokenRefreshFailed` when no tokens are stored or the grant
    /// is rejected; `RemoteNetwork` after the transport retry budget.
    pub async fn valid_access_token(&self, tenant: &TenantKey, realm_id: &str) -> Result<String> {
        let record = self.store.load(tenant, realm_id)?;
        match record {
            Some(record) if record.is_valid_at(Utc::now()) => Ok(record.access_token),
            _ => Ok(self.refresh(tenant, realm_id).await?.access_token),
        }
    }

    /// Performs the refresh-token grant and persists the result.
    ///
    /// Concurrent calls for the same (tenant, realm) coalesce into one
    /// network refresh.
    ///
    /// # Errors
    ///
    /// Returns `TokenRefreshFailed` or `RemoteNetwork` as for
    /// [`Self::valid_access_token`].
    pub async fn refresh(&self, tenant: &TenantKey, realm_id: &str) -> Result<TokenRecord> {
        self.refresh_unless(tenant, realm_id, |record| record.is_valid_at(Utc::now()))
            .await
    }

    /// Refresh after the remote rejected `rejected_token` with a 401.
    ///
    /// Unlike [`Self::refresh`], this ignores the stored expiry (a revoked
    /// token can be rejected before it expires) but still coalesces: if a
    /// concurrent caller already replaced the rejected token, the stored
    /// record is returned without a second grant.
    ///
    /// # Errors
    ///
    /// As for [`Self::refresh`].
    pub async fn refresh_after_unauthorized(
        &self,
        tenant: &TenantKey,
        realm_id: &str,
        rejected_token: &str,
    ) -> Result<TokenRecord> {
        let rejected = rejected_token.to_string();
        self.refresh_unless(tenant, realm_id, move |record| {
            record.access_token != rejected && record.is_valid_at(Utc::now())
        })
        .await
    }

    async fn refresh_unless(
        &self,
        tenant: &TenantKey,
        realm_id: &str,
        already_fresh: impl Fn(&TokenRecord) -> bool,
    ) -> Result<TokenRecord> {
        let key_lock = self.key_lock(tenant, realm_id).await;
        let _guard = key_lock.lock().await;

        let record = self
            .store
            .load(tenant, realm_id)?
            .ok_or_else(|| Error::TokenRefreshFailed {
                message: format!(
                    "no tokens stored for {tenant} (realm {realm_id}); run the OAuth bootstrap first"
                ),
            })?;

        // A concurrent caller may have refreshed while we queued.
        if already_fresh(&record) {
            return Ok(record);
        }

        if record.refresh_token.is_empty() {
            return Err(Error::TokenRefreshFailed {
                message: format!("no refresh token for {tenant} (realm {realm_id}); re-authenticate"),
            });
        }

        let response = self.grant_with_retries(&record.refresh_token).await?;

        let refreshed = TokenRecord {
            access_token: response.access_token,
            refresh_token: response
                .refresh_token
                .unwrap_or_else(|| record.refresh_token.clone()),
            access_expires_at: Utc::now() + chrono::Duration::seconds(response.expires_in),
            refresh_expires_at: response
                .x_refresh_token_expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            environment: record.environment,
        };
        self.store.save(tenant, realm_id, &refreshed)?;
        info!(tenant = %tenant, realm = realm_id, "access token refreshed");
        Ok(refreshed)
    }

    async fn grant_with_retries(&self, refresh_token: &str) -> Result<RefreshResponse> {
        let mut backoff = BACKOFF_BASE;
        let mut attempt = 0;

        loop {
            match self.grant_once(refresh_token).await {
                Ok(response) => return Ok(response),
                Err(GrantError::Transport(e)) => {
                    attempt += 1;
                    if attempt > MAX_TRANSPORT_RETRIES {
                        return Err(Error::network("token refresh transport failure", e));
                    }
                    let delay = jittered(backoff);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "token refresh transport error, retrying");
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(GrantError::Rejected(message)) => {
                    return Err(Error::TokenRefreshFailed { message });
                }
            }
        }
    }

    async fn grant_once(&self, refresh_token: &str) -> std::result::Result<RefreshResponse, GrantError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(
                &self.credentials.client_id,
                Some(self.credentials.client_secret.expose_secret()),
            )
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(GrantError::Transport)?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(GrantError::Transport);
        }

        let body = response.text().await.unwrap_or_default();
        let message = if status == StatusCode::UNAUTHORIZED {
            if body.contains("invalid_client") {
                "invalid client id or secret (401 invalid_client); check QBO_CLIENT_ID/QBO_CLIENT_SECRET".to_string()
            } else {
                format!("authentication failed (401): {body}")
            }
        } else if status == StatusCode::BAD_REQUEST && body.contains("invalid_grant") {
            "refresh token is invalid or expired (400 invalid_grant); re-authenticate".to_string()
        } else {
            format!("token endpoint returned {status}: {body}")
        };
        Err(GrantError::Rejected(message))
    }

    async fn key_lock(&self, tenant: &TenantKey, realm_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry((tenant.clone(), realm_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

enum GrantError {
    Transport(reqwest::Error),
    Rejected(String),
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::rng().random_range(0.8..=1.2);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tenant(key: &str) -> TenantKey {
        TenantKey::new(key).unwrap()
    }

    fn manager_for(server: &MockServer, dir: &std::path::Path) -> TokenManager {
        let store = Arc::new(TokenStore::open(&dir.join("tokens.sqlite")).unwrap());
        TokenManager::with_token_url(
            store,
            OAuthCredentials::new("client-id", "client-secret"),
            format!("{}/oauth2/v1/tokens/bearer", server.uri()),
        )
    }

    fn seed_expired(manager: &TokenManager, tenant: &TenantKey) {
        manager
            .store()
            .save(
                tenant,
                "realm-1",
                &TokenRecord {
                    access_token: "stale".into(),
                    refresh_token: "refresh-1".into(),
                    access_expires_at: Utc::now() - chrono::Duration::minutes(5),
                    refresh_expires_at: None,
                    environment: "production".into(),
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn refresh_success_persists_new_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v1/tokens/bearer"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh-access",
                "refresh_token": "fresh-refresh",
                "expires_in": 3600,
                "x_refresh_token_expires_in": 8_726_400
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(&server, dir.path());
        let t = tenant("company_a");
        seed_expired(&manager, &t);

        let record = manager.refresh(&t, "realm-1").await.unwrap();
        assert_eq!(record.access_token, "fresh-access");
        assert_eq!(record.refresh_token, "fresh-refresh");
        assert!(record.refresh_expires_at.is_some());

        let stored = manager.store().load(&t, "realm-1").unwrap().unwrap();
        assert_eq!(stored.access_token, "fresh-access");
    }

    #[tokio::test]
    async fn invalid_grant_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v1/tokens/bearer"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(&server, dir.path());
        let t = tenant("company_a");
        seed_expired(&manager, &t);

        let err = manager.refresh(&t, "realm-1").await.unwrap_err();
        assert!(matches!(err, Error::TokenRefreshFailed { .. }));
        assert!(err.to_string().contains("re-authenticate"));
    }

    #[tokio::test]
    async fn missing_tokens_fail_with_bootstrap_hint() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(&server, dir.path());

        let err = manager
            .refresh(&tenant("company_a"), "realm-1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("OAuth bootstrap"));
    }

    #[tokio::test]
    async fn concurrent_refreshes_coalesce_to_one_network_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v1/tokens/bearer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh-access",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager_for(&server, dir.path()));
        let t = tenant("company_a");
        seed_expired(&manager, &t);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = Arc::clone(&manager);
            let t = t.clone();
            handles.push(tokio::spawn(async move {
                manager.refresh(&t, "realm-1").await
            }));
        }

        for handle in handles {
            let record = handle.await.unwrap().unwrap();
            assert_eq!(record.access_token, "fresh-access");
        }
        // The mock's expect(1) verifies exactly one network refresh ran.
    }

    #[tokio::test]
    async fn valid_token_skips_refresh() {
        let server = MockServer::start().await;
        // No mock mounted: any request would 404 and fail the test.
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(&server, dir.path());
        let t = tenant("company_a");
        manager
            .store()
            .store_from_oauth(&t, "realm-1", "live-token", "refresh", 3600, "production")
            .unwrap();

        let token = manager.valid_access_token(&t, "realm-1").await.unwrap();
        assert_eq!(token, "live-token");
    }
}
