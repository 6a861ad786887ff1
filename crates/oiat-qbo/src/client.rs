//! Authenticated client for the remote accounting REST API.
//!
//! One access token is obtained when the client is built. On a 401 the
//! client refreshes through the token manager and retries the request
//! exactly once; a second 401 is fatal for the run. Validation failures
//! surface as `RemoteValidation` with the remote's own code and detail.

use std::sync::Arc;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{info, warn};

use oiat_core::{Error, Result, TenantKey};

use crate::refresh::TokenManager;
use crate::types::{
    FaultEnvelope, Item, ItemEnvelope, QueryEnvelope, SalesReceipt, SalesReceiptEnvelope,
    SalesReceiptPayload,
};

/// Production API base URL.
pub const DEFAULT_BASE_URL: &str = "https://quickbooks.api.intuit.com";

/// Minor API version pinned for all requests.
const MINOR_VERSION: &str = "70";

/// Authenticated API client for one (tenant, realm).
pub struct QboClient {
    http: reqwest::Client,
    base_url: String,
    tenant: TenantKey,
    realm_id: String,
    tokens: Arc<TokenManager>,
    access_token: RwLock<String>,
}

impl QboClient {
    /// Builds a client, obtaining one valid access token up front.
    ///
    /// # Errors
    ///
    /// Returns token errors when no usable token can be obtained.
    pub async fn connect(
        tokens: Arc<TokenManager>,
        tenant: TenantKey,
        realm_id: impl Into<String>,
    ) -> Result<Self> {
        Self::connect_to(tokens, tenant, realm_id, DEFAULT_BASE_URL).await
    }

    /// Builds a client against a custom base URL (tests, sandboxes).
    ///
    /// # Errors
    ///
    /// Returns token errors when no usable token can be obtained.
    pub async fn connect_to(
        tokens: Arc<TokenManager>,
        tenant: TenantKey,
        realm_id: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let realm_id = realm_id.into();
        let access_token = tokens.valid_access_token(&tenant, &realm_id).await?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            tenant,
            realm_id,
            tokens,
            access_token: RwLock::new(access_token),
        })
    }

    /// Runs a query statement and returns the envelope.
    ///
    /// # Errors
    ///
    /// `RemoteNetwork` on transport failure, `RemoteValidation` on fault
    /// responses, `TokenRefreshFailed` on repeated 401.
    pub async fn query(&self, statement: &str) -> Result<QueryEnvelope> {
        let url = format!(
            "{}/v3/company/{}/query?minorversion={MINOR_VERSION}",
            self.base_url, self.realm_id
        );
        self.request_json(Method::GET, &url, Some(("query", statement)), None)
            .await
    }

    /// Creates a sales receipt.
    ///
    /// # Errors
    ///
    /// As for [`Self::query`].
    pub async fn create_sales_receipt(
        &self,
        payload: &SalesReceiptPayload,
    ) -> Result<SalesReceipt> {
        let url = format!(
            "{}/v3/company/{}/salesreceipt?minorversion={MINOR_VERSION}",
            self.base_url, self.realm_id
        );
        let body = serde_json::to_value(payload).map_err(|e| Error::Internal {
            message: format!("serialize sales receipt: {e}"),
        })?;
        let envelope: SalesReceiptEnvelope = self
            .request_json(Method::POST, &url, None, Some(body))
            .await?;
        info!(
            tenant = %self.tenant,
            doc_number = %payload.doc_number,
            remote_id = envelope.sales_receipt.id.as_deref().unwrap_or("?"),
            "sales receipt created"
        );
        Ok(envelope.sales_receipt)
    }

    /// Creates an item.
    ///
    /// # Errors
    ///
    /// As for [`Self::query`].
    pub async fn create_item(&self, item: &Item) -> Result<Item> {
        let url = format!(
            "{}/v3/company/{}/item?minorversion={MINOR_VERSION}",
            self.base_url, self.realm_id
        );
        let body = serde_json::to_value(item).map_err(|e| Error::Internal {
            message: format!("serialize item: {e}"),
        })?;
        let envelope: ItemEnvelope = self
            .request_json(Method::POST, &url, None, Some(body))
            .await?;
        Ok(envelope.item)
    }

    /// Sparse-updates an existing item (price/cost patches).
    ///
    /// # Errors
    ///
    /// As for [`Self::query`]. The item must carry `id` and `sync_token`.
    pub async fn sparse_update_item(&self, item: &Item) -> Result<Item> {
        let url = format!(
            "{}/v3/company/{}/item?minorversion={MINOR_VERSION}",
            self.base_url, self.realm_id
        );
        let mut patch = item.clone();
        patch.sparse = Some(true);
        let body = serde_json::to_value(&patch).map_err(|e| Error::Internal {
            message: format!("serialize item patch: {e}"),
        })?;
        let envelope: ItemEnvelope = self
            .request_json(Method::POST, &url, None, Some(body))
            .await?;
        Ok(envelope.item)
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        query: Option<(&str, &str)>,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let response = self.send_once(method.clone(), url, query, body.as_ref()).await?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            warn!(tenant = %self.tenant, "remote returned 401, refreshing token and retrying once");
            let rejected = self.access_token.read().await.clone();
            let record = self
                .tokens
                .refresh_after_unauthorized(&self.tenant, &self.realm_id, &rejected)
                .await?;
            *self.access_token.write().await = record.access_token;
            self.send_once(method, url, query, body.as_ref()).await?
        } else {
            response
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::TokenRefreshFailed {
                message: "remote rejected a freshly refreshed token (401)".to_string(),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::network("read response body", e))?;

        if status.is_success() {
            return serde_json::from_str(&text).map_err(|e| Error::Internal {
                message: format!("unexpected response shape: {e}"),
            });
        }

        Err(fault_to_error(status, &text))
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        query: Option<(&str, &str)>,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let token = self.access_token.read().await.clone();
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some((key, value)) = query {
            request = request.query(&[(key, value)]);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|e| Error::network("remote request failed", e))
    }
}

/// Maps a non-success response body to the error taxonomy.
fn fault_to_error(status: StatusCode, body: &str) -> Error {
    if let Ok(envelope) = serde_json::from_str::<FaultEnvelope>(body) {
        if let Some(first) = envelope.fault.errors.first() {
            let code = first.code.clone().unwrap_or_else(|| status.to_string());
            let message = first
                .message
                .clone()
                .or_else(|| first.detail.clone())
                .unwrap_or_default();
            let detail = first.detail.clone().unwrap_or_default();
            let combined = if detail.is_empty() || detail == message {
                message
            } else {
                format!("{message}: {detail}")
            };
            return Error::RemoteValidation {
                code,
                message: combined,
            };
        }
    }
    Error::RemoteValidation {
        code: status.as_u16().to_string(),
        message: body.chars().take(500).collect(),
    }
}
