//! Fire-and-forget chat notifications.
//!
//! Summaries go to a per-tenant webhook when one is configured. Delivery
//! problems are logged and swallowed; a missing webhook or a flaky chat
//! service must never affect a run's outcome.

use serde::Serialize;
use tracing::{debug, warn};

use oiat_core::CompanyConfig;

use crate::upload::ReconcileOutcome;

/// Structured run summary carried by the webhook payload.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Tenant key.
    pub tenant: String,
    /// Company display name.
    pub company_name: String,
    /// Date or range being reported.
    pub scope: String,
    /// "succeeded" or "failed".
    pub status: String,
    /// Documents created.
    pub created: u64,
    /// Documents skipped as duplicates.
    pub skipped: u64,
    /// Documents failed.
    pub failed: u64,
    /// Source-side total.
    pub source_total: f64,
    /// Remote-side total.
    pub remote_total: f64,
    /// Reconciliation verdict as text.
    pub reconcile_status: String,
    /// |source - remote|.
    pub difference: f64,
    /// Accumulated warnings.
    pub warnings: Vec<String>,
}

impl RunSummary {
    /// Human-readable fallback text for clients that ignore the payload.
    #[must_use]
    pub fn fallback_text(&self) -> String {
        let marker = if self.status == "succeeded" { "✅" } else { "❌" };
        let mut text = format!(
            "{marker} {} pipeline {} for {}\n\
             Upload: {} created, {} skipped, {} failed\n\
             Reconcile: {} (source {:.2}, remote {:.2}, diff {:.2})",
            self.company_name,
            self.status,
            self.scope,
            self.created,
            self.skipped,
            self.failed,
            self.reconcile_status,
            self.source_total,
            self.remote_total,
            self.difference,
        );
        if !self.warnings.is_empty() {
            text.push_str(&format!("\nWarnings: {}", self.warnings.join("; ")));
        }
        text
    }
}

/// Converts a reconcile outcome to its summary string.
#[must_use]
pub fn reconcile_label(outcome: ReconcileOutcome) -> &'static str {
    match outcome {
        ReconcileOutcome::Match => "match",
        ReconcileOutcome::Mismatch => "mismatch",
        ReconcileOutcome::NotRun => "not_run",
    }
}

/// Outbound webhook sink with per-tenant routing.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    http: reqwest::Client,
}

impl Notifier {
    /// Creates a notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends a summary to the tenant's webhook, if one is configured.
    ///
    /// Never returns an error: failures are logged and dropped.
    pub async fn send(&self, config: &CompanyConfig, summary: &RunSummary) {
        let Some(url) = config.webhook_url() else {
            debug!(tenant = %config.company_key, "no webhook configured, skipping notification");
            return;
        };

        let payload = serde_json::json!({
            "text": summary.fallback_text(),
            "summary": summary,
        });

        match self.http.post(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(tenant = %config.company_key, "notification delivered");
            }
            Ok(response) => {
                warn!(
                    tenant = %config.company_key,
                    status = %response.status(),
                    "notification webhook rejected the payload"
                );
            }
            Err(e) => {
                warn!(tenant = %config.company_key, error = %e, "notification delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oiat_core::config::CompanyConfig;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn summary() -> RunSummary {
        RunSummary {
            tenant: "company_a".into(),
            company_name: "Main Store".into(),
            scope: "2025-12-27".into(),
            status: "succeeded".into(),
            created: 12,
            skipped: 3,
            failed: 0,
            source_total: 125_000.0,
            remote_total: 125_000.0,
            reconcile_status: "match".into(),
            difference: 0.0,
            warnings: vec!["2025-12-28: future raw spill (23 rows)".into()],
        }
    }

    fn config_with_webhook(url: &str) -> CompanyConfig {
        let raw = serde_json::json!({
            "company_key": "company_a",
            "display_name": "Main Store",
            "qbo": {"realm_id": "1", "deposit_account": "Undeposited Funds"},
            "epos": {"username_env_key": "U", "password_env_key": "P"},
            "transform": {
                "group_by": "date_tender",
                "date_format": "%Y-%m-%d",
                "receipt_prefix": "SR"
            },
            "output": {
                "csv_prefix": "single_sales_receipts",
                "metadata_file": "last_epos_transform.json",
                "ledger_file": "uploaded_docnumbers.json"
            },
            "slack": {"webhook_env_key": url}
        })
        .to_string();
        CompanyConfig::from_json(&raw, None).unwrap()
    }

    #[test]
    fn fallback_text_includes_counts_and_warnings() {
        let text = summary().fallback_text();
        assert!(text.contains("12 created"));
        assert!(text.contains("match"));
        assert!(text.contains("future raw spill"));
    }

    #[tokio::test]
    async fn send_posts_structured_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_string_contains("Main Store"))
            .and(body_string_contains("reconcile_status"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = config_with_webhook(&format!("{}/hook", server.uri()));
        Notifier::new().send(&config, &summary()).await;
    }

    #[tokio::test]
    async fn delivery_failures_are_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let config = config_with_webhook(&format!("{}/hook", server.uri()));
        // Must not panic or error.
        Notifier::new().send(&config, &summary()).await;
    }

    #[tokio::test]
    async fn missing_webhook_is_a_noop() {
        let raw = serde_json::json!({
            "company_key": "company_a",
            "display_name": "Main Store",
            "qbo": {"realm_id": "1", "deposit_account": "Undeposited Funds"},
            "epos": {"username_env_key": "U", "password_env_key": "P"},
            "transform": {
                "group_by": "date_tender",
                "date_format": "%Y-%m-%d",
                "receipt_prefix": "SR"
            },
            "output": {
                "csv_prefix": "single_sales_receipts",
                "metadata_file": "last_epos_transform.json",
                "ledger_file": "uploaded_docnumbers.json"
            }
        })
        .to_string();
        let config = CompanyConfig::from_json(&raw, None).unwrap();
        Notifier::new().send(&config, &summary()).await;
    }
}
