//! Structured pipeline events.
//!
//! Every state transition of the orchestrator emits one event. Events go
//! to the job log (as JSON lines) and to whatever sink the embedding
//! process installs, which is how the portal's live-log view stays
//! decoupled from the orchestrator's control flow.
//!
//! Event ids are ULIDs: lexicographically sortable, so file order equals
//! chronological order without a separate sequence column.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use oiat_core::TenantKey;

/// Envelope for one pipeline event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Unique event identifier (ULID).
    pub id: String,
    /// Tenant the event belongs to.
    pub tenant: TenantKey,
    /// Processing scope as displayed to operators ("2025-12-27" or
    /// "2025-12-27..2025-12-29").
    pub scope: String,
    /// Event timestamp.
    pub at: DateTime<Utc>,
    /// Event payload.
    #[serde(flatten)]
    pub data: PipelineEventData,
}

/// Pipeline event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEventData {
    /// The pipeline started for a scope.
    PipelineStarted,
    /// One phase finished, with its duration.
    PhaseCompleted {
        /// Phase name (download, split, merge, transform, upload,
        /// reconcile, archive).
        phase: String,
        /// Date being processed, when phase is per-date.
        date: Option<NaiveDate>,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
    },
    /// A future-date spill file was produced during split.
    SpillCreated {
        /// Spill date.
        date: NaiveDate,
        /// Rows written to the spill file.
        rows: u64,
    },
    /// Rows for dates before the requested window were discarded.
    PastRowsDropped {
        /// Number of dropped rows.
        rows: u64,
        /// The distinct past dates observed.
        dates: Vec<NaiveDate>,
    },
    /// A spill file was merged into the day's split file.
    SpillMerged {
        /// Date being processed.
        date: NaiveDate,
        /// Rows from the split file.
        target_rows: u64,
        /// Rows from the spill file.
        spill_rows: u64,
        /// Rows in the combined file.
        final_rows: u64,
    },
    /// The upload engine finished one date.
    UploadSummary {
        /// Date being processed.
        date: NaiveDate,
        /// Documents attempted.
        attempted: u64,
        /// Documents created remotely.
        created: u64,
        /// Documents skipped as duplicates.
        skipped: u64,
        /// Documents that failed validation.
        failed: u64,
        /// Source-side monetary total.
        source_total: f64,
    },
    /// Reconciliation result for one date.
    Reconcile {
        /// Date being processed.
        date: NaiveDate,
        /// "match", "mismatch", or "not_run".
        status: String,
        /// Source-side total.
        source_total: f64,
        /// Remote-side total.
        remote_total: f64,
        /// Absolute difference.
        diff: f64,
    },
    /// The whole scope succeeded.
    PipelineSucceeded,
    /// The scope failed.
    PipelineFailed {
        /// Concise failure reason.
        reason: String,
    },
}

impl PipelineEvent {
    /// Creates an event stamped now.
    #[must_use]
    pub fn new(tenant: &TenantKey, scope: impl Into<String>, data: PipelineEventData) -> Self {
        Self {
            id: Ulid::new().to_string(),
            tenant: tenant.clone(),
            scope: scope.into(),
            at: Utc::now(),
            data,
        }
    }

    /// Event name used in logs ("spill_merged", ...).
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match &self.data {
            PipelineEventData::PipelineStarted => "pipeline_started",
            PipelineEventData::PhaseCompleted { .. } => "phase_completed",
            PipelineEventData::SpillCreated { .. } => "spill_created",
            PipelineEventData::PastRowsDropped { .. } => "past_rows_dropped",
            PipelineEventData::SpillMerged { .. } => "spill_merged",
            PipelineEventData::UploadSummary { .. } => "upload_summary",
            PipelineEventData::Reconcile { .. } => "reconcile",
            PipelineEventData::PipelineSucceeded => "pipeline_succeeded",
            PipelineEventData::PipelineFailed { .. } => "pipeline_failed",
        }
    }
}

/// Receives pipeline events as they happen.
pub trait EventSink: Send + Sync {
    /// Handles one event. Implementations must not block for long.
    fn emit(&self, event: &PipelineEvent);
}

/// Sink that logs each event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &PipelineEvent) {
        match serde_json::to_string(&event.data) {
            Ok(payload) => tracing::info!(
                target: "oiat::pipeline",
                tenant = %event.tenant,
                scope = %event.scope,
                event = event.name(),
                %payload,
            ),
            Err(_) => tracing::info!(
                target: "oiat::pipeline",
                tenant = %event.tenant,
                scope = %event.scope,
                event = event.name(),
            ),
        }
    }
}

/// Sink that collects events in memory (tests, notification summaries).
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: std::sync::Mutex<Vec<PipelineEvent>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of everything emitted so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &PipelineEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantKey {
        TenantKey::new("company_a").unwrap()
    }

    #[test]
    fn event_ids_are_ulid_and_sortable() {
        let first = PipelineEvent::new(&tenant(), "2025-12-27", PipelineEventData::PipelineStarted);
        let second =
            PipelineEvent::new(&tenant(), "2025-12-27", PipelineEventData::PipelineSucceeded);
        assert_eq!(first.id.len(), 26);
        assert!(first.id <= second.id);
    }

    #[test]
    fn events_serialize_with_snake_case_tag() {
        let event = PipelineEvent::new(
            &tenant(),
            "2025-12-27",
            PipelineEventData::SpillMerged {
                date: "2025-12-28".parse().unwrap(),
                target_rows: 495,
                spill_rows: 23,
                final_rows: 518,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"spill_merged\""));
        assert!(json.contains("\"final_rows\":518"));
    }

    #[test]
    fn collecting_sink_accumulates() {
        let sink = CollectingSink::new();
        sink.emit(&PipelineEvent::new(
            &tenant(),
            "2025-12-27",
            PipelineEventData::PipelineStarted,
        ));
        sink.emit(&PipelineEvent::new(
            &tenant(),
            "2025-12-27",
            PipelineEventData::PipelineSucceeded,
        ));
        assert_eq!(sink.snapshot().len(), 2);
    }
}
