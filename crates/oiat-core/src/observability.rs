//! Observability infrastructure.
//!
//! Structured logging with consistent spans across all components. Every
//! log line carries tenant, date and phase fields where applicable so the
//! portal's log view and the error taxonomy stay greppable.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops. `RUST_LOG` controls levels.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one pipeline phase.
#[must_use]
pub fn pipeline_span(phase: &str, tenant: &str, date: &str) -> Span {
    tracing::info_span!("pipeline", phase = phase, tenant = tenant, date = date)
}

/// Creates a span for dispatcher operations.
#[must_use]
pub fn dispatch_span(operation: &str, job_id: &str) -> Span {
    tracing::info_span!("dispatch", op = operation, job_id = job_id)
}
