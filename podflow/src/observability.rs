//! Tracing setup and span helpers for control-plane operations.

use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "podflow=info";

/// Output format for the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Installs a global `tracing` subscriber.
///
/// Returns false if a subscriber was already installed, which is the normal
/// case when tests share a process.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    match format {
        LogFormat::Pretty => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    }
}

/// Span wrapping one registry operation on a flow.
#[must_use]
pub fn flow_span(operation: &'static str, flow_id: &str) -> Span {
    tracing::info_span!("flow", op = operation, flow_id = %flow_id)
}

/// Span wrapping one mutation of a pod.
#[must_use]
pub fn pod_span(operation: &'static str, flow_id: &str, pod: &str) -> Span {
    tracing::info_span!("pod", op = operation, flow_id = %flow_id, pod = %pod)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let _ = init_tracing(LogFormat::Pretty);
        assert!(!init_tracing(LogFormat::Json));
    }

    #[test]
    fn test_spans_construct_without_subscriber() {
        let span = flow_span("add", "f-1");
        let _guard = span.enter();
        let inner = pod_span("scale", "f-1", "encoder");
        let _inner = inner.enter();
    }
}
