//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};

/// Configuration for tracing behavior of instrumented stages.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to wrap each pull of the stage in a span.
    pub stage_spans: bool,
    /// Whether to log every emitted chunk at trace level.
    pub chunk_events: bool,
    /// Whether to record chunk and element counters.
    pub metrics: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            stage_spans: true,
            chunk_events: false, // Can be expensive
            metrics: true,
        }
    }
}

impl TracingConfig {
    /// Enable everything, including per-chunk events.
    pub fn all() -> Self {
        Self {
            stage_spans: true,
            chunk_events: true,
            metrics: true,
        }
    }

    /// Disable spans and events; keep counters.
    pub fn metrics_only() -> Self {
        Self {
            stage_spans: false,
            chunk_events: false,
            metrics: true,
        }
    }

    /// Disable all instrumentation.
    pub fn none() -> Self {
        Self {
            stage_spans: false,
            chunk_events: false,
            metrics: false,
        }
    }
}

/// Create a span for a stream run.
///
/// # Example
///
/// ```rust,ignore
/// use sluice::observability::span_stream;
///
/// let span = span_stream("ingest");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_stream(name: &str) -> Span {
    span!(Level::DEBUG, "stream", name = %name)
}

/// Create a span for a forked fiber.
#[inline]
pub fn span_fiber(operator: &'static str) -> Span {
    span!(Level::TRACE, "fiber", operator = operator)
}

/// Log a chunk leaving a named stage.
#[inline]
pub fn trace_chunk(stage: &str, len: usize) {
    tracing::trace!(stage = %stage, len = len, "chunk emitted");
}

/// Log the end of a named stage.
#[inline]
pub fn trace_end(stage: &str, failed: bool) {
    tracing::debug!(stage = %stage, failed = failed, "stage ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_config_default() {
        let config = TracingConfig::default();
        assert!(config.stage_spans);
        assert!(!config.chunk_events);
        assert!(config.metrics);
    }

    #[test]
    fn test_tracing_config_presets() {
        assert!(TracingConfig::all().chunk_events);
        assert!(!TracingConfig::metrics_only().stage_spans);
        let none = TracingConfig::none();
        assert!(!none.stage_spans && !none.chunk_events && !none.metrics);
    }

    #[test]
    fn test_span_creation() {
        // These should not panic
        let _span = span_stream("test-stream");
        let _span = span_fiber("merge");
    }

    #[test]
    fn test_trace_functions() {
        // These should not panic even without a subscriber
        trace_chunk("parse", 10);
        trace_end("parse", false);
    }
}
