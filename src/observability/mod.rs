//! Observability features: metrics and tracing.
//!
//! - **Metrics**: counters and gauges via `metrics-rs`
//! - **Tracing**: structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `sluice_chunks_emitted` | Counter | Chunks emitted by instrumented stages |
//! | `sluice_elements_emitted` | Counter | Elements emitted by instrumented stages |
//! | `sluice_elements_dropped` | Counter | Elements lost to dropping/sliding buffers and throttles |
//! | `sluice_fibers_forked` | Counter | Fibers forked by concurrent operators |
//! | `sluice_finalizers_deferred` | Counter | Finalizers of abandoned processes queued on a scope |
//! | `sluice_queue_depth` | Gauge | Items pending in a queue |
//!
//! ## Example
//!
//! ```rust,ignore
//! use sluice::observability::init_metrics;
//!
//! // Initialize metrics (call once at startup)
//! init_metrics();
//!
//! // Name a stage to get per-stage counters and spans
//! let stream = Stream::range(1, 100).instrument("numbers");
//! ```

mod metrics;
mod tracing_support;

pub use metrics::{
    StageMetrics, init_metrics, record_elements_dropped, record_fiber_forked,
    record_finalizer_deferred, record_queue_depth,
};
pub use tracing_support::{TracingConfig, span_fiber, span_stream, trace_chunk, trace_end};
