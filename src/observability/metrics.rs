//! Metrics collection using metrics-rs.

use metrics::{Counter, Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const CHUNKS_EMITTED: &str = "sluice_chunks_emitted";
const ELEMENTS_EMITTED: &str = "sluice_elements_emitted";
const ELEMENTS_DROPPED: &str = "sluice_elements_dropped";
const FIBERS_FORKED: &str = "sluice_fibers_forked";
const FINALIZERS_DEFERRED: &str = "sluice_finalizers_deferred";
const QUEUE_DEPTH: &str = "sluice_queue_depth";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        CHUNKS_EMITTED,
        Unit::Count,
        "Total number of chunks emitted by instrumented stages"
    );
    metrics::describe_counter!(
        ELEMENTS_EMITTED,
        Unit::Count,
        "Total number of elements emitted by instrumented stages"
    );
    metrics::describe_counter!(
        ELEMENTS_DROPPED,
        Unit::Count,
        "Elements discarded by dropping/sliding buffers and throttles"
    );
    metrics::describe_counter!(
        FIBERS_FORKED,
        Unit::Count,
        "Total number of fibers forked by concurrent operators"
    );
    metrics::describe_counter!(
        FINALIZERS_DEFERRED,
        Unit::Count,
        "Finalizers of abandoned processes queued on a run scope"
    );
    metrics::describe_gauge!(
        QUEUE_DEPTH,
        Unit::Count,
        "Number of items pending in a queue"
    );
}

/// Record elements discarded by a lossy buffer or throttle.
#[inline]
pub fn record_elements_dropped(site: &'static str, count: u64) {
    counter!(ELEMENTS_DROPPED, "site" => site).increment(count);
}

/// Record a forked fiber.
#[inline]
pub fn record_fiber_forked() {
    counter!(FIBERS_FORKED).increment(1);
}

/// Record a finalizer queued on a scope instead of running inline.
#[inline]
pub fn record_finalizer_deferred() {
    counter!(FINALIZERS_DEFERRED).increment(1);
}

/// Record queue depth (pending items).
#[inline]
pub fn record_queue_depth(queue: &'static str, depth: usize) {
    gauge!(QUEUE_DEPTH, "queue" => queue).set(depth as f64);
}

/// Metrics collector for a named stage.
///
/// Provides a convenient way to record metrics with pre-configured labels.
#[derive(Clone)]
pub struct StageMetrics {
    stage: String,
    chunks: Counter,
    elements: Counter,
}

impl StageMetrics {
    /// Create a new stage metrics collector.
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            chunks: counter!(CHUNKS_EMITTED, "stage" => stage.to_string()),
            elements: counter!(ELEMENTS_EMITTED, "stage" => stage.to_string()),
        }
    }

    /// Record an emitted chunk of `len` elements.
    #[inline]
    pub fn record_chunk(&self, len: usize) {
        self.chunks.increment(1);
        self.elements.increment(len as u64);
    }

    /// Get the stage name.
    pub fn stage(&self) -> &str {
        &self.stage
    }
}
