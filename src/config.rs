//! Stream configuration.
//!
//! Operators take their sizes as explicit arguments. [`StreamConfig`] gathers
//! the defaults in one place so an application can tune them together; the
//! `*_with_config` operators and the option builders below read it.

use crate::channel::{MergeMapOptions, MergeStrategy};
use crate::stream::FlatMapOptions;

/// Elements per chunk produced by iterator-backed constructors.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Capacity of the internal queues used by concurrent operators.
pub const DEFAULT_BUFFER_SIZE: usize = 16;

/// Configuration shared by stream operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Elements per chunk for iterator-backed constructors.
    pub chunk_size: usize,
    /// Chunks a merge queues ahead of its consumer.
    pub buffer_size: usize,
    /// Capacity of the channel behind `async_push` emitters.
    pub push_capacity: usize,
    /// Output buffer of `flat_map` and `merge_map` with concurrency.
    pub merge_buffer_size: usize,
    /// How many chunks a broadcast subscriber may lag behind.
    pub broadcast_lag: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            push_capacity: DEFAULT_BUFFER_SIZE,
            merge_buffer_size: DEFAULT_BUFFER_SIZE,
            broadcast_lag: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl StreamConfig {
    /// Create a config with default sizes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chunk size (at least 1).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Set the buffer size (at least 1).
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Set the push adapter capacity (at least 1).
    pub fn with_push_capacity(mut self, push_capacity: usize) -> Self {
        self.push_capacity = push_capacity.max(1);
        self
    }

    /// Set the merge buffer size (at least 1).
    pub fn with_merge_buffer_size(mut self, merge_buffer_size: usize) -> Self {
        self.merge_buffer_size = merge_buffer_size.max(1);
        self
    }

    /// Set the broadcast lag (at least 1).
    pub fn with_broadcast_lag(mut self, broadcast_lag: usize) -> Self {
        self.broadcast_lag = broadcast_lag.max(1);
        self
    }

    /// `flat_map` options running `concurrency` inner streams at once.
    pub fn flat_map_options(&self, concurrency: usize) -> FlatMapOptions {
        FlatMapOptions {
            concurrency: Some(concurrency.max(1)),
            buffer_size: self.merge_buffer_size,
            switch: false,
        }
    }

    /// `merge_map` options with back-pressure.
    pub fn merge_map_options(&self, concurrency: usize) -> MergeMapOptions {
        MergeMapOptions {
            concurrency: concurrency.max(1),
            buffer_size: self.merge_buffer_size,
            strategy: MergeStrategy::BackPressure,
        }
    }
}
