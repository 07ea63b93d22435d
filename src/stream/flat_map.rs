//! Streams of streams: `flat_map` and `flatten`.

use super::Stream;
use crate::Value;
use crate::channel::{Channel, MergeMapOptions, MergeStrategy};
use crate::chunk::Chunk;
use crate::config::DEFAULT_BUFFER_SIZE;

/// Options for [`Stream::flat_map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatMapOptions {
    /// How many inner streams run at once. `None` runs them one after the
    /// other, in order.
    pub concurrency: Option<usize>,
    /// Capacity of the buffer shared by concurrent inner streams.
    pub buffer_size: usize,
    /// Interrupt the oldest running inner stream when a new one starts.
    pub switch: bool,
}

impl Default for FlatMapOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            switch: false,
        }
    }
}

impl FlatMapOptions {
    /// Run up to `concurrency` inner streams at once.
    pub fn concurrent(concurrency: usize) -> Self {
        Self {
            concurrency: Some(concurrency.max(1)),
            ..Self::default()
        }
    }

    /// Keep only the latest inner stream running.
    pub fn switch() -> Self {
        Self {
            switch: true,
            ..Self::default()
        }
    }
}

impl<A: Value, E: Value> Stream<A, E> {
    /// Replace every element with the stream `f` derives from it.
    ///
    /// By default inner streams run sequentially and their output keeps the
    /// outer order. With a concurrency their chunks interleave as they
    /// arrive; with `switch` a new inner stream interrupts the oldest one
    /// once the concurrency limit (one unless set) is reached.
    pub fn flat_map<B, F>(self, mut f: F, options: FlatMapOptions) -> Stream<B, E>
    where
        B: Value,
        F: FnMut(A) -> Stream<B, E> + Send + 'static,
    {
        let elements = self.channel.concat_map(|chunk: Chunk<A>| Channel::write_all(chunk));
        let concurrency = match (options.concurrency, options.switch) {
            (Some(n), _) => n.max(1),
            (None, true) => 1,
            (None, false) => {
                return Stream::from_channel(elements.concat_map(move |elem| f(elem).channel));
            }
        };
        let strategy = if options.switch {
            MergeStrategy::BufferSliding
        } else {
            MergeStrategy::BackPressure
        };
        let merge_options = MergeMapOptions {
            concurrency,
            buffer_size: options.buffer_size.max(1),
            strategy,
        };
        Stream::from_channel(elements.merge_map(move |elem| f(elem).channel, merge_options))
    }
}

impl<A: Value, E: Value> Stream<Stream<A, E>, E> {
    /// Concatenate the inner streams in order.
    pub fn flatten(self) -> Stream<A, E> {
        self.flat_map(|inner| inner, FlatMapOptions::default())
    }
}
