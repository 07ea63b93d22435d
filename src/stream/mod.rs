//! Streams: lazy, chunked, pull-driven producers.
//!
//! A [`Stream<A, E>`] wraps a [`Channel`] that writes [`Chunk`]s of `A`,
//! fails with `Cause<E>` and finishes with `()`. Every operator returns a new
//! stream whose channel reads from the previous one; nothing runs until one
//! of the `run_*` methods drives the outermost channel.
//!
//! Operators are grouped by concern:
//!
//! - construction, including push adapters for callback-based producers
//! - per-chunk transformations, built on [`Stage`]
//! - error handling and lifecycle: catch, ensuring, timeouts
//! - concurrency: merge, flat_map, zip, buffer, broadcast, combine
//! - time: throttle, debounce, schedule, aggregate_within
//! - running: sinks, folds, pulls and `futures::Stream` interop

mod aggregate;
mod broadcast;
mod buffer;
mod combine;
mod constructors;
mod flat_map;
mod lifecycle;
mod merge;
mod ops;
mod push;
mod run;
mod stage;
mod timing;
mod zip;

use std::convert::Infallible;

use futures::future::BoxFuture;
use tracing::Instrument;

pub use broadcast::DynamicDistribution;
pub use combine::{Pulled, Puller};
pub use flat_map::FlatMapOptions;
pub use merge::HaltStrategy;
pub use push::Emitter;
pub use run::StreamPull;
pub use stage::Stage;
pub use timing::{ThrottleOptions, ThrottleStrategy};
pub use zip::Remainder;

pub(crate) use stage::Outbox;

use crate::Value;
use crate::channel::{Channel, Executor, Input, Process, Signal, Step};
use crate::chunk::Chunk;
use crate::observability::{StageMetrics, TracingConfig, span_stream, trace_chunk, trace_end};
use crate::runtime::Scope;

/// The started form of a stream, as seen by the operator reading from it.
pub(crate) type Upstream<A, E> = Executor<Chunk<A>, E, ()>;

/// A lazy description of a producer of chunks of `A` that may fail with `E`.
pub struct Stream<A, E = Infallible> {
    channel: Channel<Chunk<A>, E, ()>,
}

impl<A: Value, E: Value> Stream<A, E> {
    /// Wrap a channel that writes chunks.
    pub fn from_channel(channel: Channel<Chunk<A>, E, ()>) -> Self {
        Self { channel }
    }

    /// The underlying channel.
    pub fn into_channel(self) -> Channel<Chunk<A>, E, ()> {
        self.channel
    }

    /// A stream backed by a custom process created when the stream starts.
    pub(crate) fn from_process<P, F>(f: F) -> Self
    where
        P: Process<Chunk<A>, E, ()> + 'static,
        F: FnOnce(Scope) -> P + Send + 'static,
    {
        Self::from_channel(Channel::from_process(move |_, scope| f(scope)))
    }

    /// Start this stream when the returned one starts and hand its executor
    /// to the process `f` builds.
    pub(crate) fn transform<B, E2, P, F>(self, f: F) -> Stream<B, E2>
    where
        B: Value,
        E2: Value,
        P: Process<Chunk<B>, E2, ()> + 'static,
        F: FnOnce(Upstream<A, E>, Scope) -> P + Send + 'static,
    {
        let channel = self.channel;
        Stream::from_process(move |scope: Scope| {
            let upstream = channel.start(Input::empty(), scope.clone());
            f(upstream, scope)
        })
    }

    /// Emit everything from this stream, then everything from `that`.
    pub fn concat(self, that: Stream<A, E>) -> Self {
        Self::from_channel(self.channel.then(move |()| that.channel))
    }

    /// Feed this stream's chunks into `channel`.
    pub fn pipe_through_channel<B, E2>(
        self,
        channel: Channel<Chunk<B>, E2, (), Chunk<A>, E, ()>,
    ) -> Stream<B, E2>
    where
        B: Value,
        E2: Value,
    {
        Stream::from_channel(self.channel.pipe_to(channel))
    }

    /// Name this stage: every pull runs in a `stream` span and emitted
    /// chunks are counted under the stage label.
    pub fn instrument(self, name: &str) -> Self {
        self.instrument_with(name, &TracingConfig::default())
    }

    /// Like [`Stream::instrument`], choosing what to record.
    pub fn instrument_with(self, name: &str, config: &TracingConfig) -> Self {
        let metrics = config.metrics.then(|| StageMetrics::new(name));
        let span = config.stage_spans.then(|| span_stream(name));
        let stage = name.to_string();
        let chunk_events = config.chunk_events;
        self.transform(move |upstream, _| Instrumented {
            upstream,
            stage,
            metrics,
            span,
            chunk_events,
        })
    }
}

struct Instrumented<A, E> {
    upstream: Upstream<A, E>,
    stage: String,
    metrics: Option<StageMetrics>,
    span: Option<tracing::Span>,
    chunk_events: bool,
}

impl<A: Value, E: Value> Process<Chunk<A>, E, ()> for Instrumented<A, E> {
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<A>, E, ()>> {
        let span = self.span.clone().unwrap_or_else(tracing::Span::none);
        Box::pin(
            async move {
                match self.upstream.next().await {
                    Step::Emit(chunk) => {
                        if let Some(metrics) = &self.metrics {
                            metrics.record_chunk(chunk.len());
                        }
                        if self.chunk_events {
                            trace_chunk(&self.stage, chunk.len());
                        }
                        Signal::Emit(chunk)
                    }
                    Step::Halt(cause) => {
                        trace_end(&self.stage, true);
                        Signal::Halt(cause)
                    }
                    Step::Done(()) => {
                        trace_end(&self.stage, false);
                        Signal::Done(())
                    }
                }
            }
            .instrument(span),
        )
    }
}
