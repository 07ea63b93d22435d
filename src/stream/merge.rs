//! Running two streams at once and interleaving their chunks.

use futures::future::BoxFuture;
use tracing::{debug, trace};

use super::{FlatMapOptions, Stream, Upstream};
use crate::Value;
use crate::cause::{Cause, Defect};
use crate::channel::{Input, Process, Signal, Step};
use crate::chunk::Chunk;
use crate::config::{DEFAULT_BUFFER_SIZE, StreamConfig};
use crate::runtime::{Fiber, fork_named};
use crate::sync::Queue;
use crate::take::Take;

/// When a two-stream merge ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HaltStrategy {
    /// When the left (receiver) stream ends.
    Left,
    /// When the right (argument) stream ends.
    Right,
    /// When both streams have ended.
    #[default]
    Both,
    /// When either stream ends.
    Either,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl HaltStrategy {
    fn halts_on(self, side: Side, other_ended: bool) -> bool {
        match self {
            HaltStrategy::Left => side == Side::Left,
            HaltStrategy::Right => side == Side::Right,
            HaltStrategy::Either => true,
            HaltStrategy::Both => other_ended,
        }
    }
}

impl<A: Value, E: Value> Stream<A, E> {
    /// Interleave this stream with `that`, ending when both end.
    pub fn merge(self, that: Stream<A, E>) -> Self {
        self.merge_with(that, HaltStrategy::Both)
    }

    /// Interleave this stream with `that`, ending as `halt` says. A failure
    /// on either side fails the merge and interrupts the other side.
    pub fn merge_with(self, that: Stream<A, E>, halt: HaltStrategy) -> Self {
        self.merge_buffered(that, halt, DEFAULT_BUFFER_SIZE)
    }

    /// Like [`Stream::merge_with`], queueing up to `config.buffer_size`
    /// chunks ahead of the consumer.
    pub fn merge_with_config(self, that: Stream<A, E>, halt: HaltStrategy, config: &StreamConfig) -> Self {
        self.merge_buffered(that, halt, config.buffer_size)
    }

    fn merge_buffered(self, that: Stream<A, E>, halt: HaltStrategy, buffer_size: usize) -> Self {
        let right = that.channel;
        self.transform(move |left, scope| {
            let right = right.start(Input::empty(), scope);
            let queue = Queue::bounded(buffer_size.max(1));
            let producers = vec![
                fork_named("merge", produce(Side::Left, left, queue.clone())),
                fork_named("merge", produce(Side::Right, right, queue.clone())),
            ];
            MergeWith {
                queue,
                producers,
                halt,
                ended: None,
            }
        })
    }

    /// Merge every stream, running up to `concurrency` of them at once.
    pub fn merge_all<I>(streams: I, concurrency: usize) -> Self
    where
        I: IntoIterator<Item = Stream<A, E>>,
        I::IntoIter: Send + 'static,
    {
        let options = FlatMapOptions {
            concurrency: Some(concurrency.max(1)),
            ..FlatMapOptions::default()
        };
        Stream::<Stream<A, E>, E>::from_iter_with_chunk_size(streams, 1)
            .flat_map(|stream| stream, options)
    }
}

async fn produce<A, E>(side: Side, mut upstream: Upstream<A, E>, queue: Queue<(Side, Take<A, E>)>)
where
    A: Value,
    E: Value,
{
    loop {
        let take = match upstream.next().await {
            Step::Emit(chunk) => Take::chunk(chunk),
            Step::Done(()) => Take::end(),
            Step::Halt(cause) => Take::fail_cause(cause),
        };
        let last = !take.is_chunk();
        if queue.offer_wait((side, take)).await.is_err() || last {
            return;
        }
    }
}

struct MergeWith<A, E> {
    queue: Queue<(Side, Take<A, E>)>,
    producers: Vec<Fiber<()>>,
    halt: HaltStrategy,
    /// The side that already ended, if any.
    ended: Option<Side>,
}

impl<A: Value, E: Value> MergeWith<A, E> {
    async fn stop(&mut self) {
        self.queue.shutdown();
        for producer in self.producers.drain(..) {
            producer.interrupt().await;
        }
    }
}

impl<A: Value, E: Value> Process<Chunk<A>, E, ()> for MergeWith<A, E> {
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<A>, E, ()>> {
        Box::pin(async move {
            loop {
                let Ok((side, take)) = self.queue.take().await else {
                    return Signal::Halt(Cause::die(Defect::message("merge pulled after it ended")));
                };
                match take {
                    Take::Chunk(chunk) => {
                        trace!("merge: {:?} emitted {} elements", side, chunk.len());
                        return Signal::Emit(chunk);
                    }
                    Take::Fail(cause) => {
                        self.stop().await;
                        return Signal::Halt(cause);
                    }
                    Take::End => {
                        let other_ended = self.ended.is_some();
                        if self.halt.halts_on(side, other_ended) {
                            debug!("merge: {:?} ended, halting ({:?})", side, self.halt);
                            self.stop().await;
                            return Signal::Done(());
                        }
                        self.ended = Some(side);
                    }
                }
            }
        })
    }
}
