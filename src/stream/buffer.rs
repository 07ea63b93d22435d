//! Decoupling a producer from its consumer with a queue.

use futures::future::BoxFuture;
use tracing::trace;

use super::{Stream, Upstream};
use crate::Value;
use crate::cause::Cause;
use crate::channel::{Process, Signal, Step};
use crate::chunk::Chunk;
use crate::observability::{record_elements_dropped, record_queue_depth};
use crate::runtime::{Fiber, fork_named};
use crate::sync::{OverflowStrategy, Queue};
use crate::take::Take;

impl<A: Value, E: Value> Stream<A, E> {
    /// Let the upstream run ahead by up to `capacity` elements.
    ///
    /// With [`OverflowStrategy::Suspend`] the upstream waits for room;
    /// [`OverflowStrategy::Dropping`] discards new elements and
    /// [`OverflowStrategy::Sliding`] discards the oldest ones while the
    /// buffer is full.
    pub fn buffer(self, capacity: usize, strategy: OverflowStrategy) -> Self {
        self.rechunk(1).buffer_queue(Some(capacity.max(1)), strategy)
    }

    /// Let the upstream run ahead by up to `capacity` chunks.
    pub fn buffer_chunks(self, capacity: usize, strategy: OverflowStrategy) -> Self {
        self.buffer_queue(Some(capacity.max(1)), strategy)
    }

    /// Let the upstream run ahead without limit.
    pub fn buffer_unbounded(self) -> Self {
        self.buffer_queue(None, OverflowStrategy::Suspend)
    }

    fn buffer_queue(self, capacity: Option<usize>, strategy: OverflowStrategy) -> Self {
        self.transform(move |upstream, _| {
            let queue = Queue::with_strategy(capacity, strategy);
            let producer = fork_named("buffer", produce(upstream, queue.clone()));
            Buffered {
                queue,
                _producer: producer,
            }
        })
    }
}

async fn produce<A: Value, E: Value>(mut upstream: Upstream<A, E>, queue: Queue<Take<A, E>>) {
    loop {
        match upstream.next().await {
            Step::Emit(chunk) => {
                let len = chunk.len() as u64;
                match queue.offer(Take::chunk(chunk)).await {
                    Ok(true) => record_queue_depth("buffer", queue.len()),
                    Ok(false) => {
                        trace!("buffer full, dropped {} elements", len);
                        record_elements_dropped("buffer", len);
                    }
                    Err(_) => return,
                }
            }
            Step::Done(()) => {
                let _ = queue.offer_wait(Take::end()).await;
                return;
            }
            Step::Halt(cause) => {
                let _ = queue.offer_wait(Take::fail_cause(cause)).await;
                return;
            }
        }
    }
}

struct Buffered<A, E> {
    queue: Queue<Take<A, E>>,
    /// Interrupted when the consumer is dropped.
    _producer: Fiber<()>,
}

impl<A: Value, E: Value> Process<Chunk<A>, E, ()> for Buffered<A, E> {
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<A>, E, ()>> {
        Box::pin(async move {
            match self.queue.take().await {
                Ok(Take::Chunk(chunk)) => Signal::Emit(chunk),
                Ok(Take::End) => Signal::Done(()),
                Ok(Take::Fail(cause)) => Signal::Halt(cause),
                Err(_) => Signal::Halt(Cause::interrupt()),
            }
        })
    }
}

impl<A, E> Drop for Buffered<A, E> {
    fn drop(&mut self) {
        self.queue.shutdown();
    }
}
