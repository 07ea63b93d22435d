//! Running streams: sinks, folds, pulls and `futures::Stream` interop.

use std::collections::VecDeque;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{trace, warn};

use super::{Outbox, Stream, Upstream};
use crate::Value;
use crate::cause::{Cause, Defect, Exit};
use crate::channel::{Driver, Process, Signal, Step};
use crate::chunk::Chunk;
use crate::error::Result;
use crate::sink::{Feed, Sink, SinkState};
use crate::sync::Queue;
use crate::take::Take;

impl<A: Value, E: Value> Stream<A, E> {
    /// Drive the stream, handing every chunk to `f` until it returns false or
    /// the stream ends.
    async fn consume<F>(self, mut f: F) -> Exit<(), E>
    where
        F: FnMut(Chunk<A>) -> bool + Send,
    {
        let mut driver = Driver::new(self.channel);
        let exit = loop {
            match driver.next().await {
                Step::Emit(chunk) => {
                    if !f(chunk) {
                        break Ok(());
                    }
                }
                Step::Done(()) => break Ok(()),
                Step::Halt(cause) => break Err(cause),
            }
        };
        driver.finish(exit).await
    }

    /// Run the stream into `sink`. Elements the sink leaves unconsumed are
    /// discarded and the stream is interrupted as soon as the sink is done.
    pub async fn run<Z: Value>(self, sink: Sink<A, E, Z>) -> Exit<Z, E> {
        let mut state = sink.start();
        let mut driver = Driver::new(self.channel);
        let exit = loop {
            match driver.next().await {
                Step::Emit(chunk) => match state.feed(chunk).await {
                    Ok(Feed::More) => {}
                    Ok(Feed::Done(_)) => break Ok(()),
                    Err(cause) => break Err(cause),
                },
                Step::Done(()) => break Ok(()),
                Step::Halt(cause) => break Err(cause),
            }
        };
        let exit = match exit {
            Ok(()) => state.finish().await,
            Err(cause) => Err(cause),
        };
        driver.finish(exit).await
    }

    /// Collect every element.
    pub async fn run_collect(self) -> Exit<Vec<A>, E> {
        let mut out = Vec::new();
        self.consume(|chunk| {
            out.extend(chunk);
            true
        })
        .await?;
        Ok(out)
    }

    /// Run the stream for its effects only.
    pub async fn run_drain(self) -> Exit<(), E> {
        self.consume(|_| true).await
    }

    /// Fold every element into `init`.
    pub async fn run_fold<S, F>(self, init: S, mut f: F) -> Exit<S, E>
    where
        S: Send,
        F: FnMut(S, A) -> S + Send,
    {
        let mut state = Some(init);
        self.consume(|chunk| {
            if let Some(mut acc) = state.take() {
                for elem in chunk {
                    acc = f(acc, elem);
                }
                state = Some(acc);
            }
            true
        })
        .await?;
        state.ok_or_else(|| Cause::die(Defect::message("run_fold lost its state")))
    }

    /// Run `f` on every element.
    pub async fn run_for_each<F>(self, mut f: F) -> Exit<(), E>
    where
        F: FnMut(A) + Send,
    {
        self.consume(|chunk| {
            chunk.into_iter().for_each(&mut f);
            true
        })
        .await
    }

    /// The first element, interrupting the stream once it is seen.
    pub async fn run_head(self) -> Exit<Option<A>, E> {
        let mut head = None;
        self.consume(|chunk| {
            head = chunk.first_owned();
            head.is_none()
        })
        .await?;
        Ok(head)
    }

    /// The last element.
    pub async fn run_last(self) -> Exit<Option<A>, E> {
        let mut last = None;
        self.consume(|chunk| {
            if let Some(elem) = chunk.last_owned() {
                last = Some(elem);
            }
            true
        })
        .await?;
        Ok(last)
    }

    /// Number of elements.
    pub async fn run_count(self) -> Exit<u64, E> {
        let mut count = 0u64;
        self.consume(|chunk| {
            count += chunk.len() as u64;
            true
        })
        .await?;
        Ok(count)
    }

    /// Offer every chunk to `queue` as a [`Take`], followed by the terminal
    /// take. Fails with [`crate::Error::Shutdown`] if the queue shuts down
    /// first.
    pub async fn run_into_queue(self, queue: &Queue<Take<A, E>>) -> Result<()> {
        let mut driver = Driver::new(self.channel);
        let terminal = loop {
            match driver.next().await {
                Step::Emit(chunk) => {
                    if let Err(error) = queue.offer(Take::chunk(chunk)).await {
                        if let Err(cause) = driver.finish(Ok(())).await {
                            for defect in cause.defects() {
                                warn!("finalizer failed after the queue shut down: {}", defect);
                            }
                        }
                        return Err(error);
                    }
                }
                Step::Done(()) => break Ok(()),
                Step::Halt(cause) => break Err(cause),
            }
        };
        let take = match driver.finish(terminal).await {
            Ok(()) => Take::end(),
            Err(cause) => Take::fail_cause(cause),
        };
        queue.offer_wait(take).await
    }

    /// Run `sink` on a prefix of the stream and return its result together
    /// with the rest of the stream, starting with the sink's leftovers.
    ///
    /// The rest shares the run started here: it must be consumed or dropped
    /// to release the upstream.
    pub async fn peel<Z: Value>(self, sink: Sink<A, E, Z>) -> Exit<(Z, Stream<A, E>), E> {
        let mut state = sink.start();
        let mut driver = Driver::new(self.channel);
        let (leftover, upstream_ended) = loop {
            match driver.next().await {
                Step::Emit(chunk) => match state.feed(chunk).await {
                    Ok(Feed::More) => {}
                    Ok(Feed::Done(leftover)) => break (leftover, false),
                    Err(cause) => return driver.finish(Err(cause)).await,
                },
                Step::Done(()) => break (Chunk::empty(), true),
                Step::Halt(cause) => return driver.finish(Err(cause)).await,
            }
        };
        let z = match state.finish().await {
            Ok(z) => z,
            Err(cause) => return driver.finish(Err(cause)).await,
        };
        let driver = if upstream_ended {
            driver.finish(Ok(())).await?;
            None
        } else {
            Some(driver)
        };
        let rest = Stream::from_process(move |_| Peeled {
            leftover: Some(leftover),
            driver,
        });
        Ok((z, rest))
    }

    /// Run `sink` repeatedly over the stream, emitting each result.
    ///
    /// A sink that finishes leaves its leftovers to the next one. At the end
    /// of the stream the current sink's result is emitted if it consumed
    /// anything. A fresh sink that finishes without consuming an element
    /// makes the stream die with [`Defect::InvalidArgument`].
    pub fn transduce<Z: Value>(self, sink: Sink<A, E, Z>) -> Stream<Z, E> {
        self.transform(move |upstream, _| Transduce {
            upstream: Some(upstream),
            sink,
            state: None,
            consumed: 0,
            pending: VecDeque::new(),
            outbox: Outbox::default(),
        })
    }

    /// Start the stream and pull it chunk by chunk.
    pub fn into_pull(self) -> StreamPull<A, E> {
        StreamPull {
            driver: Some(Driver::new(self.channel)),
        }
    }

    /// Adapt the stream to a `futures::Stream` of chunks. A failure is the
    /// last item.
    pub fn into_futures_stream(self) -> BoxStream<'static, std::result::Result<Chunk<A>, Cause<E>>> {
        futures::stream::unfold(self.into_pull(), |mut pull| async move {
            match pull.pull().await {
                Ok(chunk) => Some((Ok(chunk), pull)),
                Err(Some(cause)) => Some((Err(cause), pull)),
                Err(None) => None,
            }
        })
        .boxed()
    }
}

// ============================================================================
// Pull
// ============================================================================

/// A started stream pulled one chunk at a time.
///
/// Dropping it interrupts the stream; queued finalizers then run on a
/// detached task. [`StreamPull::close`] runs them before returning.
pub struct StreamPull<A, E> {
    driver: Option<Driver<Chunk<A>, E, ()>>,
}

impl<A: Value, E: Value> StreamPull<A, E> {
    /// The next chunk; `Err(None)` once the stream has ended and
    /// `Err(Some(cause))` when it failed. Every pull after the end reports
    /// `Err(None)`.
    pub async fn pull(&mut self) -> std::result::Result<Chunk<A>, Option<Cause<E>>> {
        let Some(driver) = self.driver.as_mut() else {
            return Err(None);
        };
        let exit = match driver.next().await {
            Step::Emit(chunk) => return Ok(chunk),
            Step::Done(()) => Ok(()),
            Step::Halt(cause) => Err(cause),
        };
        let Some(driver) = self.driver.take() else {
            return Err(None);
        };
        let exit = driver.finish(exit).await;
        trace!("pulled stream ended, failed: {}", exit.is_err());
        exit.map_err(Some).and(Err(None))
    }

    /// Interrupt the stream and run its finalizers.
    pub async fn close(mut self) -> Exit<(), E> {
        match self.driver.take() {
            Some(driver) => driver.finish(Ok(())).await,
            None => Ok(()),
        }
    }
}

// ============================================================================
// Processes
// ============================================================================

struct Peeled<A, E> {
    leftover: Option<Chunk<A>>,
    driver: Option<Driver<Chunk<A>, E, ()>>,
}

impl<A: Value, E: Value> Process<Chunk<A>, E, ()> for Peeled<A, E> {
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<A>, E, ()>> {
        Box::pin(async move {
            if let Some(leftover) = self.leftover.take().filter(|chunk| !chunk.is_empty()) {
                return Signal::Emit(leftover);
            }
            let Some(driver) = self.driver.as_mut() else {
                return Signal::Done(());
            };
            let exit = match driver.next().await {
                Step::Emit(chunk) => return Signal::Emit(chunk),
                Step::Done(()) => Ok(()),
                Step::Halt(cause) => Err(cause),
            };
            let Some(driver) = self.driver.take() else {
                return Signal::Done(());
            };
            match driver.finish(exit).await {
                Ok(()) => Signal::Done(()),
                Err(cause) => Signal::Halt(cause),
            }
        })
    }
}

struct Transduce<A, E, Z> {
    upstream: Option<Upstream<A, E>>,
    sink: Sink<A, E, Z>,
    state: Option<Box<dyn SinkState<A, E, Z>>>,
    /// Elements the current sink has consumed.
    consumed: usize,
    /// Leftovers waiting for the next sink.
    pending: VecDeque<Chunk<A>>,
    outbox: Outbox<Z, E>,
}

impl<A: Value, E: Value, Z: Value> Transduce<A, E, Z> {
    async fn complete_sink(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        self.consumed = 0;
        match state.finish().await {
            Ok(z) => self.outbox.push(Chunk::single(z)),
            Err(cause) => self.fail(cause),
        }
    }

    fn fail(&mut self, cause: Cause<E>) {
        self.upstream = None;
        self.pending.clear();
        self.outbox.finish(Err(cause));
    }
}

impl<A: Value, E: Value, Z: Value> Process<Chunk<Z>, E, ()> for Transduce<A, E, Z> {
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<Z>, E, ()>> {
        Box::pin(async move {
            loop {
                if let Some(signal) = self.outbox.next_signal() {
                    return signal;
                }
                let chunk = match self.pending.pop_front() {
                    Some(chunk) => chunk,
                    None => {
                        let Some(upstream) = self.upstream.as_mut() else {
                            return Signal::Halt(Cause::die(Defect::message(
                                "transduce pulled after it ended",
                            )));
                        };
                        match upstream.next().await {
                            Step::Emit(chunk) => chunk,
                            Step::Done(()) => {
                                self.upstream = None;
                                if self.consumed > 0 {
                                    self.complete_sink().await;
                                }
                                self.outbox.finish(Ok(()));
                                continue;
                            }
                            Step::Halt(cause) => {
                                self.fail(cause);
                                continue;
                            }
                        }
                    }
                };
                if chunk.is_empty() {
                    continue;
                }
                let len = chunk.len();
                let sink = &self.sink;
                let state = self.state.get_or_insert_with(|| sink.start());
                match state.feed(chunk).await {
                    Ok(Feed::More) => self.consumed += len,
                    Ok(Feed::Done(rest)) => {
                        self.consumed += len - rest.len();
                        if self.consumed == 0 {
                            self.fail(Cause::die(Defect::invalid_argument(
                                "transduce sink finished without consuming any element",
                            )));
                            continue;
                        }
                        if !rest.is_empty() {
                            self.pending.push_front(rest);
                        }
                        self.complete_sink().await;
                    }
                    Err(cause) => self.fail(cause),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_run_with_sinks() {
        let numbers = || Stream::<i64>::range(1, 10);
        assert_eq!(numbers().run(Sink::sum()).await, Ok(55));
        assert_eq!(numbers().run(Sink::collect_all_n(3)).await, Ok(Chunk::of([1, 2, 3])));
        assert_eq!(numbers().run_fold(0, |acc, n| acc + n).await, Ok(55));
        assert_eq!(numbers().run_count().await, Ok(10));
        assert_eq!(numbers().run_head().await, Ok(Some(1)));
        assert_eq!(numbers().run_last().await, Ok(Some(10)));
        assert_eq!(Stream::<i64>::empty().run_last().await, Ok(None));
    }

    #[tokio::test]
    async fn test_run_head_interrupts_upstream() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let stream = Stream::<u32>::iterate(0, |n| n + 1).ensuring(async move {
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(stream.run_head().await, Ok(Some(0)));
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_for_each_sees_failure() {
        let mut seen = Vec::new();
        let stream: Stream<i32, &str> = Stream::from_iter([1, 2]).concat(Stream::fail("late"));
        let exit = stream.run_for_each(|n| seen.push(n)).await;
        assert_eq!(exit, Err(Cause::fail("late")));
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_run_into_queue_ends_with_terminal_take() {
        let queue = Queue::unbounded();
        let stream: Stream<i32, &str> = Stream::from_iter([1, 2]).concat(Stream::fail("oops"));
        stream.run_into_queue(&queue).await.unwrap();
        assert_eq!(
            queue.take_all().unwrap(),
            vec![Take::chunk(Chunk::of([1, 2])), Take::fail("oops")]
        );
    }

    #[tokio::test]
    async fn test_peel_returns_rest() {
        let stream = Stream::<i64>::range_with_chunk_size(1, 6, 4);
        let (head, rest) = stream.peel(Sink::collect_all_n(2)).await.unwrap();
        assert_eq!(head, Chunk::of([1, 2]));
        assert_eq!(rest.run_collect().await, Ok(vec![3, 4, 5, 6]));
    }

    #[tokio::test]
    async fn test_peel_past_the_end() {
        let (all, rest) = Stream::<i32>::from_iter([1, 2])
            .peel(Sink::collect_all_n(5))
            .await
            .unwrap();
        assert_eq!(all, Chunk::of([1, 2]));
        assert_eq!(rest.run_collect().await, Ok(vec![]));
    }

    #[tokio::test]
    async fn test_transduce_groups_and_emits_partial_last() {
        let out = Stream::<i64>::range(1, 5)
            .transduce(Sink::collect_all_n(2))
            .run_collect()
            .await;
        assert_eq!(out, Ok(vec![Chunk::of([1, 2]), Chunk::of([3, 4]), Chunk::of([5])]));

        let sums = Stream::<i64>::range(1, 6)
            .transduce(Sink::fold(0, |sum| *sum < 5, |sum, n| sum + n))
            .run_collect()
            .await;
        assert_eq!(sums, Ok(vec![6, 9, 6]));
    }

    #[tokio::test]
    async fn test_transduce_rejects_sink_that_consumes_nothing() {
        let out = Stream::<i32>::from_iter([1])
            .transduce(Sink::<i32, _, i32>::succeed(0))
            .run_collect()
            .await;
        let cause = out.unwrap_err();
        assert!(cause.is_die());
    }

    #[tokio::test]
    async fn test_into_pull_reports_end_repeatedly() {
        let mut pull = Stream::<i32>::from_iter([1, 2]).into_pull();
        assert_eq!(pull.pull().await, Ok(Chunk::of([1, 2])));
        assert_eq!(pull.pull().await, Err(None));
        assert_eq!(pull.pull().await, Err(None));
    }

    #[tokio::test]
    async fn test_into_futures_stream() {
        let stream: Stream<i32, &str> = Stream::from_iter([1]).concat(Stream::fail("bad"));
        let items: Vec<_> = stream.into_futures_stream().collect().await;
        assert_eq!(items, vec![Ok(Chunk::of([1])), Err(Cause::fail("bad"))]);
    }
}
