//! Ways to build a stream.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};

use super::{Outbox, Stream};
use crate::Value;
use crate::cause::{Cause, Defect, Exit};
use crate::channel::{Channel, Process, Signal};
use crate::chunk::Chunk;
use crate::config::{DEFAULT_CHUNK_SIZE, StreamConfig};
use crate::schedule::Schedule;
use crate::sync::{PubSub, Queue, Subscription};

impl<A: Value, E: Value> Stream<A, E> {
    /// A stream that ends immediately.
    pub fn empty() -> Self {
        Self::from_channel(Channel::succeed(()))
    }

    /// A stream of one element.
    pub fn succeed(value: A) -> Self {
        Self::from_chunk(Chunk::single(value))
    }

    /// A stream of one chunk.
    pub fn from_chunk(chunk: Chunk<A>) -> Self {
        Self::from_channel(Channel::write(chunk))
    }

    /// A stream emitting the given chunks as they are.
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Chunk<A>>,
        I::IntoIter: Send + 'static,
    {
        Self::from_channel(Channel::write_all(chunks))
    }

    /// A stream of the iterator's elements, in chunks of
    /// [`DEFAULT_CHUNK_SIZE`]. The iterator is consumed lazily.
    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = A>,
        I::IntoIter: Send + 'static,
    {
        Self::from_iter_with_chunk_size(items, DEFAULT_CHUNK_SIZE)
    }

    /// Like [`Stream::from_iter`] in chunks of `config.chunk_size`.
    pub fn from_iter_with_config<I>(items: I, config: &StreamConfig) -> Self
    where
        I: IntoIterator<Item = A>,
        I::IntoIter: Send + 'static,
    {
        Self::from_iter_with_chunk_size(items, config.chunk_size)
    }

    /// Like [`Stream::from_iter`] with an explicit chunk size.
    pub fn from_iter_with_chunk_size<I>(items: I, chunk_size: usize) -> Self
    where
        I: IntoIterator<Item = A>,
        I::IntoIter: Send + 'static,
    {
        let chunk_size = chunk_size.max(1);
        let mut items = items.into_iter();
        let chunks = std::iter::from_fn(move || {
            let chunk: Chunk<A> = items.by_ref().take(chunk_size).collect();
            (!chunk.is_empty()).then_some(chunk)
        });
        Self::from_chunks(chunks)
    }

    /// A stream that fails with `error`.
    pub fn fail(error: E) -> Self {
        Self::from_channel(Channel::fail(error))
    }

    /// A stream that fails with `cause`.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_channel(Channel::fail_cause(cause))
    }

    /// A stream that dies with `defect`.
    pub fn die(defect: Defect) -> Self {
        Self::from_channel(Channel::die(defect))
    }

    /// A stream of the future's single result.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<A, E>> + Send + 'static,
    {
        Self::from_channel(
            Channel::from_future(future.map(|result| result.map_err(Cause::fail)))
                .then(|value| Channel::write(Chunk::single(value))),
        )
    }

    /// Unfold a state into elements until `f` returns `None`.
    pub fn unfold<S, F>(init: S, f: F) -> Self
    where
        S: Value,
        F: FnMut(S) -> Option<(A, S)> + Send + 'static,
    {
        Self::from_process(move |_| Unfold {
            state: Some(init),
            f,
        })
    }

    /// Unfold a state through futures until one yields `None` or fails.
    pub fn unfold_future<S, F, Fut>(init: S, f: F) -> Self
    where
        S: Value,
        F: FnMut(S) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<(A, S)>, E>> + Send + 'static,
    {
        Self::from_process(move |_| UnfoldFuture {
            state: Some(init),
            f,
        })
    }

    /// `init`, `f(init)`, `f(f(init))`, ... forever.
    pub fn iterate<F>(init: A, mut f: F) -> Self
    where
        A: Clone,
        F: FnMut(&A) -> A + Send + 'static,
    {
        Self::unfold(init, move |current| {
            let next = f(&current);
            Some((current, next))
        })
    }

    /// The same value forever.
    pub fn repeat_value(value: A) -> Self
    where
        A: Clone,
    {
        Self::unfold((), move |()| Some((value.clone(), ())))
    }

    /// Run `f` again and again, emitting each result until one fails.
    pub fn repeat_future<F, Fut>(mut f: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<A, E>> + Send + 'static,
    {
        Self::unfold_future((), move |()| {
            f().map(|result| result.map(|value| Some((value, ()))))
        })
    }

    /// A stream that never emits and never ends.
    pub fn never() -> Self {
        Self::from_channel(Channel::from_future(futures::future::pending()))
    }

    /// Build the stream when it starts.
    pub fn suspend<F>(f: F) -> Self
    where
        F: FnOnce() -> Stream<A, E> + Send + 'static,
    {
        Self::from_channel(Channel::suspend(move || f().channel))
    }

    /// Emit the resource `acquire` yields, then release it with the stream's
    /// exit once the element has been consumed and the next pull arrives, or
    /// when the run is interrupted.
    pub fn acquire_release<Acq, Rel, RelFut>(acquire: Acq, release: Rel) -> Self
    where
        A: Clone,
        Acq: Future<Output = Result<A, E>> + Send + 'static,
        Rel: FnOnce(A, &Exit<(), E>) -> RelFut + Send + 'static,
        RelFut: Future<Output = ()> + Send + 'static,
    {
        let acquire = acquire.map(|result| result.map_err(Cause::fail));
        Self::from_channel(Channel::from_future(acquire).then(move |resource: A| {
            let emitted = resource.clone();
            Channel::write(Chunk::single(emitted))
                .ensuring_with(move |exit| release(resource, exit))
        }))
    }

    /// Drain `queue` in chunks of at most `max_chunk_size` until it shuts
    /// down. Items still queued at shutdown are discarded by the queue.
    pub fn from_queue(queue: Queue<A>, max_chunk_size: usize) -> Self {
        let max_chunk_size = max_chunk_size.max(1);
        Stream::<Chunk<A>, E>::unfold_future(queue, move |queue| async move {
            let first = match queue.take().await {
                Ok(first) => first,
                Err(_) => return Ok(None),
            };
            let mut items = vec![first];
            items.extend(queue.take_up_to(max_chunk_size - 1).unwrap_or_default());
            Ok(Some((Chunk::from_vec(items), queue)))
        })
        .flatten_chunks()
    }

    /// Subscribe to `pubsub` now and stream what it publishes from then on.
    pub fn from_pubsub(pubsub: &PubSub<A>) -> Self
    where
        A: Clone,
    {
        match pubsub.subscribe() {
            Ok(subscription) => Self::from_subscription(subscription),
            Err(_) => Self::empty(),
        }
    }

    /// Stream what an existing subscription receives.
    pub fn from_subscription(subscription: Subscription<A>) -> Self {
        Stream::<Chunk<A>, E>::unfold_future(subscription, |subscription| async move {
            let Ok(first) = subscription.take().await else {
                return Ok(None);
            };
            let mut items = vec![first];
            items.extend(subscription.take_all().unwrap_or_default());
            Ok(Some((Chunk::from_vec(items), subscription)))
        })
        .flatten_chunks()
    }

    /// Adapt a `futures::Stream`, batching items that are ready together.
    pub fn from_futures_stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = A> + Send + 'static,
    {
        Self::from_try_stream(stream.map(Ok))
    }

    /// Adapt a fallible `futures::Stream`. The first error fails the stream
    /// after the items before it are emitted.
    pub fn from_try_stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = Result<A, E>> + Send + 'static,
    {
        Self::from_process(move |_| FromTryStream {
            batches: stream.ready_chunks(DEFAULT_CHUNK_SIZE).boxed(),
            outbox: Outbox::default(),
        })
    }
}

impl<E: Value> Stream<i64, E> {
    /// The integers from `min` to `max`, both included, in chunks of
    /// [`DEFAULT_CHUNK_SIZE`].
    pub fn range(min: i64, max: i64) -> Self {
        Self::range_with_chunk_size(min, max, DEFAULT_CHUNK_SIZE)
    }

    /// Like [`Stream::range`] with an explicit chunk size.
    pub fn range_with_chunk_size(min: i64, max: i64, chunk_size: usize) -> Self {
        Self::from_iter_with_chunk_size(min..=max, chunk_size)
    }
}

impl<E: Value> Stream<(), E> {
    /// Emit `()` now and then once per `interval`.
    pub fn tick(interval: Duration) -> Self {
        Self::succeed(()).concat(Self::repeat_value(()).schedule(Schedule::spaced(interval)))
    }
}

// ============================================================================
// Processes
// ============================================================================

fn exhausted<A, E>(what: &str) -> Signal<Chunk<A>, E, ()> {
    Signal::Halt(Cause::die(Defect::message(format!("{what} pulled after it ended"))))
}

struct Unfold<S, F> {
    state: Option<S>,
    f: F,
}

impl<A, E, S, F> Process<Chunk<A>, E, ()> for Unfold<S, F>
where
    A: Value,
    E: Value,
    S: Value,
    F: FnMut(S) -> Option<(A, S)> + Send,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<A>, E, ()>> {
        let signal = match self.state.take() {
            None => exhausted("unfold"),
            Some(state) => match (self.f)(state) {
                Some((value, next)) => {
                    self.state = Some(next);
                    Signal::Emit(Chunk::single(value))
                }
                None => Signal::Done(()),
            },
        };
        Box::pin(std::future::ready(signal))
    }
}

struct UnfoldFuture<S, F> {
    state: Option<S>,
    f: F,
}

impl<A, E, S, F, Fut> Process<Chunk<A>, E, ()> for UnfoldFuture<S, F>
where
    A: Value,
    E: Value,
    S: Value,
    F: FnMut(S) -> Fut + Send,
    Fut: Future<Output = Result<Option<(A, S)>, E>> + Send,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<A>, E, ()>> {
        Box::pin(async move {
            let Some(state) = self.state.take() else {
                return exhausted("unfold_future");
            };
            match (self.f)(state).await {
                Ok(Some((value, next))) => {
                    self.state = Some(next);
                    Signal::Emit(Chunk::single(value))
                }
                Ok(None) => Signal::Done(()),
                Err(error) => Signal::Halt(Cause::fail(error)),
            }
        })
    }
}

struct FromTryStream<A, E> {
    batches: futures::stream::BoxStream<'static, Vec<Result<A, E>>>,
    outbox: Outbox<A, E>,
}

impl<A: Value, E: Value> Process<Chunk<A>, E, ()> for FromTryStream<A, E> {
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<A>, E, ()>> {
        Box::pin(async move {
            loop {
                if let Some(signal) = self.outbox.next_signal() {
                    return signal;
                }
                let Some(batch) = self.batches.next().await else {
                    self.outbox.finish(Ok(()));
                    continue;
                };
                let mut items = Vec::with_capacity(batch.len());
                for item in batch {
                    match item {
                        Ok(value) => items.push(value),
                        Err(error) => {
                            self.outbox.finish(Err(Cause::fail(error)));
                            break;
                        }
                    }
                }
                self.outbox.push(Chunk::from_vec(items));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_from_iter_is_chunked() {
        let chunks = Stream::<i32>::from_iter_with_chunk_size(1..=5, 2)
            .chunks()
            .run_collect()
            .await
            .unwrap();
        assert_eq!(chunks, vec![Chunk::of([1, 2]), Chunk::of([3, 4]), Chunk::of([5])]);
    }

    #[tokio::test]
    async fn test_range_is_inclusive() {
        assert_eq!(Stream::<i64>::range(3, 5).run_collect().await, Ok(vec![3, 4, 5]));
        assert_eq!(Stream::<i64>::range(5, 3).run_collect().await, Ok(vec![]));
    }

    #[tokio::test]
    async fn test_unfold_and_unfold_future() {
        let countdown = Stream::<u32>::unfold(3, |n| (n > 0).then(|| (n, n - 1)));
        assert_eq!(countdown.run_collect().await, Ok(vec![3, 2, 1]));

        let failing: Stream<u32, &str> = Stream::unfold_future(0, |n| async move {
            if n < 2 { Ok(Some((n, n + 1))) } else { Err("stop") }
        });
        assert_eq!(failing.run_collect().await, Err(Cause::fail("stop")));
    }

    #[tokio::test]
    async fn test_from_future_and_suspend() {
        let single: Stream<i32, &str> = Stream::from_future(async { Ok(7) });
        assert_eq!(single.run_collect().await, Ok(vec![7]));
        let failed: Stream<i32, &str> = Stream::from_future(async { Err("nope") });
        assert_eq!(failed.run_collect().await, Err(Cause::fail("nope")));

        let built = Arc::new(Mutex::new(false));
        let flag = built.clone();
        let lazy: Stream<i32> = Stream::suspend(move || {
            *flag.lock().unwrap() = true;
            Stream::succeed(1)
        });
        assert!(!*built.lock().unwrap());
        assert_eq!(lazy.run_collect().await, Ok(vec![1]));
        assert!(*built.lock().unwrap());
    }

    #[tokio::test]
    async fn test_acquire_release_releases_after_use() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (use_log, release_log) = (log.clone(), log.clone());
        let stream: Stream<&str, ()> = Stream::acquire_release(async { Ok("conn") }, move |conn, exit| {
            release_log.lock().unwrap().push(format!("release {conn} ok={}", exit.is_ok()));
            async {}
        });
        stream
            .tap(move |conn| use_log.lock().unwrap().push(format!("use {conn}")))
            .run_drain()
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["use conn", "release conn ok=true"]);
    }

    #[tokio::test]
    async fn test_from_queue_until_shutdown() {
        let queue = Queue::unbounded();
        queue.offer_all([1, 2, 3]).await.unwrap();
        let stream: Stream<i32> = Stream::from_queue(queue.clone(), 2);
        let chunks = stream.take(3).chunks().run_collect().await.unwrap();
        assert_eq!(chunks, vec![Chunk::of([1, 2]), Chunk::of([3])]);

        queue.shutdown();
        let drained: Stream<i32> = Stream::from_queue(queue, 2);
        assert_eq!(drained.run_collect().await, Ok(vec![]));
    }

    #[tokio::test]
    async fn test_from_pubsub_subscribes_eagerly() {
        let hub = PubSub::unbounded();
        let stream: Stream<i32> = Stream::from_pubsub(&hub);
        hub.publish_all([1, 2]).await.unwrap();
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(stream.take(2).run_collect().await, Ok(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_from_try_stream_fails_after_prefix() {
        let source = futures::stream::iter(vec![Ok(1), Ok(2), Err("bad"), Ok(4)]);
        let mut pull = Stream::from_try_stream(source).into_pull();
        assert_eq!(pull.pull().await, Ok(Chunk::of([1, 2])));
        assert_eq!(pull.pull().await, Err(Some(Cause::fail("bad"))));
    }

    #[tokio::test]
    async fn test_repeat_and_iterate() {
        let repeated: Stream<char> = Stream::repeat_value('z').take(3);
        assert_eq!(repeated.run_collect().await, Ok(vec!['z', 'z', 'z']));
        let doubled: Stream<u64> = Stream::iterate(1, |n| n * 2).take(5);
        assert_eq!(doubled.run_collect().await, Ok(vec![1, 2, 4, 8, 16]));
    }
}
