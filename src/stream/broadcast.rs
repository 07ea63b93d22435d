//! Fanning one stream out to several consumers.
//!
//! A hub runs the upstream on its own fiber and offers every chunk to the
//! subscriber queues its decide function selects. Each queue holds up to
//! `lag` chunks; a full queue suspends the hub, so the slowest subscriber
//! paces everyone. Subscribers that go away shut their queue down and are
//! pruned on the next delivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::Stream;
use crate::Value;
use crate::cause::Cause;
use crate::channel::{Channel, Input, Process, Signal, Step};
use crate::chunk::Chunk;
use crate::config::{DEFAULT_BUFFER_SIZE, StreamConfig};
use crate::observability::record_queue_depth;
use crate::runtime::{Fiber, Scope, fork_named};
use crate::sync::{Queue, lock};
use crate::take::Take;

type Decide<A> = Box<dyn Fn(&A, u64) -> bool + Send + Sync>;

/// State shared between the hub and its producer fiber.
struct Shared<A, E> {
    targets: Mutex<Targets<A, E>>,
    subscribed: Notify,
    decide: Decide<A>,
    /// Wait for subscribers instead of stopping when there are none.
    dynamic: bool,
}

struct Targets<A, E> {
    queues: Vec<(u64, Queue<Take<A, E>>)>,
    /// How the upstream ended, replayed to late subscribers.
    terminal: Option<Take<A, E>>,
}

struct Hub<A, E> {
    shared: Arc<Shared<A, E>>,
    source: Mutex<Option<Channel<Chunk<A>, E, ()>>>,
    producer: Mutex<Option<Fiber<()>>>,
    next_id: AtomicU64,
    lag: usize,
}

impl<A, E> Hub<A, E>
where
    A: Value + Clone,
    E: Value + Clone,
{
    fn new(source: Channel<Chunk<A>, E, ()>, lag: usize, decide: Decide<A>, dynamic: bool) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                targets: Mutex::new(Targets {
                    queues: Vec::new(),
                    terminal: None,
                }),
                subscribed: Notify::new(),
                decide,
                dynamic,
            }),
            source: Mutex::new(Some(source)),
            producer: Mutex::new(None),
            next_id: AtomicU64::new(0),
            lag: lag.max(1),
        })
    }

    fn subscribe(&self) -> (u64, Queue<Take<A, E>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Queue::bounded(self.lag);
        let mut targets = lock(&self.shared.targets);
        match &targets.terminal {
            Some(terminal) => {
                let _ = queue.offer(terminal.clone()).now_or_never();
            }
            None => targets.queues.push((id, queue.clone())),
        }
        drop(targets);
        self.shared.subscribed.notify_one();
        (id, queue)
    }

    /// Start the producer on first use.
    fn start(&self) {
        let Some(source) = lock(&self.source).take() else {
            return;
        };
        debug!("broadcast: starting hub");
        let fiber = fork_named("broadcast", produce(self.shared.clone(), source));
        *lock(&self.producer) = Some(fiber);
    }

    fn consumer(self: &Arc<Self>, queue: Queue<Take<A, E>>) -> Stream<A, E> {
        let hub = self.clone();
        Stream::from_process(move |_| {
            hub.start();
            Subscriber { queue, _hub: hub }
        })
    }
}

async fn produce<A, E>(shared: Arc<Shared<A, E>>, source: Channel<Chunk<A>, E, ()>)
where
    A: Value + Clone,
    E: Value + Clone,
{
    let scope = Scope::new();
    let mut upstream = source.start(Input::empty(), scope.clone());
    let terminal = loop {
        let idle = shared.dynamic && lock(&shared.targets).queues.is_empty();
        if idle {
            shared.subscribed.notified().await;
        }
        let chunk = match upstream.next().await {
            Step::Emit(chunk) => chunk,
            Step::Done(()) => break Take::end(),
            Step::Halt(cause) => break Take::fail_cause(cause),
        };
        if !deliver(&shared, chunk).await {
            debug!("broadcast: every subscriber left");
            break Take::end();
        }
    };
    drop(upstream);
    scope.close().await;

    let queues = {
        let mut targets = lock(&shared.targets);
        targets.terminal = Some(terminal.clone());
        std::mem::take(&mut targets.queues)
    };
    for (_, queue) in queues {
        let _ = queue.offer_wait(terminal.clone()).await;
    }
}

/// Offer `chunk` to the selected subscribers. Returns false when a static
/// hub has no subscribers left.
async fn deliver<A, E>(shared: &Shared<A, E>, chunk: Chunk<A>) -> bool
where
    A: Value + Clone,
    E: Value + Clone,
{
    let queues = lock(&shared.targets).queues.clone();
    if queues.is_empty() {
        return shared.dynamic;
    }
    let mut gone = Vec::new();
    for (id, queue) in &queues {
        let selected: Chunk<A> = chunk.iter().filter(|elem| (shared.decide)(elem, *id)).cloned().collect();
        if selected.is_empty() {
            continue;
        }
        if queue.offer_wait(Take::chunk(selected)).await.is_err() {
            trace!("broadcast: pruning subscriber {}", id);
            gone.push(*id);
        } else {
            record_queue_depth("broadcast", queue.len());
        }
    }
    let mut targets = lock(&shared.targets);
    if !gone.is_empty() {
        targets.queues.retain(|(id, _)| !gone.contains(id));
    }
    shared.dynamic || !targets.queues.is_empty()
}

struct Subscriber<A, E> {
    queue: Queue<Take<A, E>>,
    /// Keeps the producer alive while this subscriber runs.
    _hub: Arc<Hub<A, E>>,
}

impl<A: Value, E: Value> Process<Chunk<A>, E, ()> for Subscriber<A, E> {
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

impl<A, E> Drop for Subscriber<A, E> {
    fn drop(&mut self) {
        self.queue.shutdown();
    }
}

/// A distribution that accepts subscribers while it runs.
///
/// Created by [`Stream::distributed_with_dynamic`]. The upstream starts with
/// the first subscription and waits while nobody is subscribed.
pub struct DynamicDistribution<A, E> {
    hub: Arc<Hub<A, E>>,
}

impl<A, E> DynamicDistribution<A, E>
where
    A: Value + Clone,
    E: Value + Clone,
{
    /// Subscribe to elements distributed from now on. Subscribing after the
    /// upstream ended yields a stream that ends the same way.
    pub fn subscribe(&self) -> (u64, Stream<A, E>) {
        let (id, queue) = self.hub.subscribe();
        self.hub.start();
        (id, self.hub.consumer(queue))
    }
}

impl<A, E> Stream<A, E>
where
    A: Value + Clone,
    E: Value + Clone,
{
    /// Copy every element to `n` streams, each allowed to lag `lag` chunks
    /// behind the fastest.
    ///
    /// The upstream starts when the first copy runs and is paced by the
    /// slowest copy still running, so every copy should be consumed.
    pub fn broadcast(self, n: usize, lag: usize) -> Vec<Stream<A, E>> {
        self.distributed_with(n, lag, |_, _| true)
    }

    /// Like [`Stream::broadcast`], letting copies lag `config.broadcast_lag`
    /// chunks.
    pub fn broadcast_with_config(self, n: usize, config: &StreamConfig) -> Vec<Stream<A, E>> {
        self.broadcast(n, config.broadcast_lag)
    }

    /// Send each element to the streams whose index `decide` accepts.
    pub fn distributed_with<F>(self, n: usize, lag: usize, decide: F) -> Vec<Stream<A, E>>
    where
        F: Fn(&A, usize) -> bool + Send + Sync + 'static,
    {
        let decide: Decide<A> = Box::new(move |elem, id| usize::try_from(id).is_ok_and(|index| decide(elem, index)));
        let hub = Hub::new(self.channel, lag, decide, false);
        (0..n)
            .map(|_| {
                let (_, queue) = hub.subscribe();
                hub.consumer(queue)
            })
            .collect()
    }

    /// Send each element to the current subscribers whose id `decide`
    /// accepts.
    pub fn distributed_with_dynamic<F>(self, lag: usize, decide: F) -> DynamicDistribution<A, E>
    where
        F: Fn(&A, u64) -> bool + Send + Sync + 'static,
    {
        DynamicDistribution {
            hub: Hub::new(self.channel, lag, Box::new(decide), true),
        }
    }

    /// Split into the elements satisfying `pred` and the rest.
    pub fn partition<F>(self, pred: F) -> (Stream<A, E>, Stream<A, E>)
    where
        F: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.partition_with_lag(pred, DEFAULT_BUFFER_SIZE)
    }

    /// Like [`Stream::partition`], letting either side lag
    /// `config.broadcast_lag` chunks behind the other.
    pub fn partition_with_config<F>(self, pred: F, config: &StreamConfig) -> (Stream<A, E>, Stream<A, E>)
    where
        F: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.partition_with_lag(pred, config.broadcast_lag)
    }

    fn partition_with_lag<F>(self, pred: F, lag: usize) -> (Stream<A, E>, Stream<A, E>)
    where
        F: Fn(&A) -> bool + Send + Sync + 'static,
    {
        let mut streams = self
            .distributed_with(2, lag, move |elem, index| pred(elem) == (index == 0))
            .into_iter();
        match (streams.next(), streams.next()) {
            (Some(satisfying), Some(rest)) => (satisfying, rest),
            _ => (Stream::empty(), Stream::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;
    use crate::runtime::fork;
    use crate::stream::StreamPull;

    #[tokio::test]
    async fn test_broadcast_copies_everything() {
        let mut copies = Stream::<i64>::range_with_chunk_size(1, 50, 7).broadcast(3, 2).into_iter();
        let (Some(a), Some(b), Some(c)) = (copies.next(), copies.next(), copies.next()) else {
            panic!("expected three copies");
        };
        let (a, b, c) = tokio::join!(a.run_collect(), b.run_collect(), c.run_count());
        let expected: Vec<i64> = (1..=50).collect();
        assert_eq!(a, Ok(expected.clone()));
        assert_eq!(b, Ok(expected));
        assert_eq!(c, Ok(50));
    }

    #[tokio::test]
    async fn test_broadcast_failure_reaches_every_copy() {
        let stream: Stream<i32, &str> = Stream::from_iter([1]).concat(Stream::fail("gone"));
        let mut copies = stream.broadcast(2, 4).into_iter();
        let (Some(a), Some(b)) = (copies.next(), copies.next()) else {
            panic!("expected two copies");
        };
        let (a, b) = tokio::join!(a.run_collect(), b.run_collect());
        assert_eq!(a, Err(Cause::fail("gone")));
        assert_eq!(b, Err(Cause::fail("gone")));
    }

    #[tokio::test]
    async fn test_dropped_copy_is_pruned() {
        let mut copies = Stream::<i64>::range_with_chunk_size(1, 100, 1).broadcast(2, 1).into_iter();
        let (Some(full), Some(short)) = (copies.next(), copies.next()) else {
            panic!("expected two copies");
        };
        let (full, short) = tokio::join!(full.run_count(), short.take(3).run_collect());
        assert_eq!(full, Ok(100));
        assert_eq!(short, Ok(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_distributed_with_routes_by_index() {
        let mut streams = Stream::<i64>::range(1, 10)
            .distributed_with(2, 4, |n, index| (n % 2 == 0) == (index == 0))
            .into_iter();
        let (Some(even), Some(odd)) = (streams.next(), streams.next()) else {
            panic!("expected two streams");
        };
        let (even, odd) = tokio::join!(even.run_collect(), odd.run_collect());
        assert_eq!(even, Ok(vec![2, 4, 6, 8, 10]));
        assert_eq!(odd, Ok(vec![1, 3, 5, 7, 9]));
    }

    #[tokio::test]
    async fn test_partition() {
        let (small, large) = Stream::<i64>::range(1, 6).partition(|n| *n <= 3);
        let (small, large) = tokio::join!(small.run_collect(), large.run_collect());
        assert_eq!(small, Ok(vec![1, 2, 3]));
        assert_eq!(large, Ok(vec![4, 5, 6]));
    }

    #[tokio::test]
    async fn test_dynamic_distribution() {
        let distribution = Stream::<i64>::range(1, 20).distributed_with_dynamic(4, |n, id| (*n as u64) % 2 == id);
        let (first, evens) = distribution.subscribe();
        let (second, odds) = distribution.subscribe();
        assert_eq!((first, second), (0, 1));
        let evens = fork(evens.run_collect());
        let odds = fork(odds.run_collect());
        let evens = evens.join::<()>().await.unwrap().unwrap();
        let odds = odds.join::<()>().await.unwrap().unwrap();
        assert!(evens.iter().all(|n| n % 2 == 0));
        assert!(odds.iter().all(|n| n % 2 == 1));
        assert!(evens.len() + odds.len() <= 20);

        let (_, late) = distribution.subscribe();
        assert_eq!(late.run_collect().await, Ok(vec![]));
    }

    async fn pull_n(pull: &mut StreamPull<i64, Infallible>, n: usize) -> Vec<i64> {
        let mut out = Vec::new();
        while out.len() < n {
            match pull.pull().await {
                Ok(chunk) => out.extend(chunk),
                Err(end) => panic!("stream ended early: {end:?}"),
            }
        }
        out
    }

    async fn pull_rest(pull: &mut StreamPull<i64, Infallible>) -> Vec<i64> {
        let mut out = Vec::new();
        loop {
            match pull.pull().await {
                Ok(chunk) => out.extend(chunk),
                Err(None) => return out,
                Err(Some(cause)) => panic!("stream failed: {cause:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_dynamic_subscriber_joins_mid_stream() {
        let source = Queue::unbounded();
        let distribution = Stream::<i64>::from_queue(source.clone(), 1)
            .take(5)
            .distributed_with_dynamic(4, |n, id| id == 0 || n % 2 == 1);
        let (_, early) = distribution.subscribe();
        let mut early = early.into_pull();
        source.offer(1).await.unwrap();
        source.offer(2).await.unwrap();
        assert_eq!(pull_n(&mut early, 2).await, vec![1, 2]);

        let (id, late) = distribution.subscribe();
        assert_eq!(id, 1);
        let mut late = late.into_pull();
        for n in 3..=5 {
            source.offer(n).await.unwrap();
        }
        assert_eq!(pull_rest(&mut early).await, vec![3, 4, 5]);
        assert_eq!(pull_rest(&mut late).await, vec![3, 5]);
    }
}
