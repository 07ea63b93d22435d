//! Time-based operators: throttle, debounce and schedule.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::{Instant, Sleep};
use tracing::{trace, warn};

use super::{Outbox, Stream, Upstream};
use crate::Value;
use crate::cause::Cause;
use crate::channel::{Process, Signal, Step};
use crate::chunk::Chunk;
use crate::observability::record_elements_dropped;
use crate::runtime::{Fiber, fork_named, now, sleep};
use crate::schedule::{Schedule, ScheduleDriver};
use crate::sync::Handoff;
use crate::take::{EndReason, HandoffSignal};

/// What `throttle` does with chunks that arrive faster than the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThrottleStrategy {
    /// Delay chunks until the budget allows them.
    #[default]
    Shape,
    /// Hold chunks until tokens accrue, never going into debt. A chunk
    /// whose cost exceeds `units + burst` can never be paid for and is
    /// dropped with a warning.
    Enforce,
}

/// Token bucket settings for [`Stream::throttle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleOptions {
    /// Tokens added per `duration`.
    pub units: u64,
    /// Refill period.
    pub duration: Duration,
    /// Extra tokens the bucket can hold beyond `units`.
    pub burst: u64,
    /// Shape or enforce.
    pub strategy: ThrottleStrategy,
}

impl ThrottleOptions {
    /// Delay chunks to `units` per `duration`.
    pub fn shape(units: u64, duration: Duration) -> Self {
        Self {
            units,
            duration,
            burst: 0,
            strategy: ThrottleStrategy::Shape,
        }
    }

    /// Enforce `units` per `duration`.
    pub fn enforce(units: u64, duration: Duration) -> Self {
        Self {
            strategy: ThrottleStrategy::Enforce,
            ..Self::shape(units, duration)
        }
    }

    /// Allow bursts of up to `burst` extra tokens.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }
}

/// A continuously refilled token bucket.
struct Bucket {
    units: f64,
    capacity: f64,
    period: f64,
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn new(options: &ThrottleOptions) -> Self {
        let units = options.units.max(1) as f64;
        Self {
            units,
            capacity: units + options.burst as f64,
            period: options.duration.as_secs_f64(),
            tokens: units,
            last: now(),
        }
    }

    /// Tokens available at `at`, capped at the bucket capacity.
    fn available(&self, at: Instant) -> f64 {
        let elapsed = at.saturating_duration_since(self.last).as_secs_f64();
        if self.period <= 0.0 {
            return self.capacity;
        }
        (self.tokens + elapsed * self.units / self.period).min(self.capacity)
    }

    /// Time until `deficit` tokens accrue.
    fn wait_for(&self, deficit: f64) -> Duration {
        Duration::try_from_secs_f64(deficit / self.units * self.period).unwrap_or(Duration::MAX)
    }

    fn set(&mut self, tokens: f64, at: Instant) {
        self.tokens = tokens;
        self.last = at;
    }
}

impl<A: Value, E: Value> Stream<A, E> {
    /// Limit the rate of chunks with a token bucket, charging `cost` per
    /// chunk. Under [`ThrottleStrategy::Enforce`] a chunk costing more than
    /// `units + burst` is dropped.
    pub fn throttle<F>(self, options: ThrottleOptions, mut cost: F) -> Self
    where
        F: FnMut(&Chunk<A>) -> u64 + Send + 'static,
    {
        self.throttle_effect(options, move |chunk| std::future::ready(Ok(cost(chunk))))
    }

    /// Like [`Stream::throttle`] with a cost computed by a future, which may
    /// fail the stream.
    pub fn throttle_effect<F, Fut>(self, options: ThrottleOptions, cost: F) -> Self
    where
        F: FnMut(&Chunk<A>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<u64, E>> + Send + 'static,
    {
        self.transform(move |upstream, _| Throttle {
            upstream,
            bucket: Bucket::new(&options),
            strategy: options.strategy,
            cost,
        })
    }

    /// Emit an element only after `duration` passed without a newer one.
    ///
    /// The last pending element is emitted when the upstream ends, and
    /// before its failure.
    pub fn debounce(self, duration: Duration) -> Self {
        self.transform(move |upstream, _| {
            let handoff = Handoff::new();
            let producer = fork_named("debounce", hand_off(upstream, handoff.clone()));
            Debounce {
                handoff,
                _producer: producer,
                duration,
                state: DebounceState::Idle,
                outbox: Outbox::default(),
            }
        })
    }

    /// Emit elements one at a time, waiting the schedule's delay before
    /// each. An exhausted schedule starts over.
    pub fn schedule(self, schedule: Schedule) -> Self {
        let driver = schedule.driver();
        self.transform(move |upstream, _| Scheduled {
            upstream,
            driver,
            pending: VecDeque::new(),
        })
    }
}

// ============================================================================
// Throttle
// ============================================================================

struct Throttle<A, E, F> {
    upstream: Upstream<A, E>,
    bucket: Bucket,
    strategy: ThrottleStrategy,
    cost: F,
}

impl<A, E, F, Fut> Process<Chunk<A>, E, ()> for Throttle<A, E, F>
where
    A: Value,
    E: Value,
    F: FnMut(&Chunk<A>) -> Fut + Send,
    Fut: Future<Output = Result<u64, E>> + Send + 'static,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<A>, E, ()>> {
        Box::pin(async move {
            loop {
                let chunk = match self.upstream.next().await {
                    Step::Emit(chunk) => chunk,
                    Step::Done(()) => return Signal::Done(()),
                    Step::Halt(cause) => return Signal::Halt(cause),
                };
                let weight = match (self.cost)(&chunk).await {
                    Ok(weight) => weight as f64,
                    Err(error) => return Signal::Halt(Cause::fail(error)),
                };
                let current = now();
                let available = self.bucket.available(current);
                match self.strategy {
                    ThrottleStrategy::Shape => {
                        let remaining = available - weight;
                        self.bucket.set(remaining, current);
                        if remaining < 0.0 {
                            let delay = self.bucket.wait_for(-remaining);
                            trace!("throttle: shaping chunk by {:?}", delay);
                            sleep(delay).await;
                        }
                        return Signal::Emit(chunk);
                    }
                    ThrottleStrategy::Enforce => {
                        if weight > self.bucket.capacity {
                            warn!(
                                "throttle: dropping chunk of cost {} above bucket capacity {}",
                                weight, self.bucket.capacity
                            );
                            record_elements_dropped("throttle", chunk.len() as u64);
                            self.bucket.set(available, current);
                            continue;
                        }
                        if available >= weight {
                            self.bucket.set(available - weight, current);
                            return Signal::Emit(chunk);
                        }
                        self.bucket.set(available, current);
                        sleep(self.bucket.wait_for(weight - available)).await;
                        let refilled = now();
                        let available = self.bucket.available(refilled);
                        self.bucket.set((available - weight).max(0.0), refilled);
                        return Signal::Emit(chunk);
                    }
                }
            }
        })
    }
}

// ============================================================================
// Debounce
// ============================================================================

pub(super) async fn hand_off<A: Value, E: Value>(mut upstream: Upstream<A, E>, handoff: Handoff<HandoffSignal<A, E>>) {
    loop {
        let signal = match upstream.next().await {
            Step::Emit(chunk) => HandoffSignal::Emit(chunk),
            Step::Done(()) => HandoffSignal::End(EndReason::UpstreamEnd),
            Step::Halt(cause) => HandoffSignal::Halt(cause),
        };
        let last = !matches!(signal, HandoffSignal::Emit(_));
        handoff.offer(signal).await;
        if last {
            return;
        }
    }
}

enum DebounceState<A> {
    /// Nothing is waiting to be emitted.
    Idle,
    /// The latest element, emitted when the timer fires.
    Previous { pending: A, timer: Pin<Box<Sleep>> },
}

struct Debounce<A, E> {
    handoff: Handoff<HandoffSignal<A, E>>,
    _producer: Fiber<()>,
    duration: Duration,
    state: DebounceState<A>,
    outbox: Outbox<A, E>,
}

impl<A: Value, E: Value> Debounce<A, E> {
    fn flush_pending(&mut self) {
        if let DebounceState::Previous { pending, .. } =
            std::mem::replace(&mut self.state, DebounceState::Idle)
        {
            self.outbox.push(Chunk::single(pending));
        }
    }
}

impl<A: Value, E: Value> Process<Chunk<A>, E, ()> for Debounce<A, E> {
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<A>, E, ()>> {
        Box::pin(async move {
            loop {
                if let Some(signal) = self.outbox.next_signal() {
                    return signal;
                }
                let received = match &mut self.state {
                    DebounceState::Idle => Some(self.handoff.take().await),
                    DebounceState::Previous { timer, .. } => tokio::select! {
                        () = timer.as_mut() => None,
                        signal = self.handoff.take() => Some(signal),
                    },
                };
                match received {
                    None => self.flush_pending(),
                    Some(HandoffSignal::Emit(chunk)) => {
                        if let Some(latest) = chunk.last_owned() {
                            self.state = DebounceState::Previous {
                                pending: latest,
                                timer: Box::pin(tokio::time::sleep(self.duration)),
                            };
                        }
                    }
                    Some(HandoffSignal::End(_)) => {
                        self.flush_pending();
                        self.outbox.finish(Ok(()));
                    }
                    Some(HandoffSignal::Halt(cause)) => {
                        self.flush_pending();
                        self.outbox.finish(Err(cause));
                    }
                }
            }
        })
    }
}

// ============================================================================
// Schedule
// ============================================================================

struct Scheduled<A, E> {
    upstream: Upstream<A, E>,
    driver: ScheduleDriver,
    pending: VecDeque<A>,
}

impl<A: Value, E: Value> Process<Chunk<A>, E, ()> for Scheduled<A, E> {
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<A>, E, ()>> {
        Box::pin(async move {
            loop {
                if let Some(elem) = self.pending.pop_front() {
                    match self.driver.next_delay(now()) {
                        Some(delay) if !delay.is_zero() => sleep(delay).await,
                        Some(_) => {}
                        None => self.driver.reset(),
                    }
                    return Signal::Emit(Chunk::single(elem));
                }
                match self.upstream.next().await {
                    Step::Emit(chunk) => self.pending.extend(chunk),
                    Step::Done(()) => return Signal::Done(()),
                    Step::Halt(cause) => return Signal::Halt(cause),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elapsed_ms(start: Instant) -> u128 {
        now().duration_since(start).as_millis()
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_shape_delays_third_chunk() {
        let start = now();
        let out = Stream::<i32>::from_iter_with_chunk_size([1, 2, 3], 1)
            .throttle(ThrottleOptions::shape(2, Duration::from_secs(1)), |_| 1)
            .map(move |n| (n, elapsed_ms(start)))
            .run_collect()
            .await
            .unwrap();
        assert_eq!(out[0], (1, 0));
        assert_eq!(out[1], (2, 0));
        assert_eq!(out[2].0, 3);
        assert!((490..=510).contains(&out[2].1), "third chunk at {}ms", out[2].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_enforce_holds_and_drops() {
        let start = now();
        let chunks = [Chunk::of([1]), Chunk::of([2]), Chunk::of([3, 4, 5])];
        let out = Stream::<i32>::from_chunks(chunks)
            .throttle(ThrottleOptions::enforce(1, Duration::from_secs(1)), |chunk| chunk.len() as u64)
            .map(move |n| (n, elapsed_ms(start)))
            .run_collect()
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], (1, 0));
        assert_eq!(out[1].0, 2);
        assert!((990..=1010).contains(&out[1].1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_effect_failure() {
        let out = Stream::<i32, &str>::from_iter([1])
            .throttle_effect(ThrottleOptions::shape(1, Duration::from_secs(1)), |_| async {
                Err("no budget")
            })
            .run_collect()
            .await;
        assert_eq!(out, Err(Cause::fail("no budget")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_emits_last_of_each_burst() {
        let events = [(0, 1), (10, 2), (10, 3), (200, 4), (10, 5), (200, 6)];
        let out = Stream::<(u64, i32)>::from_iter_with_chunk_size(events, 1)
            .map_future(|(delay, value)| async move {
                sleep(Duration::from_millis(delay)).await;
                Ok(value)
            })
            .debounce(Duration::from_millis(100))
            .run_collect()
            .await;
        assert_eq!(out, Ok(vec![3, 5, 6]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_flushes_before_failure() {
        let stream: Stream<i32, &str> = Stream::from_iter([1, 2]).concat(Stream::fail("late"));
        let mut pull = stream.debounce(Duration::from_secs(1)).into_pull();
        assert_eq!(pull.pull().await, Ok(Chunk::of([2])));
        assert_eq!(pull.pull().await, Err(Some(Cause::fail("late"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_spaces_elements() {
        let start = now();
        let out = Stream::<i32>::from_iter([1, 2, 3])
            .schedule(Schedule::spaced(Duration::from_millis(100)))
            .map(move |n| (n, elapsed_ms(start)))
            .run_collect()
            .await
            .unwrap();
        assert_eq!(out, vec![(1, 100), (2, 200), (3, 300)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_starts_immediately() {
        let start = now();
        let out = Stream::<()>::tick(Duration::from_millis(50))
            .take(3)
            .map(move |()| elapsed_ms(start))
            .run_collect()
            .await;
        assert_eq!(out, Ok(vec![0, 50, 100]));
    }
}
