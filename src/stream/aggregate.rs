//! Aggregating elements into sink results, flushed by size or by time.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Sleep;
use tracing::trace;

use super::timing::hand_off;
use super::{Outbox, Stream};
use crate::Value;
use crate::cause::{Cause, Defect};
use crate::channel::{Process, Signal};
use crate::chunk::Chunk;
use crate::runtime::{Fiber, fork_named, now};
use crate::schedule::{Schedule, ScheduleDriver};
use crate::sink::{Feed, Sink, SinkState};
use crate::sync::Handoff;
use crate::take::HandoffSignal;

impl<A: Value, E: Value> Stream<A, E> {
    /// Feed elements to `sink`, emitting its result whenever it finishes on
    /// its own or the schedule ticks.
    ///
    /// A tick only flushes a sink that consumed something. Once the schedule
    /// is exhausted results are emitted when the sink finishes or the stream
    /// ends.
    pub fn aggregate_within<Z: Value>(self, sink: Sink<A, E, Z>, schedule: Schedule) -> Stream<Z, E> {
        let driver = schedule.driver();
        self.transform(move |upstream, _| {
            let handoff = Handoff::new();
            let producer = fork_named("aggregate_within", hand_off(upstream, handoff.clone()));
            AggregateWithin {
                handoff,
                _producer: producer,
                sink,
                state: None,
                consumed: 0,
                leftovers: VecDeque::new(),
                driver: Some(driver),
                timer: None,
                outbox: Outbox::default(),
            }
        })
    }

    /// Group elements into chunks of up to `size`, emitting a partial group
    /// after `within` has passed.
    pub fn grouped_within(self, size: usize, within: Duration) -> Stream<Chunk<A>, E> {
        self.aggregate_within(Sink::collect_all_n(size.max(1)), Schedule::spaced(within))
    }
}

struct AggregateWithin<A, E, Z> {
    handoff: Handoff<HandoffSignal<A, E>>,
    _producer: Fiber<()>,
    sink: Sink<A, E, Z>,
    state: Option<Box<dyn SinkState<A, E, Z>>>,
    consumed: usize,
    leftovers: VecDeque<Chunk<A>>,
    /// `None` once the schedule is exhausted.
    driver: Option<ScheduleDriver>,
    timer: Option<Pin<Box<Sleep>>>,
    outbox: Outbox<Z, E>,
}

enum Event<A, E> {
    Tick,
    Received(HandoffSignal<A, E>),
}

impl<A: Value, E: Value, Z: Value> AggregateWithin<A, E, Z> {
    async fn flush(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        trace!("aggregate_within: flushing {} elements", self.consumed);
        self.consumed = 0;
        match state.finish().await {
            Ok(z) => self.outbox.push(Chunk::single(z)),
            Err(cause) => self.outbox.finish(Err(cause)),
        }
    }

    async fn feed(&mut self, chunk: Chunk<A>) {
        if chunk.is_empty() {
            return;
        }
        let len = chunk.len();
        let sink = &self.sink;
        let state = self.state.get_or_insert_with(|| sink.start());
        match state.feed(chunk).await {
            Ok(Feed::More) => self.consumed += len,
            Ok(Feed::Done(rest)) => {
                self.consumed += len - rest.len();
                if self.consumed == 0 {
                    self.outbox.finish(Err(Cause::die(Defect::invalid_argument(
                        "aggregate_within sink finished without consuming any element",
                    ))));
                    return;
                }
                if !rest.is_empty() {
                    self.leftovers.push_back(rest);
                }
                self.flush().await;
                self.timer = None;
            }
            Err(cause) => self.outbox.finish(Err(cause)),
        }
    }

    fn arm_timer(&mut self) {
        if self.timer.is_some() {
            return;
        }
        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        match driver.next_delay(now()) {
            Some(delay) => self.timer = Some(Box::pin(tokio::time::sleep(delay))),
            None => {
                trace!("aggregate_within: schedule ended");
                self.driver = None;
            }
        }
    }
}

impl<A: Value, E: Value, Z: Value> Process<Chunk<Z>, E, ()> for AggregateWithin<A, E, Z> {
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<Z>, E, ()>> {
        Box::pin(async move {
            loop {
                if let Some(signal) = self.outbox.next_signal() {
                    return signal;
                }
                if let Some(leftover) = self.leftovers.pop_front() {
                    self.feed(leftover).await;
                    continue;
                }
                self.arm_timer();
                let event = match self.timer.as_mut() {
                    Some(timer) => tokio::select! {
                        () = timer.as_mut() => Event::Tick,
                        signal = self.handoff.take() => Event::Received(signal),
                    },
                    None => Event::Received(self.handoff.take().await),
                };
                match event {
                    Event::Tick => {
                        self.timer = None;
                        if self.consumed > 0 {
                            self.flush().await;
                        }
                    }
                    Event::Received(HandoffSignal::Emit(chunk)) => self.feed(chunk).await,
                    Event::Received(HandoffSignal::End(_)) => {
                        if self.consumed > 0 {
                            self.flush().await;
                        }
                        self.outbox.finish(Ok(()));
                    }
                    Event::Received(HandoffSignal::Halt(cause)) => {
                        self.state = None;
                        self.outbox.finish(Err(cause));
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sleep;

    fn delayed(events: Vec<(u64, i32)>) -> Stream<i32> {
        Stream::from_iter_with_chunk_size(events, 1).map_future(|(delay, value)| async move {
            sleep(Duration::from_millis(delay)).await;
            Ok(value)
        })
    }

    fn groups(out: Vec<Chunk<i32>>) -> Vec<Vec<i32>> {
        out.into_iter().map(Chunk::into_vec).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_grouped_within_by_size() {
        let out = Stream::<i32>::from_iter(1..=7)
            .grouped_within(3, Duration::from_secs(1))
            .run_collect()
            .await
            .unwrap();
        assert_eq!(groups(out), vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grouped_within_by_time() {
        let out = delayed(vec![(0, 1), (0, 2), (150, 3), (0, 4)])
            .grouped_within(10, Duration::from_millis(100))
            .run_collect()
            .await
            .unwrap();
        assert_eq!(groups(out), vec![vec![1, 2], vec![3, 4]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_windows_do_not_flush() {
        let out = delayed(vec![(0, 1), (350, 2)])
            .grouped_within(10, Duration::from_millis(100))
            .run_collect()
            .await
            .unwrap();
        assert_eq!(groups(out), vec![vec![1], vec![2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_schedule_stops_timed_flushes() {
        let out = delayed(vec![(0, 1), (150, 2), (150, 3)])
            .aggregate_within(Sink::collect_all(), Schedule::spaced(Duration::from_millis(100)).take(1))
            .run_collect()
            .await
            .unwrap();
        assert_eq!(groups(out), vec![vec![1], vec![2, 3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregate_within_failure() {
        let stream: Stream<i32, &str> = Stream::from_iter([1, 2]).concat(Stream::fail("cut"));
        let out = stream
            .aggregate_within(Sink::sum(), Schedule::spaced(Duration::from_secs(1)))
            .run_collect()
            .await;
        assert_eq!(out, Err(Cause::fail("cut")));
    }
}
