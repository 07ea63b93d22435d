//! Concurrent expansion of a channel's output: `merge_map`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use super::Channel;
use super::process::{Executor, Input, Process, Signal, Step};
use crate::Value;
use crate::cause::Cause;
use crate::config::DEFAULT_BUFFER_SIZE;
use crate::runtime::{Fiber, Scope, fork_named};
use crate::sync::{Queue, lock};

/// How `merge_map` treats producers that outrun the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Children wait when the output buffer is full, and new children wait
    /// for a free concurrency slot.
    #[default]
    BackPressure,
    /// The output buffer drops its oldest element when full, and at the
    /// concurrency limit the oldest running child is interrupted to make room
    /// for the new one (latest wins).
    BufferSliding,
}

/// Options for [`Channel::merge_map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeMapOptions {
    /// Maximum number of children running at once.
    pub concurrency: usize,
    /// Capacity of the shared output buffer.
    pub buffer_size: usize,
    /// Overflow behavior.
    pub strategy: MergeStrategy,
}

impl Default for MergeMapOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_BUFFER_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            strategy: MergeStrategy::BackPressure,
        }
    }
}

impl MergeMapOptions {
    /// Back-pressured merging with `concurrency` children.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    /// Set the output buffer capacity.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the overflow strategy.
    pub fn strategy(mut self, strategy: MergeStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// What the workers hand the consumer.
enum Merged<O> {
    Emit(O),
    /// A failure was recorded in the shared slot.
    Failed,
    /// The outer channel and every child finished.
    End,
}

type FailureSlot<E> = Arc<Mutex<Option<Cause<E>>>>;

async fn report_failure<O, E>(failure: &FailureSlot<E>, queue: &Queue<Merged<O>>, cause: Cause<E>) {
    {
        let mut slot = lock(failure);
        let combined = match slot.take() {
            Some(previous) => previous.both(cause),
            None => cause,
        };
        *slot = Some(combined);
    }
    // The marker only wakes the consumer; the cause itself sits in the slot
    // where a sliding buffer cannot evict it.
    let _ = queue.offer_wait(Merged::Failed).await;
}

async fn run_child<O, E>(
    mut child: Executor<O, E, ()>,
    queue: Queue<Merged<O>>,
    failure: FailureSlot<E>,
    _permit: OwnedSemaphorePermit,
) where
    O: Value,
    E: Value,
{
    loop {
        match child.next().await {
            Step::Emit(out) => {
                if queue.offer(Merged::Emit(out)).await.is_err() {
                    return;
                }
            }
            Step::Done(()) => return,
            Step::Halt(cause) => {
                report_failure(&failure, &queue, cause).await;
                return;
            }
        }
    }
}

struct Coordinator<O, O2, E, D, F> {
    outer: Executor<O, E, D>,
    f: F,
    options: MergeMapOptions,
    queue: Queue<Merged<O2>>,
    failure: FailureSlot<E>,
    scope: Scope,
}

impl<O, O2, E, D, F> Coordinator<O, O2, E, D, F>
where
    O: Value,
    O2: Value,
    E: Value,
    D: Value,
    F: FnMut(O) -> Channel<O2, E, ()> + Send + 'static,
{
    async fn run(mut self) {
        let permits = Arc::new(Semaphore::new(
            self.options.concurrency.clamp(1, Semaphore::MAX_PERMITS),
        ));
        let mut children: VecDeque<Fiber<()>> = VecDeque::new();
        loop {
            match self.outer.next().await {
                Step::Emit(elem) => {
                    let Some(permit) =
                        acquire(self.options.strategy, &permits, &mut children).await
                    else {
                        return;
                    };
                    children.retain(|child| !child.is_finished());
                    let child = (self.f)(elem).start(Input::empty(), self.scope.clone());
                    children.push_back(fork_named(
                        "merge_map",
                        run_child(child, self.queue.clone(), self.failure.clone(), permit),
                    ));
                }
                Step::Done(_) => break,
                Step::Halt(cause) => {
                    report_failure(&self.failure, &self.queue, cause).await;
                    return;
                }
            }
        }
        debug!("merge_map outer finished, waiting for {} children", children.len());
        for child in children {
            let _ = child.join::<E>().await;
        }
        let _ = self.queue.offer_wait(Merged::End).await;
    }
}

async fn acquire(
    strategy: MergeStrategy,
    permits: &Arc<Semaphore>,
    children: &mut VecDeque<Fiber<()>>,
) -> Option<OwnedSemaphorePermit> {
    if strategy == MergeStrategy::BufferSliding {
        if let Ok(permit) = permits.clone().try_acquire_owned() {
            return Some(permit);
        }
        while let Some(oldest) = children.pop_front() {
            if !oldest.is_finished() {
                trace!("merge_map at capacity, interrupting oldest child");
                oldest.interrupt().await;
                break;
            }
        }
    }
    permits.clone().acquire_owned().await.ok()
}

/// Consumer side of `merge_map`: starts the coordinator on first pull and
/// reads the shared output buffer.
pub(super) struct MergeMap<O, O2, E, D, F> {
    pending: Option<Coordinator<O, O2, E, D, F>>,
    coordinator: Option<Fiber<()>>,
    queue: Queue<Merged<O2>>,
    failure: FailureSlot<E>,
}

impl<O, O2, E, D, F> MergeMap<O, O2, E, D, F>
where
    O: Value,
    O2: Value,
    E: Value,
    D: Value,
    F: FnMut(O) -> Channel<O2, E, ()> + Send + 'static,
{
    pub(super) fn new(outer: Executor<O, E, D>, f: F, options: MergeMapOptions, scope: Scope) -> Self {
        let queue = match options.strategy {
            MergeStrategy::BackPressure => Queue::bounded(options.buffer_size),
            MergeStrategy::BufferSliding => Queue::sliding(options.buffer_size),
        };
        let failure = Arc::new(Mutex::new(None));
        Self {
            pending: Some(Coordinator {
                outer,
                f,
                options,
                queue: queue.clone(),
                failure: failure.clone(),
                scope,
            }),
            coordinator: None,
            queue,
            failure,
        }
    }
}

impl<O, O2, E, D, F> Process<O2, E, ()> for MergeMap<O, O2, E, D, F>
where
    O: Value,
    O2: Value,
    E: Value,
    D: Value,
    F: FnMut(O) -> Channel<O2, E, ()> + Send + 'static,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<O2, E, ()>> {
        Box::pin(async move {
            if let Some(coordinator) = self.pending.take() {
                self.coordinator = Some(fork_named("merge_map", coordinator.run()));
            }
            loop {
                if let Some(cause) = lock(&self.failure).take() {
                    return Signal::Halt(cause);
                }
                match self.queue.take().await {
                    Ok(Merged::Emit(out)) => return Signal::Emit(out),
                    Ok(Merged::Failed) => continue,
                    Ok(Merged::End) => return Signal::Done(()),
                    Err(_) => return Signal::Halt(Cause::interrupt()),
                }
            }
        })
    }
}

impl<O, O2, E, D, F> Drop for MergeMap<O, O2, E, D, F> {
    fn drop(&mut self) {
        // Interrupts the coordinator, which in turn drops its children.
        self.coordinator.take();
        self.queue.shutdown();
    }
}
