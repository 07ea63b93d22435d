//! Async queue with overflow strategies.
//!
//! The strategies mirror the leaky modes of a pipeline queue element:
//!
//! - [`OverflowStrategy::Suspend`]: a full queue makes `offer` wait (back-pressure)
//! - [`OverflowStrategy::Dropping`]: a full queue rejects the new item
//! - [`OverflowStrategy::Sliding`]: a full queue evicts its oldest item

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::trace;

use super::{Latch, lock};
use crate::error::{Error, Result};
use crate::observability::record_elements_dropped;

/// What `offer` does when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowStrategy {
    /// Wait for space.
    #[default]
    Suspend,
    /// Reject the new item.
    Dropping,
    /// Evict the oldest item.
    Sliding,
}

impl OverflowStrategy {
    fn drop_site(self) -> &'static str {
        match self {
            Self::Suspend => "queue",
            Self::Dropping => "queue-dropping",
            Self::Sliding => "queue-sliding",
        }
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items currently queued.
    pub len: usize,
    /// Items accepted by `offer`.
    pub offered: u64,
    /// Items handed out by `take`.
    pub taken: u64,
    /// Items rejected or evicted by the overflow strategy.
    pub dropped: u64,
}

struct QueueState<T> {
    items: VecDeque<T>,
    shutdown: bool,
    offered: u64,
    taken: u64,
    dropped: u64,
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    capacity: Option<usize>,
    strategy: OverflowStrategy,
    not_empty: Notify,
    not_full: Notify,
    closed: Latch,
}

/// A multi-producer, multi-consumer async queue.
///
/// Cloning the handle shares the queue.
pub struct Queue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Queue<T> {
    /// A bounded queue whose offers wait for space. A capacity of 0 is
    /// treated as 1.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_strategy(Some(capacity), OverflowStrategy::Suspend)
    }

    /// A bounded queue that rejects offers when full.
    pub fn dropping(capacity: usize) -> Self {
        Self::with_strategy(Some(capacity), OverflowStrategy::Dropping)
    }

    /// A bounded queue that evicts the oldest item when full.
    pub fn sliding(capacity: usize) -> Self {
        Self::with_strategy(Some(capacity), OverflowStrategy::Sliding)
    }

    /// A queue without a capacity limit.
    pub fn unbounded() -> Self {
        Self::with_strategy(None, OverflowStrategy::Suspend)
    }

    /// A queue with an explicit capacity and strategy.
    pub fn with_strategy(capacity: Option<usize>, strategy: OverflowStrategy) -> Self {
        let capacity = capacity.map(|c| c.max(1));
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    items: VecDeque::with_capacity(capacity.unwrap_or(0).min(1024)),
                    shutdown: false,
                    offered: 0,
                    taken: 0,
                    dropped: 0,
                }),
                capacity,
                strategy,
                not_empty: Notify::new(),
                not_full: Notify::new(),
                closed: Latch::new(),
            }),
        }
    }

    /// Offer an item according to the queue's strategy.
    ///
    /// Returns `Ok(false)` when a dropping queue rejected the item.
    pub async fn offer(&self, item: T) -> Result<bool> {
        match self.inner.strategy {
            OverflowStrategy::Suspend => self.offer_wait(item).await.map(|()| true),
            strategy => self.offer_lossy(item, strategy),
        }
    }

    /// Offer an item, waiting for space whatever the strategy.
    ///
    /// Terminal signals go through here so a lossy queue cannot discard them.
    pub async fn offer_wait(&self, item: T) -> Result<()> {
        loop {
            let mut space = pin!(self.inner.not_full.notified());
            space.as_mut().enable();
            {
                let mut state = lock(&self.inner.state);
                if state.shutdown {
                    return Err(Error::Shutdown);
                }
                if !self.is_full_locked(&state) {
                    self.push_locked(&mut state, item);
                    return Ok(());
                }
            }
            space.await;
        }
    }

    fn offer_lossy(&self, item: T, strategy: OverflowStrategy) -> Result<bool> {
        let mut state = lock(&self.inner.state);
        if state.shutdown {
            return Err(Error::Shutdown);
        }
        if !self.is_full_locked(&state) {
            self.push_locked(&mut state, item);
            return Ok(true);
        }
        state.dropped += 1;
        record_elements_dropped(strategy.drop_site(), 1);
        if strategy == OverflowStrategy::Sliding {
            trace!("sliding queue full, evicting oldest item");
            state.items.pop_front();
            self.push_locked(&mut state, item);
            Ok(true)
        } else {
            trace!("dropping queue full, rejecting item");
            Ok(false)
        }
    }

    /// Offer every item in order; returns how many were accepted.
    pub async fn offer_all<I>(&self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = T>,
    {
        let mut accepted = 0;
        for item in items {
            if self.offer(item).await? {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    fn is_full_locked(&self, state: &QueueState<T>) -> bool {
        self.inner
            .capacity
            .is_some_and(|capacity| state.items.len() >= capacity)
    }

    fn push_locked(&self, state: &mut QueueState<T>, item: T) {
        state.items.push_back(item);
        state.offered += 1;
        self.inner.not_empty.notify_waiters();
    }

    /// Wait for an item.
    ///
    /// Fails with [`Error::Shutdown`] once the queue is shut down.
    pub async fn take(&self) -> Result<T> {
        loop {
            let mut available = pin!(self.inner.not_empty.notified());
            available.as_mut().enable();
            match self.poll()? {
                Some(item) => return Ok(item),
                None => available.await,
            }
        }
    }

    /// Take an item if one is queued.
    pub fn poll(&self) -> Result<Option<T>> {
        let mut state = lock(&self.inner.state);
        if state.shutdown {
            return Err(Error::Shutdown);
        }
        let item = state.items.pop_front();
        if item.is_some() {
            state.taken += 1;
            self.inner.not_full.notify_waiters();
        }
        Ok(item)
    }

    /// Take every queued item without waiting.
    pub fn take_all(&self) -> Result<Vec<T>> {
        self.take_up_to(usize::MAX)
    }

    /// Take at most `max` queued items without waiting.
    pub fn take_up_to(&self, max: usize) -> Result<Vec<T>> {
        let mut state = lock(&self.inner.state);
        if state.shutdown {
            return Err(Error::Shutdown);
        }
        let n = max.min(state.items.len());
        let items: Vec<T> = state.items.drain(..n).collect();
        if !items.is_empty() {
            state.taken += items.len() as u64;
            self.inner.not_full.notify_waiters();
        }
        Ok(items)
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        lock(&self.inner.state).items.len()
    }

    /// Returns true if no item is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The capacity, or `None` for an unbounded queue.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// The overflow strategy.
    pub fn strategy(&self) -> OverflowStrategy {
        self.inner.strategy
    }

    /// Shut the queue down, discarding queued items and waking every
    /// blocked offer and take.
    pub fn shutdown(&self) {
        let discarded = {
            let mut state = lock(&self.inner.state);
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            std::mem::take(&mut state.items)
        };
        // Items are dropped outside the lock: their destructors may touch
        // other queues.
        drop(discarded);
        self.inner.not_empty.notify_waiters();
        self.inner.not_full.notify_waiters();
        self.inner.closed.open();
    }

    /// Returns true once the queue has been shut down.
    pub fn is_shutdown(&self) -> bool {
        lock(&self.inner.state).shutdown
    }

    /// Wait until the queue is shut down.
    pub async fn await_shutdown(&self) {
        self.inner.closed.wait().await;
    }

    /// Current statistics.
    pub fn stats(&self) -> QueueStats {
        let state = lock(&self.inner.state);
        QueueStats {
            len: state.items.len(),
            offered: state.offered,
            taken: state.taken,
            dropped: state.dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo() {
        let queue = Queue::bounded(4);
        for i in 0..3 {
            assert!(queue.offer(i).await.unwrap());
        }
        assert_eq!(queue.take().await.unwrap(), 0);
        assert_eq!(queue.take_all().unwrap(), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_suspends_when_full() {
        let queue = Queue::bounded(1);
        queue.offer(1).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.offer(2).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.take().await.unwrap(), 1);
        assert!(producer.await.unwrap().unwrap());
        assert_eq!(queue.take().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dropping_rejects_new_items() {
        let queue = Queue::dropping(2);
        assert!(queue.offer(1).await.unwrap());
        assert!(queue.offer(2).await.unwrap());
        assert!(!queue.offer(3).await.unwrap());
        assert_eq!(queue.take_all().unwrap(), vec![1, 2]);
        assert_eq!(queue.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_sliding_evicts_oldest() {
        let queue = Queue::sliding(2);
        assert_eq!(queue.offer_all([1, 2, 3, 4]).await.unwrap(), 4);
        assert_eq!(queue.take_all().unwrap(), vec![3, 4]);
        let stats = queue.stats();
        assert_eq!(stats.offered, 4);
        assert_eq!(stats.taken, 2);
        assert_eq!(stats.dropped, 2);
    }

    #[tokio::test]
    async fn test_take_up_to() {
        let queue = Queue::unbounded();
        queue.offer_all(0..10).await.unwrap();
        assert_eq!(queue.take_up_to(3).unwrap(), vec![0, 1, 2]);
        assert_eq!(queue.len(), 7);
        assert_eq!(queue.capacity(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_wakes_takers() {
        let queue: Queue<u32> = Queue::bounded(2);
        let taker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shutdown();
        assert_eq!(taker.await.unwrap(), Err(Error::Shutdown));
        assert_eq!(queue.offer(1).await, Err(Error::Shutdown));
        assert!(queue.is_shutdown());
        queue.await_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_wait_ignores_strategy() {
        let queue = Queue::dropping(1);
        queue.offer(1).await.unwrap();
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.offer_wait(2).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.take().await.unwrap(), 1);
        producer.await.unwrap().unwrap();
        assert_eq!(queue.take().await.unwrap(), 2);
    }
}
