//! Publish/subscribe hub: one queue per subscriber.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use super::lock;
use super::queue::{OverflowStrategy, Queue};
use crate::error::{Error, Result};

struct PubSubInner<T> {
    subscribers: Mutex<Vec<(u64, Queue<T>)>>,
    next_id: AtomicU64,
    capacity: Option<usize>,
    strategy: OverflowStrategy,
    shutdown: AtomicBool,
}

impl<T> PubSubInner<T> {
    fn unsubscribe(&self, id: u64) {
        lock(&self.subscribers).retain(|(sub, _)| *sub != id);
    }
}

/// A hub that delivers every published item to every subscriber.
///
/// Each subscriber owns a queue with the hub's capacity and strategy, so
/// lossy strategies lose items per subscriber. With
/// [`OverflowStrategy::Suspend`] the slowest subscriber paces the publisher.
pub struct PubSub<T> {
    inner: Arc<PubSubInner<T>>,
}

impl<T> Clone for PubSub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> PubSub<T> {
    /// Subscriber queues wait for space.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_strategy(Some(capacity), OverflowStrategy::Suspend)
    }

    /// Subscriber queues reject items when full.
    pub fn dropping(capacity: usize) -> Self {
        Self::with_strategy(Some(capacity), OverflowStrategy::Dropping)
    }

    /// Subscriber queues evict their oldest item when full.
    pub fn sliding(capacity: usize) -> Self {
        Self::with_strategy(Some(capacity), OverflowStrategy::Sliding)
    }

    /// Subscriber queues without a limit.
    pub fn unbounded() -> Self {
        Self::with_strategy(None, OverflowStrategy::Suspend)
    }

    /// A hub with an explicit per-subscriber capacity and strategy.
    pub fn with_strategy(capacity: Option<usize>, strategy: OverflowStrategy) -> Self {
        Self {
            inner: Arc::new(PubSubInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                capacity,
                strategy,
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Register a new subscriber. Items published before this call are not
    /// delivered to it.
    pub fn subscribe(&self) -> Result<Subscription<T>> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Queue::with_strategy(self.inner.capacity, self.inner.strategy);
        lock(&self.inner.subscribers).push((id, queue.clone()));
        trace!("subscriber {} registered", id);
        Ok(Subscription {
            id,
            queue,
            hub: Arc::downgrade(&self.inner),
        })
    }

    /// Deliver `item` to every current subscriber.
    ///
    /// Returns `Ok(false)` when at least one dropping subscriber rejected it.
    /// Subscribers whose queue was shut down are pruned.
    pub async fn publish(&self, item: T) -> Result<bool> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        let subscribers = lock(&self.inner.subscribers).clone();
        let mut delivered = true;
        for (id, queue) in subscribers {
            match queue.offer(item.clone()).await {
                Ok(accepted) => delivered &= accepted,
                Err(_) => self.inner.unsubscribe(id),
            }
        }
        Ok(delivered)
    }

    /// Publish every item in order; returns how many reached all subscribers.
    pub async fn publish_all<I>(&self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = T>,
    {
        let mut delivered = 0;
        for item in items {
            if self.publish(item).await? {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    /// Shut down the hub and every subscriber queue.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscribers = std::mem::take(&mut *lock(&self.inner.subscribers));
        for (_, queue) in subscribers {
            queue.shutdown();
        }
    }

    /// Returns true once the hub has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }
}

/// A subscriber's view of a [`PubSub`]. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: u64,
    queue: Queue<T>,
    hub: Weak<PubSubInner<T>>,
}

impl<T> Subscription<T> {
    /// The subscriber id, unique within its hub.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next item. Fails with [`Error::Shutdown`] once the hub
    /// shuts down.
    pub async fn take(&self) -> Result<T> {
        self.queue.take().await
    }

    /// Take an item if one is queued.
    pub fn poll(&self) -> Result<Option<T>> {
        self.queue.poll()
    }

    /// Take every queued item without waiting.
    pub fn take_all(&self) -> Result<Vec<T>> {
        self.queue.take_all()
    }

    /// Take at most `max` queued items without waiting.
    pub fn take_up_to(&self, max: usize) -> Result<Vec<T>> {
        self.queue.take_up_to(max)
    }

    /// Number of items waiting for this subscriber.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if nothing is waiting for this subscriber.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
        self.queue.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_every_item() {
        let hub = PubSub::bounded(8);
        let a = hub.subscribe().unwrap();
        let b = hub.subscribe().unwrap();
        assert_ne!(a.id(), b.id());

        assert_eq!(hub.publish_all([1, 2, 3]).await.unwrap(), 3);
        assert_eq!(a.take_all().unwrap(), vec![1, 2, 3]);
        assert_eq!(b.take().await.unwrap(), 1);
        assert_eq!(b.len(), 2);
    }

    #[tokio::test]
    async fn test_dropping_is_per_subscriber() {
        let hub = PubSub::dropping(1);
        let slow = hub.subscribe().unwrap();
        let fast = hub.subscribe().unwrap();

        assert!(hub.publish(1).await.unwrap());
        assert_eq!(fast.take().await.unwrap(), 1);
        assert!(!hub.publish(2).await.unwrap());

        assert_eq!(slow.take_all().unwrap(), vec![1]);
        assert_eq!(fast.take_all().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let hub: PubSub<u8> = PubSub::unbounded();
        let sub = hub.subscribe().unwrap();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
        assert!(hub.publish(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown() {
        let hub: PubSub<u8> = PubSub::sliding(2);
        let sub = hub.subscribe().unwrap();
        hub.shutdown();
        assert_eq!(sub.take().await, Err(Error::Shutdown));
        assert_eq!(hub.publish(1).await, Err(Error::Shutdown));
        assert!(hub.subscribe().is_err());
    }

    #[tokio::test]
    async fn test_ids_are_per_hub() {
        let first: PubSub<u8> = PubSub::unbounded();
        let second: PubSub<u8> = PubSub::unbounded();
        assert_eq!(first.subscribe().unwrap().id(), 0);
        assert_eq!(second.subscribe().unwrap().id(), 0);
    }
}
