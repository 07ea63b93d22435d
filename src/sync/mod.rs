//! Coordination primitives shared between fibers.
//!
//! - [`Handoff`]: single-slot rendezvous between one producer and one consumer
//! - [`Queue`]: bounded or unbounded buffer with an overflow strategy
//! - [`PubSub`]: a queue per subscriber, fed by one publisher

mod handoff;
mod latch;
mod pubsub;
mod queue;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use handoff::Handoff;
pub use pubsub::{PubSub, Subscription};
pub use queue::{OverflowStrategy, Queue, QueueStats};

pub(crate) use latch::Latch;

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
