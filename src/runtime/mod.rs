//! Runtime capability layer.
//!
//! The engine needs a handful of things from the async runtime: forking,
//! joining, interrupting and racing fibers, sleeping, reading the clock, and
//! a [`Scope`] that owns finalizers. This module provides them on top of
//! Tokio. Time goes through `tokio::time`, so tests can pause and advance it.

mod fiber;
mod scope;

use std::time::Duration;

pub use fiber::{Fiber, Raced, fork, race};
pub use scope::Scope;

pub(crate) use fiber::fork_named;

/// Suspend the current fiber for `duration`.
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// The current instant on the runtime clock.
pub fn now() -> tokio::time::Instant {
    tokio::time::Instant::now()
}
