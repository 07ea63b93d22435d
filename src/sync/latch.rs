//! One-shot broadcast signal.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Default)]
struct LatchInner {
    open: AtomicBool,
    notify: Notify,
}

/// A gate that starts closed and, once opened, stays open.
#[derive(Clone, Default)]
pub(crate) struct Latch {
    inner: Arc<LatchInner>,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Open the latch and wake every waiter.
    pub(crate) fn open(&self) {
        self.inner.open.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub(crate) fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Wait until the latch is open.
    pub(crate) async fn wait(&self) {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            // Register before checking so an `open` in between is not lost.
            notified.as_mut().enable();
            if self.is_open() {
                return;
            }
            notified.await;
        }
    }
}
