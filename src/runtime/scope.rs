//! Finalizer ownership for one stream run.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::fiber::Fiber;
use crate::cause::Defect;
use crate::observability::record_finalizer_deferred;
use crate::sync::lock;

#[derive(Default)]
struct ScopeState {
    /// Finalizers of processes that were dropped before they finished, in
    /// the order they were released.
    deferred: Vec<BoxFuture<'static, ()>>,
    /// Finalizers registered with `add_finalizer`, run last-in first-out.
    finalizers: Vec<BoxFuture<'static, ()>>,
    /// Fibers whose lifetime is tied to the scope.
    fibers: Vec<AbortHandle>,
    closed: bool,
}

struct ScopeInner {
    state: Mutex<ScopeState>,
}

/// Owner of the finalizers and scoped fibers of one stream run.
///
/// Processes that finish run their own finalizers inline. A process dropped
/// before it finishes hands its finalizer to the scope with [`Scope::defer`];
/// the driver running the stream executes those with [`Scope::run_deferred`]
/// before it produces the next element. [`Scope::close`] runs everything that
/// is left. Finalizers still pending when the last handle is dropped run on a
/// detached task.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// Create an open scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                state: Mutex::new(ScopeState::default()),
            }),
        }
    }

    /// Register a finalizer that runs when the scope closes.
    ///
    /// Finalizers run in reverse registration order. Registering on a closed
    /// scope queues the finalizer for the next drain.
    pub fn add_finalizer<F>(&self, finalizer: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = lock(&self.inner.state);
        if state.closed {
            state.deferred.push(finalizer.boxed());
        } else {
            state.finalizers.push(finalizer.boxed());
        }
    }

    /// Queue the finalizer of an abandoned process.
    pub fn defer<F>(&self, finalizer: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        record_finalizer_deferred();
        lock(&self.inner.state).deferred.push(finalizer.boxed());
    }

    /// Fork a fiber whose lifetime is the scope's rather than the handle's.
    pub fn fork<T, F>(&self, future: F) -> Fiber<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let fiber = Fiber::fork(future);
        let mut state = lock(&self.inner.state);
        state.fibers.retain(|handle| !handle.is_finished());
        if state.closed {
            return fiber;
        }
        let (handle, abort) = fiber.into_abort_handle();
        if let Some(abort) = abort {
            state.fibers.push(abort);
        }
        Fiber::from_parts(handle, None)
    }

    /// Returns true if [`Scope::close`] has been called.
    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// Run the finalizers of abandoned processes queued so far.
    ///
    /// Returns the defect of the first finalizer that panicked.
    pub async fn run_deferred(&self) -> Option<Defect> {
        let deferred = std::mem::take(&mut lock(&self.inner.state).deferred);
        run_all(deferred).await
    }

    /// Close the scope: run deferred finalizers, interrupt scoped fibers and
    /// run registered finalizers in reverse order.
    pub async fn close(&self) -> Option<Defect> {
        let mut first = self.run_deferred().await;
        let (fibers, mut finalizers) = {
            let mut state = lock(&self.inner.state);
            state.closed = true;
            (
                std::mem::take(&mut state.fibers),
                std::mem::take(&mut state.finalizers),
            )
        };
        for fiber in fibers {
            fiber.abort();
        }
        finalizers.reverse();
        if let Some(defect) = run_all(finalizers).await {
            first.get_or_insert(defect);
        }
        // Finalizers may have released processes of their own.
        if let Some(defect) = self.run_deferred().await {
            first.get_or_insert(defect);
        }
        debug!("scope closed");
        first
    }
}

async fn run_all(finalizers: Vec<BoxFuture<'static, ()>>) -> Option<Defect> {
    let mut first = None;
    for finalizer in finalizers {
        if let Err(panic) = AssertUnwindSafe(finalizer).catch_unwind().await {
            let defect = Defect::from_panic(panic);
            warn!("finalizer panicked: {}", defect);
            first.get_or_insert(defect);
        }
    }
    first
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let state = std::mem::take(
            self.state
                .get_mut()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for fiber in &state.fibers {
            fiber.abort();
        }
        let mut pending = state.deferred;
        pending.extend(state.finalizers.into_iter().rev());
        if pending.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("running {} orphaned finalizers on a detached task", pending.len());
                handle.spawn(async move {
                    run_all(pending).await;
                });
            }
            Err(_) => warn!(
                "dropping {} finalizers: scope released outside a Tokio runtime",
                pending.len()
            ),
        }
    }
}
