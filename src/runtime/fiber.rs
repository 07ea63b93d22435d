//! Fibers: Tokio tasks with interrupt-on-drop ownership.

use std::future::Future;

use futures::future::{self, Either};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::Instrument;

use crate::cause::{Cause, Defect, Exit};
use crate::observability::{record_fiber_forked, span_fiber};

/// Aborts a task when dropped unless disarmed.
struct AbortGuard {
    handle: Option<AbortHandle>,
}

impl AbortGuard {
    fn disarm(&mut self) -> Option<AbortHandle> {
        self.handle.take()
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Handle to a forked computation.
///
/// Dropping the handle interrupts the fiber. Use [`Fiber::detach`] to let it
/// run on its own, or `Scope::fork` to tie it to a scope instead.
pub struct Fiber<T> {
    handle: JoinHandle<T>,
    guard: AbortGuard,
}

/// Fork `future` onto the current Tokio runtime.
pub fn fork<T, F>(future: F) -> Fiber<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    Fiber::fork(future)
}

/// Fork `future` with a span naming the operator that owns it.
pub(crate) fn fork_named<T, F>(operator: &'static str, future: F) -> Fiber<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    Fiber::fork(future.instrument(span_fiber(operator)))
}

impl<T: Send + 'static> Fiber<T> {
    /// Fork `future` onto the current Tokio runtime.
    pub fn fork<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        record_fiber_forked();
        let handle = tokio::spawn(future);
        let guard = AbortGuard {
            handle: Some(handle.abort_handle()),
        };
        Self { handle, guard }
    }

    /// Wait for the fiber and return its exit.
    ///
    /// A panic becomes a [`Defect::Panic`] and an abort becomes an
    /// interruption. The error type is free since a fiber has no typed
    /// failure of its own.
    pub async fn join<E>(self) -> Exit<T, E> {
        let Fiber { handle, guard } = self;
        let result = handle.await;
        drop(guard);
        exit_of(result)
    }

    /// Interrupt the fiber and wait until it has stopped.
    pub async fn interrupt(self) {
        let Fiber { handle, guard } = self;
        handle.abort();
        let _ = handle.await;
        drop(guard);
    }

    /// Returns true once the fiber has completed.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Let the fiber run to completion on its own.
    pub fn detach(mut self) {
        self.guard.disarm();
    }

    pub(crate) fn from_parts(handle: JoinHandle<T>, abort: Option<AbortHandle>) -> Self {
        Self {
            handle,
            guard: AbortGuard { handle: abort },
        }
    }

    /// Hand the abort handle to another owner. The fiber is no longer
    /// interrupted when this handle drops.
    pub(crate) fn into_abort_handle(mut self) -> (JoinHandle<T>, Option<AbortHandle>) {
        let abort = self.guard.disarm();
        let Fiber { handle, .. } = self;
        (handle, abort)
    }
}

impl<T, E> Fiber<Exit<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Join a fiber that itself returns an exit, flattening both layers.
    pub async fn join_exit(self) -> Exit<T, E> {
        match self.join::<E>().await {
            Ok(exit) => exit,
            Err(cause) => Err(cause),
        }
    }
}

fn exit_of<T, E>(result: Result<T, JoinError>) -> Exit<T, E> {
    match result {
        Ok(value) => Ok(value),
        Err(err) if err.is_panic() => Err(Cause::die(Defect::from_panic(err.into_panic()))),
        Err(_) => Err(Cause::interrupt()),
    }
}

/// Outcome of [`race`]: the winner's exit and the loser, still running.
pub enum Raced<A, B, E> {
    /// The left fiber finished first.
    Left(Exit<A, E>, Fiber<B>),
    /// The right fiber finished first.
    Right(Exit<B, E>, Fiber<A>),
}

/// Wait for the first of two fibers to finish.
///
/// The loser keeps running; drop it to interrupt it.
pub async fn race<A, B, E>(mut left: Fiber<A>, mut right: Fiber<B>) -> Raced<A, B, E>
where
    A: Send + 'static,
    B: Send + 'static,
{
    let winner = match future::select(&mut left.handle, &mut right.handle).await {
        Either::Left((result, _)) => Either::Left(result),
        Either::Right((result, _)) => Either::Right(result),
    };
    match winner {
        Either::Left(result) => Raced::Left(exit_of(result), right),
        Either::Right(result) => Raced::Right(exit_of(result), left),
    }
}
