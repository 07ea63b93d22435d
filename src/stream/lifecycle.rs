//! Error handling, finalization and timeouts.

use std::future::Future;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use super::{Stream, Upstream};
use crate::Value;
use crate::cause::{Cause, Defect, Exit};
use crate::channel::{Channel, Process, Signal, Step};
use crate::chunk::Chunk;
use crate::runtime::fork_named;

/// Retype a cause that carries no typed failure.
fn without_failures<E, E2>(cause: Cause<E>) -> Cause<E2> {
    cause.strip_failures().unwrap_or_else(Cause::interrupt)
}

impl<A: Value, E: Value> Stream<A, E> {
    /// Transform the typed failure.
    pub fn map_error<E2, F>(self, f: F) -> Stream<A, E2>
    where
        E2: Value,
        F: FnMut(E) -> E2 + Send + 'static,
    {
        Stream::from_channel(self.channel.map_error(f))
    }

    /// On failure, continue with the stream `f` derives from the cause.
    /// Pure interruption is never intercepted.
    pub fn catch_all_cause<E2, F>(self, f: F) -> Stream<A, E2>
    where
        E2: Value,
        F: FnOnce(Cause<E>) -> Stream<A, E2> + Send + 'static,
    {
        Stream::from_channel(self.channel.catch_cause(move |cause| {
            if cause.is_interrupted_only() {
                Channel::fail_cause(without_failures(cause))
            } else {
                debug!("stream failed, running recovery");
                f(cause).channel
            }
        }))
    }

    /// On a typed failure, continue with the stream `f` derives from it.
    /// Defects and interruptions pass through.
    pub fn catch_all<E2, F>(self, f: F) -> Stream<A, E2>
    where
        E2: Value,
        F: FnOnce(E) -> Stream<A, E2> + Send + 'static,
    {
        self.catch_all_cause(move |cause| match cause.failure_or_cause() {
            Ok(error) => f(error),
            Err(cause) => Stream::fail_cause(without_failures(cause)),
        })
    }

    /// Recover from the causes `f` accepts; others propagate unchanged.
    pub fn catch_some_cause<F>(self, f: F) -> Self
    where
        F: FnOnce(&Cause<E>) -> Option<Stream<A, E>> + Send + 'static,
    {
        Self::from_channel(self.channel.catch_cause(move |cause| {
            if cause.is_interrupted_only() {
                return Channel::fail_cause(cause);
            }
            match f(&cause) {
                Some(recovery) => recovery.channel,
                None => Channel::fail_cause(cause),
            }
        }))
    }

    /// On a typed failure, continue with `that`.
    pub fn or_else<E2: Value>(self, that: Stream<A, E2>) -> Stream<A, E2> {
        self.catch_all(move |_| that)
    }

    /// Run `finalizer` once when the stream exits, however it exits.
    pub fn ensuring<F>(self, finalizer: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::from_channel(self.channel.ensuring(finalizer))
    }

    /// Like [`Stream::ensuring`], with a finalizer that sees the exit.
    pub fn ensuring_with<F, Fut>(self, finalizer: F) -> Self
    where
        F: FnOnce(&Exit<(), E>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::from_channel(self.channel.ensuring_with(finalizer))
    }

    /// End the stream when a pull takes longer than `duration`.
    pub fn timeout(self, duration: Duration) -> Self {
        self.on_pull_timeout(duration, || Ok(()))
    }

    /// Fail with `error()` when a pull takes longer than `duration`.
    pub fn timeout_fail<F>(self, error: F, duration: Duration) -> Self
    where
        F: FnOnce() -> E + Send + 'static,
    {
        self.on_pull_timeout(duration, move || Err(Cause::fail(error())))
    }

    /// Fail with `cause()` when a pull takes longer than `duration`.
    pub fn timeout_fail_cause<F>(self, cause: F, duration: Duration) -> Self
    where
        F: FnOnce() -> Cause<E> + Send + 'static,
    {
        self.on_pull_timeout(duration, move || Err(cause()))
    }

    /// Switch to `that` when a pull takes longer than `duration`.
    pub fn timeout_to(self, duration: Duration, that: Stream<A, E>) -> Self {
        self.timeout_fail_cause(|| Cause::die(Defect::StreamTimeout), duration)
            .catch_some_cause(move |cause| cause.is_stream_timeout().then_some(that))
    }

    fn on_pull_timeout<F>(self, duration: Duration, on_timeout: F) -> Self
    where
        F: FnOnce() -> Exit<(), E> + Send + 'static,
    {
        self.transform(move |upstream, _| Timeout {
            upstream: Some(upstream),
            duration,
            on_timeout: Some(on_timeout),
        })
    }

    /// Interrupt the stream when `signal` completes: it ends on `Ok` and
    /// fails on `Err`. The signal runs on its own fiber from the moment the
    /// stream starts.
    pub fn interrupt_when<F>(self, signal: F) -> Self
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.transform(move |upstream, _| {
            let fiber = fork_named("interrupt_when", signal.map(|result| result.map_err(Cause::fail)));
            InterruptWhen {
                upstream: Some(upstream),
                signal: fiber.join_exit().boxed(),
            }
        })
    }
}

// ============================================================================
// Processes
// ============================================================================

struct Timeout<A, E, F> {
    upstream: Option<Upstream<A, E>>,
    duration: Duration,
    on_timeout: Option<F>,
}

impl<A, E, F> Process<Chunk<A>, E, ()> for Timeout<A, E, F>
where
    A: Value,
    E: Value,
    F: FnOnce() -> Exit<(), E> + Send,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<A>, E, ()>> {
        Box::pin(async move {
            let Some(upstream) = self.upstream.as_mut() else {
                return Signal::Halt(Cause::die(Defect::message("timeout pulled after it ended")));
            };
            let pulled = tokio::time::timeout(self.duration, upstream.next()).await;
            match pulled {
                Ok(Step::Emit(chunk)) => Signal::Emit(chunk),
                Ok(Step::Done(())) => Signal::Done(()),
                Ok(Step::Halt(cause)) => Signal::Halt(cause),
                Err(_) => {
                    self.upstream = None;
                    debug!("stream pull timed out after {:?}", self.duration);
                    match self.on_timeout.take().map(|on_timeout| on_timeout()) {
                        Some(Err(cause)) => Signal::Halt(cause),
                        _ => Signal::Done(()),
                    }
                }
            }
        })
    }
}

struct InterruptWhen<A, E> {
    upstream: Option<Upstream<A, E>>,
    signal: BoxFuture<'static, Exit<(), E>>,
}

impl<A: Value, E: Value> Process<Chunk<A>, E, ()> for InterruptWhen<A, E> {
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<A>, E, ()>> {
        Box::pin(async move {
            let Some(upstream) = self.upstream.as_mut() else {
                return Signal::Halt(Cause::die(Defect::message(
                    "interrupt_when pulled after it ended",
                )));
            };
            let signalled = tokio::select! {
                biased;
                exit = &mut self.signal => Err(exit),
                step = upstream.next() => Ok(step),
            };
            match signalled {
                Ok(Step::Emit(chunk)) => Signal::Emit(chunk),
                Ok(Step::Done(())) => Signal::Done(()),
                Ok(Step::Halt(cause)) => Signal::Halt(cause),
                Err(exit) => {
                    self.upstream = None;
                    match exit {
                        Ok(()) => Signal::Done(()),
                        Err(cause) => Signal::Halt(cause),
                    }
                }
            }
        })
    }
}
