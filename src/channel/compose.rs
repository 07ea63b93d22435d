//! State machines behind the channel constructors and combinators.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::BoxFuture;

use super::Channel;
use super::process::{Executor, Input, Process, Signal, Step};
use crate::Value;
use crate::cause::{Cause, Defect, Exit};
use crate::runtime::Scope;

fn resumed_twice<O, E, D>(what: &str) -> Signal<O, E, D> {
    Signal::Halt(Cause::die(Defect::message(format!("{what} resumed after it finished"))))
}

// ============================================================================
// Sources
// ============================================================================

pub(super) struct FromFuture<D, E> {
    pub(super) future: Option<BoxFuture<'static, Exit<D, E>>>,
}

impl<O: Value, E: Value, D: Value> Process<O, E, D> for FromFuture<D, E> {
    fn step(&mut self) -> BoxFuture<'_, Signal<O, E, D>> {
        let future = self.future.take();
        Box::pin(async move {
            match future {
                Some(future) => match future.await {
                    Ok(done) => Signal::Done(done),
                    Err(cause) => Signal::Halt(cause),
                },
                None => resumed_twice("from_future"),
            }
        })
    }
}

pub(super) struct WriteAll<It> {
    pub(super) items: It,
}

impl<O, E, It> Process<O, E, ()> for WriteAll<It>
where
    O: Value,
    E: Value,
    It: Iterator<Item = O> + Send,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<O, E, ()>> {
        let signal = match self.items.next() {
            Some(out) => Signal::Emit(out),
            None => Signal::Done(()),
        };
        Box::pin(std::future::ready(signal))
    }
}

pub(super) struct Identity<I, IE, ID> {
    pub(super) input: Input<I, IE, ID>,
}

impl<I: Value, IE: Value, ID: Value> Process<I, IE, ID> for Identity<I, IE, ID> {
    fn step(&mut self) -> BoxFuture<'_, Signal<I, IE, ID>> {
        Box::pin(async move {
            match self.input.read().await {
                Step::Emit(elem) => Signal::Emit(elem),
                Step::Halt(cause) => Signal::Halt(cause),
                Step::Done(done) => Signal::Done(done),
            }
        })
    }
}

pub(super) type OnInput<O, E, D, I, IE, ID> =
    Box<dyn FnOnce(I) -> Channel<O, E, D, I, IE, ID> + Send>;
pub(super) type OnFailure<O, E, D, I, IE, ID> =
    Box<dyn FnOnce(Cause<IE>) -> Channel<O, E, D, I, IE, ID> + Send>;
pub(super) type OnDone<O, E, D, I, IE, ID> =
    Box<dyn FnOnce(ID) -> Channel<O, E, D, I, IE, ID> + Send>;

pub(super) struct ReadWith<O, E, D, I, IE, ID> {
    pub(super) input: Input<I, IE, ID>,
    pub(super) scope: Scope,
    pub(super) handlers: Option<(
        OnInput<O, E, D, I, IE, ID>,
        OnFailure<O, E, D, I, IE, ID>,
        OnDone<O, E, D, I, IE, ID>,
    )>,
}

impl<O, E, D, I, IE, ID> Process<O, E, D> for ReadWith<O, E, D, I, IE, ID>
where
    O: Value,
    E: Value,
    D: Value,
    I: Value,
    IE: Value,
    ID: Value,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<O, E, D>> {
        Box::pin(async move {
            let Some((on_input, on_failure, on_done)) = self.handlers.take() else {
                return resumed_twice("read_with");
            };
            let next = match self.input.read().await {
                Step::Emit(elem) => on_input(elem),
                Step::Halt(cause) => on_failure(cause),
                Step::Done(done) => on_done(done),
            };
            Signal::Become(next.into_process(self.input.clone(), self.scope.clone()))
        })
    }
}

// ============================================================================
// Sequencing
// ============================================================================

pub(super) struct Sequence<O, E, D, D2, I, IE, ID> {
    pub(super) first: Executor<O, E, D>,
    pub(super) next: Option<Box<dyn FnOnce(D) -> Channel<O, E, D2, I, IE, ID> + Send>>,
    pub(super) input: Input<I, IE, ID>,
    pub(super) scope: Scope,
}

impl<O, E, D, D2, I, IE, ID> Process<O, E, D2> for Sequence<O, E, D, D2, I, IE, ID>
where
    O: Value,
    E: Value,
    D: Value,
    D2: Value,
    I: Value,
    IE: Value,
    ID: Value,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<O, E, D2>> {
        Box::pin(async move {
            match self.first.next().await {
                Step::Emit(out) => Signal::Emit(out),
                Step::Halt(cause) => Signal::Halt(cause),
                Step::Done(done) => match self.next.take() {
                    Some(next) => Signal::Become(
                        next(done).into_process(self.input.clone(), self.scope.clone()),
                    ),
                    None => resumed_twice("then"),
                },
            }
        })
    }
}

pub(super) struct MapOut<O, E, D, F> {
    pub(super) inner: Executor<O, E, D>,
    pub(super) f: F,
}

impl<O, O2, E, D, F> Process<O2, E, D> for MapOut<O, E, D, F>
where
    O: Value,
    O2: Value,
    E: Value,
    D: Value,
    F: FnMut(O) -> O2 + Send,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<O2, E, D>> {
        Box::pin(async move {
            match self.inner.next().await {
                Step::Emit(out) => Signal::Emit((self.f)(out)),
                Step::Halt(cause) => Signal::Halt(cause),
                Step::Done(done) => Signal::Done(done),
            }
        })
    }
}

pub(super) struct MapDone<O, E, D, F> {
    pub(super) inner: Executor<O, E, D>,
    pub(super) f: Option<F>,
}

impl<O, E, D, D2, F> Process<O, E, D2> for MapDone<O, E, D, F>
where
    O: Value,
    E: Value,
    D: Value,
    D2: Value,
    F: FnOnce(D) -> D2 + Send,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<O, E, D2>> {
        Box::pin(async move {
            match self.inner.next().await {
                Step::Emit(out) => Signal::Emit(out),
                Step::Halt(cause) => Signal::Halt(cause),
                Step::Done(done) => match self.f.take() {
                    Some(f) => Signal::Done(f(done)),
                    None => resumed_twice("map_done"),
                },
            }
        })
    }
}

pub(super) struct MapError<O, E, D, F> {
    pub(super) inner: Executor<O, E, D>,
    pub(super) f: F,
}

impl<O, E, E2, D, F> Process<O, E2, D> for MapError<O, E, D, F>
where
    O: Value,
    E: Value,
    E2: Value,
    D: Value,
    F: FnMut(E) -> E2 + Send,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<O, E2, D>> {
        Box::pin(async move {
            match self.inner.next().await {
                Step::Emit(out) => Signal::Emit(out),
                Step::Halt(cause) => Signal::Halt(cause.map(&mut self.f)),
                Step::Done(done) => Signal::Done(done),
            }
        })
    }
}

pub(super) struct CatchCause<O, E, E2, D, I, IE, ID> {
    pub(super) inner: Executor<O, E, D>,
    pub(super) handler: Option<Box<dyn FnOnce(Cause<E>) -> Channel<O, E2, D, I, IE, ID> + Send>>,
    pub(super) input: Input<I, IE, ID>,
    pub(super) scope: Scope,
}

impl<O, E, E2, D, I, IE, ID> Process<O, E2, D> for CatchCause<O, E, E2, D, I, IE, ID>
where
    O: Value,
    E: Value,
    E2: Value,
    D: Value,
    I: Value,
    IE: Value,
    ID: Value,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<O, E2, D>> {
        Box::pin(async move {
            match self.inner.next().await {
                Step::Emit(out) => Signal::Emit(out),
                Step::Done(done) => Signal::Done(done),
                Step::Halt(cause) => match self.handler.take() {
                    Some(handler) => Signal::Become(
                        handler(cause).into_process(self.input.clone(), self.scope.clone()),
                    ),
                    None => resumed_twice("catch_cause"),
                },
            }
        })
    }
}

pub(super) struct ConcatMap<O, O2, E, D, F> {
    pub(super) outer: Executor<O, E, D>,
    pub(super) inner: Option<Executor<O2, E, ()>>,
    pub(super) f: F,
    pub(super) scope: Scope,
}

impl<O, O2, E, D, F> Process<O2, E, D> for ConcatMap<O, O2, E, D, F>
where
    O: Value,
    O2: Value,
    E: Value,
    D: Value,
    F: FnMut(O) -> Channel<O2, E, ()> + Send,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<O2, E, D>> {
        Box::pin(async move {
            loop {
                if let Some(inner) = self.inner.as_mut() {
                    match inner.next().await {
                        Step::Emit(out) => return Signal::Emit(out),
                        Step::Halt(cause) => return Signal::Halt(cause),
                        Step::Done(()) => self.inner = None,
                    }
                }
                match self.outer.next().await {
                    Step::Emit(elem) => {
                        let channel = (self.f)(elem);
                        self.inner = Some(channel.start(Input::empty(), self.scope.clone()));
                    }
                    Step::Halt(cause) => return Signal::Halt(cause),
                    Step::Done(done) => return Signal::Done(done),
                }
            }
        })
    }
}

// ============================================================================
// Piping
// ============================================================================

type Stash<E> = std::sync::Arc<std::sync::Mutex<Option<Cause<E>>>>;

/// Sits between an upstream and a channel that cannot see its errors: an
/// upstream failure is stashed and the downstream channel sees an
/// interruption instead.
pub(super) struct StashFailure<O, E, D> {
    pub(super) upstream: Executor<O, E, D>,
    pub(super) stash: Stash<E>,
}

impl<O, E, D> Process<O, std::convert::Infallible, D> for StashFailure<O, E, D>
where
    O: Value,
    E: Value,
    D: Value,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<O, std::convert::Infallible, D>> {
        Box::pin(async move {
            match self.upstream.next().await {
                Step::Emit(out) => Signal::Emit(out),
                Step::Done(done) => Signal::Done(done),
                Step::Halt(cause) => {
                    *crate::sync::lock(&self.stash) = Some(cause);
                    Signal::Halt(Cause::interrupt())
                }
            }
        })
    }
}

/// Surfaces a stashed upstream failure in place of whatever the downstream
/// channel ended with.
pub(super) struct SurfaceFailure<O, E, D> {
    pub(super) inner: Executor<O, E, D>,
    pub(super) stash: Stash<E>,
}

impl<O, E, D> Process<O, E, D> for SurfaceFailure<O, E, D>
where
    O: Value,
    E: Value,
    D: Value,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<O, E, D>> {
        Box::pin(async move {
            let step = self.inner.next().await;
            let stashed = crate::sync::lock(&self.stash).take();
            match (step, stashed) {
                (Step::Emit(out), None) => Signal::Emit(out),
                (Step::Done(done), None) => Signal::Done(done),
                (Step::Halt(cause), None) => Signal::Halt(cause),
                (Step::Emit(out), Some(upstream)) => {
                    // Put it back for the next step; the element was produced
                    // before the downstream noticed.
                    *crate::sync::lock(&self.stash) = Some(upstream);
                    Signal::Emit(out)
                }
                (Step::Halt(cause), Some(upstream)) if !cause.is_interrupted_only() => {
                    Signal::Halt(upstream.then(cause))
                }
                (_, Some(upstream)) => Signal::Halt(upstream),
            }
        })
    }
}

// ============================================================================
// Finalization
// ============================================================================

pub(super) type Finalizer<D, E> = Box<dyn FnOnce(&Exit<D, E>) -> BoxFuture<'static, ()> + Send>;

pub(super) struct Ensuring<O, E, D> {
    pub(super) inner: Option<Executor<O, E, D>>,
    pub(super) finalizer: Option<Finalizer<D, E>>,
    pub(super) scope: Scope,
}

impl<O: Value, E: Value, D: Value> Ensuring<O, E, D> {
    async fn finish(&mut self, mut exit: Exit<D, E>) -> Signal<O, E, D> {
        self.inner = None;
        if let Some(finalizer) = self.finalizer.take() {
            let release = finalizer(&exit);
            if let Err(panic) = AssertUnwindSafe(release).catch_unwind().await {
                let defect = Cause::die(Defect::from_panic(panic));
                exit = match exit {
                    Ok(_) => Err(defect),
                    Err(cause) => Err(cause.then(defect)),
                };
            }
        }
        match exit {
            Ok(done) => Signal::Done(done),
            Err(cause) => Signal::Halt(cause),
        }
    }
}

impl<O: Value, E: Value, D: Value> Process<O, E, D> for Ensuring<O, E, D> {
    fn step(&mut self) -> BoxFuture<'_, Signal<O, E, D>> {
        Box::pin(async move {
            let Some(inner) = self.inner.as_mut() else {
                return resumed_twice("ensuring");
            };
            match inner.next().await {
                Step::Emit(out) => Signal::Emit(out),
                Step::Done(done) => self.finish(Ok(done)).await,
                Step::Halt(cause) => self.finish(Err(cause)).await,
            }
        })
    }
}

impl<O, E, D> Drop for Ensuring<O, E, D> {
    fn drop(&mut self) {
        // Release what the inner channel holds before our own finalizer so
        // release order is the reverse of acquisition.
        drop(self.inner.take());
        if let Some(finalizer) = self.finalizer.take() {
            self.scope.defer(finalizer(&Err(Cause::interrupt())));
        }
    }
}
