//! Started channels: explicit state machines and the loop that drives them.

use std::convert::Infallible;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::Value;
use crate::cause::{Cause, Defect};

/// What one step of a [`Process`] produced.
pub enum Signal<O, E, D> {
    /// An output element.
    Emit(O),
    /// The process failed.
    Halt(Cause<E>),
    /// The process finished with a done value.
    Done(D),
    /// Replace this process with another one (a tail call).
    Become(BoxProcess<O, E, D>),
}

/// What one step of an [`Executor`] produced. `Become` never escapes the
/// executor.
#[derive(Debug, PartialEq, Eq)]
pub enum Step<O, E, D> {
    /// An output element.
    Emit(O),
    /// The channel failed.
    Halt(Cause<E>),
    /// The channel finished with a done value.
    Done(D),
}

/// A started channel.
///
/// `step` must not be called again after it returned `Halt` or `Done`; the
/// executor enforces this. A process dropped mid-step or before it finished
/// is interrupted: it must release what it holds (dropping forked fibers,
/// deferring finalizers to its scope).
pub trait Process<O, E, D>: Send {
    /// Advance the state machine by one signal.
    fn step(&mut self) -> BoxFuture<'_, Signal<O, E, D>>;
}

/// A boxed process.
pub type BoxProcess<O, E, D> = Box<dyn Process<O, E, D>>;

/// Steps a process, following `Become` tail calls in a loop so recursive
/// channel definitions run in constant stack space.
pub struct Executor<O, E, D> {
    current: Option<BoxProcess<O, E, D>>,
}

impl<O: Value, E: Value, D: Value> Executor<O, E, D> {
    /// Wrap a started process.
    pub fn new(process: BoxProcess<O, E, D>) -> Self {
        Self {
            current: Some(process),
        }
    }

    /// Returns true once the process has halted or finished.
    pub fn is_done(&self) -> bool {
        self.current.is_none()
    }

    /// Pull the next signal. After termination every call reports a defect.
    pub async fn next(&mut self) -> Step<O, E, D> {
        loop {
            let Some(process) = self.current.as_mut() else {
                return Step::Halt(Cause::die(Defect::message(
                    "channel pulled after it terminated",
                )));
            };
            match process.step().await {
                Signal::Emit(out) => return Step::Emit(out),
                Signal::Become(next) => self.current = Some(next),
                Signal::Halt(cause) => {
                    self.current = None;
                    return Step::Halt(cause);
                }
                Signal::Done(done) => {
                    self.current = None;
                    return Step::Done(done);
                }
            }
        }
    }
}

/// The upstream a channel reads from.
///
/// The executor is shared so that sequenced channels (`then`, `read_with`
/// continuations) keep reading from the same upstream.
pub struct Input<I, IE, ID> {
    upstream: Arc<tokio::sync::Mutex<Executor<I, IE, ID>>>,
}

impl<I, IE, ID> Clone for Input<I, IE, ID> {
    fn clone(&self) -> Self {
        Self {
            upstream: self.upstream.clone(),
        }
    }
}

impl<I: Value, IE: Value, ID: Value> Input<I, IE, ID> {
    /// Read from `upstream`.
    pub fn new(upstream: Executor<I, IE, ID>) -> Self {
        Self {
            upstream: Arc::new(tokio::sync::Mutex::new(upstream)),
        }
    }

    /// Pull the next upstream signal.
    pub async fn read(&self) -> Step<I, IE, ID> {
        self.upstream.lock().await.next().await
    }
}

impl Input<(), Infallible, ()> {
    /// An input that is already done: channels that never read use this.
    pub fn empty() -> Self {
        Self::new(Executor::new(Box::new(Succeed::new(()))))
    }
}

/// Finishes with a value on its first step.
pub(crate) struct Succeed<D> {
    done: Option<D>,
}

impl<D> Succeed<D> {
    pub(crate) fn new(done: D) -> Self {
        Self { done: Some(done) }
    }
}

impl<O: Value, E: Value, D: Value> Process<O, E, D> for Succeed<D> {
    fn step(&mut self) -> BoxFuture<'_, Signal<O, E, D>> {
        let signal = match self.done.take() {
            Some(done) => Signal::Done(done),
            None => Signal::Halt(Cause::die(Defect::message("succeed stepped twice"))),
        };
        Box::pin(std::future::ready(signal))
    }
}

/// Halts with a cause on its first step.
pub(crate) struct Failed<E> {
    cause: Option<Cause<E>>,
}

impl<E> Failed<E> {
    pub(crate) fn new(cause: Cause<E>) -> Self {
        Self { cause: Some(cause) }
    }
}

impl<O: Value, E: Value, D: Value> Process<O, E, D> for Failed<E> {
    fn step(&mut self) -> BoxFuture<'_, Signal<O, E, D>> {
        let cause = self
            .cause
            .take()
            .unwrap_or_else(|| Cause::die(Defect::message("failure stepped twice")));
        Box::pin(std::future::ready(Signal::Halt(cause)))
    }
}
