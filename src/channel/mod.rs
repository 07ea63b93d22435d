//! Channels: the low-level primitive every stream compiles to.
//!
//! A [`Channel`] reads elements of type `I` (failing with `IE`, finishing with
//! `ID`) from an upstream and writes elements of type `O`, finally failing
//! with a `Cause<E>` or finishing with a done value `D`. Channels are lazy
//! descriptions: nothing happens until [`Channel::start`] turns one into a
//! [`Process`] and an [`Executor`] steps it.
//!
//! Composition never nests executors on the call stack. Sequencing returns a
//! [`Signal::Become`] tail call, and piping hands the upstream executor to the
//! downstream process as its [`Input`].

mod compose;
mod driver;
mod merge;
mod process;

use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::FutureExt;

pub use merge::{MergeMapOptions, MergeStrategy};
pub use process::{BoxProcess, Executor, Input, Process, Signal, Step};

pub(crate) use driver::Driver;
pub(crate) use process::{Failed, Succeed};

use crate::Value;
use crate::cause::{Cause, Defect, Exit};
use crate::runtime::Scope;
use compose::{
    CatchCause, ConcatMap, Ensuring, FromFuture, Identity, MapDone, MapError, MapOut, ReadWith,
    Sequence, StashFailure, SurfaceFailure, WriteAll,
};

type Start<O, E, D, I, IE, ID> = Box<dyn FnOnce(Input<I, IE, ID>, Scope) -> BoxProcess<O, E, D> + Send>;

/// A lazy, composable description of a read/write process.
///
/// Type parameters: output element `O`, output failure `E`, done value `D`,
/// and the input side `I`/`IE`/`ID`, which defaults to "reads nothing".
pub struct Channel<O, E, D, I = (), IE = Infallible, ID = ()> {
    start: Start<O, E, D, I, IE, ID>,
}

impl<O, E, D, I, IE, ID> Channel<O, E, D, I, IE, ID>
where
    O: Value,
    E: Value,
    D: Value,
    I: Value,
    IE: Value,
    ID: Value,
{
    fn from_start<F>(start: F) -> Self
    where
        F: FnOnce(Input<I, IE, ID>, Scope) -> BoxProcess<O, E, D> + Send + 'static,
    {
        Self {
            start: Box::new(start),
        }
    }

    /// A channel backed by a custom state machine.
    ///
    /// `f` runs when the channel starts and receives the channel's input and
    /// the scope of the run.
    pub fn from_process<P, F>(f: F) -> Self
    where
        P: Process<O, E, D> + 'static,
        F: FnOnce(Input<I, IE, ID>, Scope) -> P + Send + 'static,
    {
        Self::from_start(move |input, scope| Box::new(f(input, scope)) as BoxProcess<O, E, D>)
    }

    /// A channel that finishes immediately with `done`.
    pub fn succeed(done: D) -> Self {
        Self::from_start(move |_, _| Box::new(Succeed::new(done)) as BoxProcess<O, E, D>)
    }

    /// A channel that fails immediately with `error`.
    pub fn fail(error: E) -> Self {
        Self::fail_cause(Cause::fail(error))
    }

    /// A channel that fails immediately with `cause`.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_start(move |_, _| Box::new(Failed::new(cause)) as BoxProcess<O, E, D>)
    }

    /// A channel that dies immediately with `defect`.
    pub fn die(defect: Defect) -> Self {
        Self::fail_cause(Cause::die(defect))
    }

    /// A channel that runs `future` when started and finishes with its
    /// result.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Exit<D, E>> + Send + 'static,
    {
        Self::from_start(move |_, _| {
            Box::new(FromFuture {
                future: Some(future.boxed()),
            }) as BoxProcess<O, E, D>
        })
    }

    /// Build the channel lazily, when it starts.
    pub fn suspend<F>(f: F) -> Self
    where
        F: FnOnce() -> Self + Send + 'static,
    {
        Self::from_start(move |input, scope| f().into_process(input, scope))
    }

    /// Read one input signal and continue with the channel chosen by the
    /// matching handler.
    pub fn read_with<FI, FF, FD>(on_input: FI, on_failure: FF, on_done: FD) -> Self
    where
        FI: FnOnce(I) -> Self + Send + 'static,
        FF: FnOnce(Cause<IE>) -> Self + Send + 'static,
        FD: FnOnce(ID) -> Self + Send + 'static,
    {
        Self::from_start(move |input, scope| {
            Box::new(ReadWith {
                input,
                scope,
                handlers: Some((Box::new(on_input), Box::new(on_failure), Box::new(on_done))),
            }) as BoxProcess<O, E, D>
        })
    }

    /// Start the channel, turning it into a boxed process.
    pub fn into_process(self, input: Input<I, IE, ID>, scope: Scope) -> BoxProcess<O, E, D> {
        (self.start)(input, scope)
    }

    /// Start the channel and wrap it in an executor.
    pub fn start(self, input: Input<I, IE, ID>, scope: Scope) -> Executor<O, E, D> {
        Executor::new(self.into_process(input, scope))
    }

    fn wrap<O2, E2, D2, P, F>(self, f: F) -> Channel<O2, E2, D2, I, IE, ID>
    where
        O2: Value,
        E2: Value,
        D2: Value,
        P: Process<O2, E2, D2> + 'static,
        F: FnOnce(Executor<O, E, D>, Input<I, IE, ID>, Scope) -> P + Send + 'static,
    {
        Channel::from_process(move |input: Input<I, IE, ID>, scope: Scope| {
            let inner = self.start(input.clone(), scope.clone());
            f(inner, input, scope)
        })
    }

    /// After this channel finishes, continue with the channel `f` derives
    /// from its done value. Both read from the same input.
    pub fn then<D2, F>(self, f: F) -> Channel<O, E, D2, I, IE, ID>
    where
        D2: Value,
        F: FnOnce(D) -> Channel<O, E, D2, I, IE, ID> + Send + 'static,
    {
        self.wrap(move |first, input, scope| Sequence {
            first,
            next: Some(Box::new(f)),
            input,
            scope,
        })
    }

    /// Transform every output element.
    pub fn map_out<O2, F>(self, f: F) -> Channel<O2, E, D, I, IE, ID>
    where
        O2: Value,
        F: FnMut(O) -> O2 + Send + 'static,
    {
        self.wrap(move |inner, _, _| MapOut { inner, f })
    }

    /// Transform the done value.
    pub fn map_done<D2, F>(self, f: F) -> Channel<O, E, D2, I, IE, ID>
    where
        D2: Value,
        F: FnOnce(D) -> D2 + Send + 'static,
    {
        self.wrap(move |inner, _, _| MapDone { inner, f: Some(f) })
    }

    /// Transform every typed failure.
    pub fn map_error<E2, F>(self, f: F) -> Channel<O, E2, D, I, IE, ID>
    where
        E2: Value,
        F: FnMut(E) -> E2 + Send + 'static,
    {
        self.wrap(move |inner, _, _| MapError { inner, f })
    }

    /// On failure, continue with the channel `f` derives from the cause.
    ///
    /// Every cause is handed over, interruptions included; stream-level
    /// catch combinators filter those out.
    pub fn catch_cause<E2, F>(self, f: F) -> Channel<O, E2, D, I, IE, ID>
    where
        E2: Value,
        F: FnOnce(Cause<E>) -> Channel<O, E2, D, I, IE, ID> + Send + 'static,
    {
        self.wrap(move |inner, input, scope| CatchCause {
            inner,
            handler: Some(Box::new(f)),
            input,
            scope,
        })
    }

    /// Feed this channel's output into `that`.
    pub fn pipe_to<O2, E2, D2>(
        self,
        that: Channel<O2, E2, D2, O, E, D>,
    ) -> Channel<O2, E2, D2, I, IE, ID>
    where
        O2: Value,
        E2: Value,
        D2: Value,
    {
        Channel::from_start(move |input, scope: Scope| {
            let upstream = self.start(input, scope.clone());
            that.into_process(Input::new(upstream), scope)
        })
    }

    /// Feed this channel's output into `that`, which cannot observe failures:
    /// an upstream failure interrupts `that` and surfaces downstream as is.
    pub fn pipe_to_or_fail<O2, D2>(
        self,
        that: Channel<O2, E, D2, O, Infallible, D>,
    ) -> Channel<O2, E, D2, I, IE, ID>
    where
        O2: Value,
        D2: Value,
    {
        Channel::from_start(move |input, scope: Scope| {
            let stash = Arc::new(Mutex::new(None));
            let upstream = Executor::new(Box::new(StashFailure {
                upstream: self.start(input, scope.clone()),
                stash: stash.clone(),
            }));
            let inner = that.start(Input::new(upstream), scope);
            Box::new(SurfaceFailure { inner, stash }) as BoxProcess<O2, E, D2>
        })
    }

    /// For every output element, run the channel `f` derives from it to
    /// completion before reading the next one.
    pub fn concat_map<O2, F>(self, f: F) -> Channel<O2, E, D, I, IE, ID>
    where
        O2: Value,
        F: FnMut(O) -> Channel<O2, E, ()> + Send + 'static,
    {
        self.wrap(move |outer, _, scope| ConcatMap {
            outer,
            inner: None,
            f,
            scope,
        })
    }

    /// For every output element, start the channel `f` derives from it and
    /// run up to `options.concurrency` of them at once, interleaving their
    /// output in arrival order.
    pub fn merge_map<O2, F>(self, f: F, options: MergeMapOptions) -> Channel<O2, E, (), I, IE, ID>
    where
        O2: Value,
        F: FnMut(O) -> Channel<O2, E, ()> + Send + 'static,
    {
        self.wrap(move |outer, _, scope| merge::MergeMap::new(outer, f, options, scope))
    }

    /// Run `finalizer` exactly once when the channel exits, whether it
    /// finishes, fails or is interrupted.
    pub fn ensuring<F>(self, finalizer: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.ensuring_with(move |_| finalizer)
    }

    /// Like [`Channel::ensuring`], with a finalizer that observes the exit.
    pub fn ensuring_with<F, Fut>(self, finalizer: F) -> Self
    where
        F: FnOnce(&Exit<D, E>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.wrap(move |inner, _, scope| Ensuring {
            inner: Some(inner),
            finalizer: Some(Box::new(move |exit: &Exit<D, E>| finalizer(exit).boxed())),
            scope,
        })
    }
}

impl<O, E, I, IE, ID> Channel<O, E, (), I, IE, ID>
where
    O: Value,
    E: Value,
    I: Value,
    IE: Value,
    ID: Value,
{
    /// A channel that writes one element and finishes.
    pub fn write(out: O) -> Self {
        Self::write_all(std::iter::once(out))
    }

    /// A channel that writes every element of `items` and finishes.
    pub fn write_all<It>(items: It) -> Self
    where
        It: IntoIterator<Item = O>,
        It::IntoIter: Send + 'static,
    {
        let items = items.into_iter();
        Self::from_start(move |_, _| Box::new(WriteAll { items }) as BoxProcess<O, E, ()>)
    }
}

impl<I: Value, IE: Value, ID: Value> Channel<I, IE, ID, I, IE, ID> {
    /// A channel that passes its input through unchanged.
    pub fn identity() -> Self {
        Self::from_process(|input, _| Identity { input })
    }
}

impl<O: Value, E: Value, D: Value> Channel<O, E, D> {
    /// Run the channel, discarding its output.
    pub async fn run_drain(self) -> Exit<D, E> {
        let mut driver = Driver::new(self);
        let exit = loop {
            match driver.next().await {
                Step::Emit(_) => {}
                Step::Halt(cause) => break Err(cause),
                Step::Done(done) => break Ok(done),
            }
        };
        driver.finish(exit).await
    }

    /// Run the channel, collecting its output and done value.
    pub async fn run_collect(self) -> Exit<(Vec<O>, D), E> {
        let mut driver = Driver::new(self);
        let mut out = Vec::new();
        let exit = loop {
            match driver.next().await {
                Step::Emit(elem) => out.push(elem),
                Step::Halt(cause) => break Err(cause),
                Step::Done(done) => break Ok(done),
            }
        };
        driver.finish(exit.map(|done| (out, done))).await
    }
}
