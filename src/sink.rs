//! Sinks: consumers that fold chunks into a terminal value.
//!
//! A [`Sink`] is a restartable description. Each run creates a fresh
//! [`SinkState`], feeds it chunks until it reports [`Feed::Done`] (handing
//! back whatever it did not consume) or the input ends, then asks it for its
//! result.

use std::future::Future;
use std::marker::PhantomData;
use std::ops::Add;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::Value;
use crate::cause::{Cause, Defect, Exit};
use crate::chunk::Chunk;

/// What a sink reports after consuming a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed<A> {
    /// The sink wants more input.
    More,
    /// The sink is done; the chunk holds the elements it did not consume.
    Done(Chunk<A>),
}

/// The running state of one sink instance.
pub trait SinkState<A, E, Z>: Send {
    /// Consume a chunk.
    fn feed(&mut self, chunk: Chunk<A>) -> BoxFuture<'_, Result<Feed<A>, Cause<E>>>;

    /// Produce the terminal value. Called once, after the last `feed`.
    fn finish(self: Box<Self>) -> BoxFuture<'static, Exit<Z, E>>;
}

type MakeState<A, E, Z> = dyn Fn() -> Box<dyn SinkState<A, E, Z>> + Send + Sync;

/// A restartable consumer of chunks of `A` producing a `Z`, failing with
/// `E`.
pub struct Sink<A, E, Z> {
    make: Arc<MakeState<A, E, Z>>,
}

impl<A, E, Z> Clone for Sink<A, E, Z> {
    fn clone(&self) -> Self {
        Self {
            make: self.make.clone(),
        }
    }
}

impl<A: Value, E: Value, Z: Value> Sink<A, E, Z> {
    /// A sink backed by custom state, created fresh for every run.
    pub fn from_state<S, F>(make: F) -> Self
    where
        S: SinkState<A, E, Z> + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self {
            make: Arc::new(move || Box::new(make()) as Box<dyn SinkState<A, E, Z>>),
        }
    }

    /// Create the state for one run.
    pub fn start(&self) -> Box<dyn SinkState<A, E, Z>> {
        (self.make)()
    }

    /// Transform the terminal value.
    pub fn map<Z2, F>(self, f: F) -> Sink<A, E, Z2>
    where
        Z2: Value,
        F: Fn(Z) -> Z2 + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let make = self.make;
        Sink::from_state(move || MapState {
            inner: make(),
            f: f.clone(),
        })
    }

    /// Fold elements into a state created by `init` while `cont` holds.
    fn fold_with<S, I, C, F>(init: I, cont: C, f: F) -> Sink<A, E, S>
    where
        S: Value,
        I: Fn() -> S + Send + Sync + 'static,
        C: Fn(&S) -> bool + Send + Sync + 'static,
        F: Fn(S, A) -> S + Send + Sync + 'static,
    {
        let cont = Arc::new(cont);
        let f = Arc::new(f);
        Sink::from_state(move || FoldState {
            state: Some(init()),
            cont: cont.clone(),
            f: f.clone(),
            _marker: PhantomData,
        })
    }
}

impl<A: Value, E: Value> Sink<A, E, Chunk<A>> {
    /// Collect every element.
    pub fn collect_all() -> Self {
        Self::fold_with(Vec::new, |_| true, push).map(Chunk::from_vec)
    }

    /// Collect the first `n` elements, leaving the rest.
    pub fn collect_all_n(n: usize) -> Self {
        Self::fold_with(move || Vec::with_capacity(n), move |acc| acc.len() < n, push)
            .map(Chunk::from_vec)
    }

    /// Alias for [`Sink::collect_all_n`].
    pub fn take(n: usize) -> Self {
        Self::collect_all_n(n)
    }
}

fn push<A>(mut acc: Vec<A>, elem: A) -> Vec<A> {
    acc.push(elem);
    acc
}

impl<A: Value, E: Value, S: Value + Clone + Sync> Sink<A, E, S> {
    /// Fold elements into `init` while `cont` holds for the state. The
    /// element that makes `cont` false is the last one consumed.
    pub fn fold<C, F>(init: S, cont: C, f: F) -> Self
    where
        C: Fn(&S) -> bool + Send + Sync + 'static,
        F: Fn(S, A) -> S + Send + Sync + 'static,
    {
        Self::fold_with(move || init.clone(), cont, f)
    }

    /// Fold at most `max` elements.
    pub fn fold_until<F>(init: S, max: usize, f: F) -> Self
    where
        F: Fn(S, A) -> S + Send + Sync + 'static,
    {
        Sink::<A, E, (S, usize)>::fold_with(
            move || (init.clone(), 0),
            move |(_, seen)| *seen < max,
            move |(state, seen), elem| (f(state, elem), seen + 1),
        )
        .map(|(state, _)| state)
    }
}

impl<A: Value, E: Value> Sink<A, E, ()> {
    /// Run `f` on every element.
    pub fn for_each<F>(f: F) -> Self
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        Self::fold_with(|| (), |_| true, move |(), elem| f(elem))
    }

    /// Run the future `f` derives from every element, in order. A failure
    /// ends the sink.
    pub fn for_each_future<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let f = Arc::new(f);
        Self::from_state(move || ForEachFuture {
            f: f.clone(),
            _marker: PhantomData,
        })
    }

    /// Consume and discard everything.
    pub fn drain() -> Self {
        Self::fold_with(|| (), |_| true, |(), _| ())
    }
}

impl<A: Value, E: Value> Sink<A, E, Option<A>> {
    /// The first element, leaving the rest.
    pub fn head() -> Self {
        Self::fold_with(|| None, Option::is_none, |_, elem| Some(elem))
    }

    /// The last element.
    pub fn last() -> Self {
        Self::fold_with(|| None, |_| true, |_, elem| Some(elem))
    }
}

impl<A: Value, E: Value> Sink<A, E, u64> {
    /// Number of elements.
    pub fn count() -> Self {
        Self::fold_with(|| 0, |_| true, |n, _| n + 1)
    }
}

impl<A, E> Sink<A, E, A>
where
    A: Value + Add<Output = A> + Default,
    E: Value,
{
    /// Sum of the elements.
    pub fn sum() -> Self {
        Self::fold_with(A::default, |_| true, |acc, elem| acc + elem)
    }
}

impl<A: Value, E: Value, Z: Value + Clone + Sync> Sink<A, E, Z> {
    /// A sink that consumes nothing and produces `value`.
    pub fn succeed(value: Z) -> Self {
        Self::fold_with(move || value.clone(), |_| false, |z, _| z)
    }
}

impl<A: Value, E: Value + Clone + Sync, Z: Value> Sink<A, E, Z> {
    /// A sink that fails with `error` as soon as it is fed or finished.
    pub fn fail(error: E) -> Self {
        Self::from_state(move || Failing {
            error: error.clone(),
        })
    }
}

// ============================================================================
// States
// ============================================================================

struct FoldState<A, S, C, F> {
    state: Option<S>,
    cont: Arc<C>,
    f: Arc<F>,
    _marker: PhantomData<fn(A)>,
}

impl<A, E, S, C, F> SinkState<A, E, S> for FoldState<A, S, C, F>
where
    A: Value,
    E: Value,
    S: Value,
    C: Fn(&S) -> bool + Send + Sync + 'static,
    F: Fn(S, A) -> S + Send + Sync + 'static,
{
    fn feed(&mut self, chunk: Chunk<A>) -> BoxFuture<'_, Result<Feed<A>, Cause<E>>> {
        let result = match self.state.take() {
            None => Err(Cause::die(Defect::message("sink fed after it finished"))),
            Some(mut state) => {
                let mut items = chunk.into_vec().into_iter();
                let mut feed = Feed::More;
                while (self.cont)(&state) {
                    match items.next() {
                        Some(elem) => state = (self.f)(state, elem),
                        None => break,
                    }
                }
                if !(self.cont)(&state) {
                    feed = Feed::Done(items.collect());
                }
                self.state = Some(state);
                Ok(feed)
            }
        };
        Box::pin(std::future::ready(result))
    }

    fn finish(self: Box<Self>) -> BoxFuture<'static, Exit<S, E>> {
        let exit = self
            .state
            .ok_or_else(|| Cause::die(Defect::message("sink finished twice")));
        Box::pin(std::future::ready(exit))
    }
}

struct MapState<A, E, Z, F> {
    inner: Box<dyn SinkState<A, E, Z>>,
    f: Arc<F>,
}

impl<A, E, Z, Z2, F> SinkState<A, E, Z2> for MapState<A, E, Z, F>
where
    A: Value,
    E: Value,
    Z: Value,
    F: Fn(Z) -> Z2 + Send + Sync + 'static,
{
    fn feed(&mut self, chunk: Chunk<A>) -> BoxFuture<'_, Result<Feed<A>, Cause<E>>> {
        self.inner.feed(chunk)
    }

    fn finish(self: Box<Self>) -> BoxFuture<'static, Exit<Z2, E>> {
        let MapState { inner, f } = *self;
        inner.finish().map(move |exit| exit.map(|z| f(z))).boxed()
    }
}

struct ForEachFuture<A, F> {
    f: Arc<F>,
    _marker: PhantomData<fn(A)>,
}

impl<A, E, F, Fut> SinkState<A, E, ()> for ForEachFuture<A, F>
where
    A: Value,
    E: Value,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    fn feed(&mut self, chunk: Chunk<A>) -> BoxFuture<'_, Result<Feed<A>, Cause<E>>> {
        Box::pin(async move {
            for elem in chunk {
                (self.f)(elem).await.map_err(Cause::fail)?;
            }
            Ok(Feed::More)
        })
    }

    fn finish(self: Box<Self>) -> BoxFuture<'static, Exit<(), E>> {
        Box::pin(std::future::ready(Ok(())))
    }
}

struct Failing<E> {
    error: E,
}

impl<A, E, Z> SinkState<A, E, Z> for Failing<E>
where
    A: Value,
    E: Value + Clone,
    Z: Value,
{
    fn feed(&mut self, _chunk: Chunk<A>) -> BoxFuture<'_, Result<Feed<A>, Cause<E>>> {
        Box::pin(std::future::ready(Err(Cause::fail(self.error.clone()))))
    }

    fn finish(self: Box<Self>) -> BoxFuture<'static, Exit<Z, E>> {
        Box::pin(std::future::ready(Err(Cause::fail(self.error))))
    }
}
