//! Combining two streams with a stateful pull function.
//!
//! Each side runs on its own fiber, answering pull requests one at a time
//! through a pair of handoffs: the consumer offers a request, the producer
//! takes it, pulls its upstream and offers back the result.

use std::collections::VecDeque;
use std::future::Future;

use futures::future::BoxFuture;
use tracing::trace;

use super::{Stream, Upstream};
use crate::Value;
use crate::cause::{Cause, Defect};
use crate::channel::{Input, Process, Signal, Step};
use crate::chunk::Chunk;
use crate::runtime::{Fiber, fork_named};
use crate::sync::Handoff;

/// The result of a pull: a value, `Err(None)` at the end or the failure.
pub type Pulled<T, E> = Result<T, Option<Cause<E>>>;

/// Pulls values from one side of a [`Stream::combine`].
///
/// After the side ends or fails every pull reports the same outcome.
pub struct Puller<T, E> {
    request: Handoff<()>,
    response: Handoff<Pulled<T, E>>,
}

impl<T, E> Clone for Puller<T, E> {
    fn clone(&self) -> Self {
        Self {
            request: self.request.clone(),
            response: self.response.clone(),
        }
    }
}

impl<T: Value, E: Value> Puller<T, E> {
    fn new() -> Self {
        Self {
            request: Handoff::new(),
            response: Handoff::new(),
        }
    }

    /// Pull the next value.
    pub async fn pull(&self) -> Pulled<T, E> {
        self.request.offer(()).await;
        self.response.take().await
    }
}

impl<A: Value, E: Value + Clone> Stream<A, E> {
    /// Combine with `that` through `f`, which gets the current state and a
    /// puller per side and returns the next element with the next state.
    /// `Err(None)` ends the stream.
    pub fn combine<B, C, S, F, Fut>(self, that: Stream<B, E>, init: S, f: F) -> Stream<C, E>
    where
        B: Value,
        C: Value,
        S: Value,
        F: FnMut(S, Puller<A, E>, Puller<B, E>) -> Fut + Send + 'static,
        Fut: Future<Output = Pulled<(C, S), E>> + Send + 'static,
    {
        let right = that.channel;
        self.transform(move |left, scope| {
            let right = right.start(Input::empty(), scope);
            let (left_puller, left_fiber) = serve(left, serve_elements);
            let (right_puller, right_fiber) = serve(right, serve_elements);
            Combine {
                state: Some(init),
                left: left_puller,
                right: right_puller,
                f,
                _producers: [left_fiber, right_fiber],
                wrap: Chunk::single,
            }
        })
    }

    /// Like [`Stream::combine`], pulling and emitting whole chunks.
    pub fn combine_chunks<B, C, S, F, Fut>(self, that: Stream<B, E>, init: S, f: F) -> Stream<C, E>
    where
        B: Value,
        C: Value,
        S: Value,
        F: FnMut(S, Puller<Chunk<A>, E>, Puller<Chunk<B>, E>) -> Fut + Send + 'static,
        Fut: Future<Output = Pulled<(Chunk<C>, S), E>> + Send + 'static,
    {
        let right = that.channel;
        self.transform(move |left, scope| {
            let right = right.start(Input::empty(), scope);
            let (left_puller, left_fiber) = serve(left, serve_chunks);
            let (right_puller, right_fiber) = serve(right, serve_chunks);
            Combine {
                state: Some(init),
                left: left_puller,
                right: right_puller,
                f,
                _producers: [left_fiber, right_fiber],
                wrap: std::convert::identity,
            }
        })
    }

    /// Alternate elements of this stream and `that`, starting here. Once one
    /// side ends the rest of the other follows.
    pub fn interleave(self, that: Stream<A, E>) -> Self {
        self.combine(that, (true, false, false), |(left_turn, mut left_done, mut right_done), left, right| async move {
            loop {
                if left_done && right_done {
                    return Err(None);
                }
                let from_left = (left_turn && !left_done) || right_done;
                let pulled = if from_left { left.pull().await } else { right.pull().await };
                match pulled {
                    Ok(elem) => return Ok((elem, (!from_left, left_done, right_done))),
                    Err(None) if from_left => left_done = true,
                    Err(None) => right_done = true,
                    Err(Some(cause)) => return Err(Some(cause)),
                }
            }
        })
    }
}

// ============================================================================
// Producers
// ============================================================================

fn serve<A, E, T, F, Fut>(upstream: Upstream<A, E>, producer: F) -> (Puller<T, E>, Fiber<()>)
where
    A: Value,
    E: Value,
    T: Value,
    F: FnOnce(Upstream<A, E>, Puller<T, E>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let puller = Puller::new();
    let fiber = fork_named("combine", producer(upstream, puller.clone()));
    (puller, fiber)
}

async fn serve_chunks<A: Value, E: Value + Clone>(mut upstream: Upstream<A, E>, puller: Puller<Chunk<A>, E>) {
    let mut terminal: Option<Option<Cause<E>>> = None;
    loop {
        puller.request.take().await;
        let answer = match terminal.clone() {
            Some(end) => Err(end),
            None => match upstream.next().await {
                Step::Emit(chunk) => Ok(chunk),
                Step::Done(()) => Err(terminal.insert(None).clone()),
                Step::Halt(cause) => Err(terminal.insert(Some(cause)).clone()),
            },
        };
        puller.response.offer(answer).await;
    }
}

async fn serve_elements<A: Value, E: Value + Clone>(mut upstream: Upstream<A, E>, puller: Puller<A, E>) {
    let mut pending = VecDeque::new();
    let mut terminal: Option<Option<Cause<E>>> = None;
    loop {
        puller.request.take().await;
        let answer = loop {
            if let Some(elem) = pending.pop_front() {
                break Ok(elem);
            }
            if let Some(end) = &terminal {
                break Err(end.clone());
            }
            match upstream.next().await {
                Step::Emit(chunk) => pending.extend(chunk),
                Step::Done(()) => terminal = Some(None),
                Step::Halt(cause) => terminal = Some(Some(cause)),
            }
        };
        puller.response.offer(answer).await;
    }
}

// ============================================================================
// Consumer
// ============================================================================

struct Combine<L, R, S, F, W> {
    state: Option<S>,
    left: L,
    right: R,
    f: F,
    /// Interrupted when the combined stream is dropped.
    _producers: [Fiber<()>; 2],
    /// Turns one result into an output chunk.
    wrap: W,
}

impl<L, R, S, T, C, E, F, Fut, W> Process<Chunk<C>, E, ()> for Combine<L, R, S, F, W>
where
    L: Clone + Send,
    R: Clone + Send,
    S: Value,
    T: Value,
    C: Value,
    E: Value,
    F: FnMut(S, L, R) -> Fut + Send,
    Fut: Future<Output = Pulled<(T, S), E>> + Send,
    W: Fn(T) -> Chunk<C> + Send,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<C>, E, ()>> {
        Box::pin(async move {
            let Some(state) = self.state.take() else {
                return Signal::Halt(Cause::die(Defect::message("combine pulled after it ended")));
            };
            match (self.f)(state, self.left.clone(), self.right.clone()).await {
                Ok((out, state)) => {
                    self.state = Some(state);
                    Signal::Emit((self.wrap)(out))
                }
                Err(None) => {
                    trace!("combine: ended");
                    Signal::Done(())
                }
                Err(Some(cause)) => Signal::Halt(cause),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_combine_pairs_sides() {
        let left: Stream<i32, ()> = Stream::from_iter([1, 2, 3]);
        let right = Stream::from_iter_with_chunk_size([10, 20, 30, 40], 3);
        let out = left
            .combine(right, 0, |count, left, right| async move {
                let a = left.pull().await?;
                let b = right.pull().await?;
                Ok(((count, a + b), count + 1))
            })
            .run_collect()
            .await;
        assert_eq!(out, Ok(vec![(0, 11), (1, 22), (2, 33)]));
    }

    #[tokio::test]
    async fn test_combine_failure() {
        let left: Stream<i32, &str> = Stream::from_iter([1]).concat(Stream::fail("left"));
        let out = left
            .combine(Stream::from_iter([1, 2]), (), |(), left, right| async move {
                let a = left.pull().await?;
                let b = right.pull().await?;
                Ok((a * b, ()))
            })
            .run_collect()
            .await;
        assert_eq!(out, Err(Cause::fail("left")));
    }

    #[tokio::test]
    async fn test_puller_repeats_end() {
        let out = Stream::<i32, ()>::empty()
            .combine(Stream::<i32, ()>::from_iter([5]), false, |seen_end, left, right| async move {
                if seen_end {
                    return Err(None);
                }
                let first = left.pull().await;
                let second = left.pull().await;
                assert_eq!(first, Err(None));
                assert_eq!(second, Err(None));
                Ok((right.pull().await?, true))
            })
            .run_collect()
            .await;
        assert_eq!(out, Ok(vec![5]));
    }

    #[tokio::test]
    async fn test_combine_chunks() {
        let left: Stream<i32, ()> = Stream::from_chunks([Chunk::of([1, 2]), Chunk::of([3])]);
        let right = Stream::from_chunks([Chunk::of([10]), Chunk::of([20, 30])]);
        let out = left
            .combine_chunks(right, (), |(), left, right| async move {
                let a = left.pull().await?;
                let b = right.pull().await?;
                Ok((a.append_all(b), ()))
            })
            .chunks()
            .run_collect()
            .await
            .unwrap();
        let out: Vec<Vec<i32>> = out.into_iter().map(Chunk::into_vec).collect();
        assert_eq!(out, vec![vec![1, 2, 10], vec![3, 20, 30]]);
    }

    #[tokio::test]
    async fn test_interleave() {
        let out = Stream::<i32, ()>::from_iter([1, 2, 3])
            .interleave(Stream::from_iter([10, 20]))
            .run_collect()
            .await;
        assert_eq!(out, Ok(vec![1, 10, 2, 20, 3]));

        let out = Stream::<i32, ()>::from_iter([1])
            .interleave(Stream::from_iter([10, 20, 30]))
            .run_collect()
            .await;
        assert_eq!(out, Ok(vec![1, 10, 20, 30]));
    }
}
