//! Pairing two streams element by element.

use std::cmp::Ordering;
use std::collections::VecDeque;

use futures::future::{BoxFuture, Either};

use super::{Stream, Upstream};
use crate::Value;
use crate::cause::{Cause, Exit};
use crate::channel::{Input, Process, Signal, Step};
use crate::chunk::Chunk;

/// The unpaired part of a chunk left over after zipping two chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remainder<A, B> {
    /// Elements of the left chunk waiting for right elements.
    Left(Chunk<A>),
    /// Elements of the right chunk waiting for left elements.
    Right(Chunk<B>),
}

impl<A: Value, E: Value> Stream<A, E> {
    /// Zip with `that` chunk by chunk. `f` pairs up two chunks and hands back
    /// whatever it did not use; the stream ends when either side ends.
    pub fn zip_with_chunks<B, C, F>(self, that: Stream<B, E>, f: F) -> Stream<C, E>
    where
        B: Value,
        C: Value,
        F: FnMut(Chunk<A>, Chunk<B>) -> (Chunk<C>, Remainder<A, B>) + Send + 'static,
    {
        let right = that.channel;
        self.transform(move |left, scope| ZipChunks {
            left,
            right: right.start(Input::empty(), scope),
            state: ZipState::PullBoth,
            f,
        })
    }

    /// Pair elements positionally with `f`, stopping at the shorter side.
    pub fn zip_with<B, C, F>(self, that: Stream<B, E>, mut f: F) -> Stream<C, E>
    where
        B: Value,
        C: Value,
        F: FnMut(A, B) -> C + Send + 'static,
    {
        self.zip_with_chunks(that, move |left, right| {
            let n = left.len().min(right.len());
            let (left, left_rest) = left.split_at(n);
            let (right, right_rest) = right.split_at(n);
            let remainder = if left_rest.is_empty() {
                Remainder::Right(right_rest)
            } else {
                Remainder::Left(left_rest)
            };
            (left.zip_with(right, &mut f), remainder)
        })
    }

    /// Pair elements positionally, stopping at the shorter side.
    pub fn zip<B: Value>(self, that: Stream<B, E>) -> Stream<(A, B), E> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Pair elements positionally until both sides end. Once a side ends,
    /// the other one's elements go through `on_self` or `on_other`.
    pub fn zip_all_with<B, C, FS, FO, FB>(
        self,
        that: Stream<B, E>,
        on_self: FS,
        on_other: FO,
        on_both: FB,
    ) -> Stream<C, E>
    where
        B: Value,
        C: Value,
        FS: FnMut(A) -> C + Send + 'static,
        FO: FnMut(B) -> C + Send + 'static,
        FB: FnMut(A, B) -> C + Send + 'static,
    {
        let right = that.channel;
        self.transform(move |left, scope| ZipAll {
            left,
            right: right.start(Input::empty(), scope),
            state: ZipAllState::PullBoth,
            on_self,
            on_other,
            on_both,
        })
    }

    /// Pair elements positionally until both sides end, padding the shorter
    /// side with its default.
    pub fn zip_all<B>(self, that: Stream<B, E>, default_self: A, default_other: B) -> Stream<(A, B), E>
    where
        A: Clone,
        B: Value + Clone,
    {
        self.zip_all_with(
            that,
            move |a| (a, default_other.clone()),
            move |b| (default_self.clone(), b),
            |a, b| (a, b),
        )
    }
}

impl<K, A, E> Stream<(K, A), E>
where
    K: Value + Ord,
    A: Value,
    E: Value,
{
    /// Join two streams sorted by key. Keys present on both sides go through
    /// `on_both`, the others through `on_self` or `on_other`; output stays
    /// sorted.
    pub fn zip_all_sorted_by_key_with<B, C, FS, FO, FB>(
        self,
        that: Stream<(K, B), E>,
        on_self: FS,
        on_other: FO,
        on_both: FB,
    ) -> Stream<(K, C), E>
    where
        B: Value,
        C: Value,
        FS: FnMut(A) -> C + Send + 'static,
        FO: FnMut(B) -> C + Send + 'static,
        FB: FnMut(A, B) -> C + Send + 'static,
    {
        let right = that.channel;
        self.transform(move |left, scope| ZipSorted {
            left: Side::new(left),
            right: Side::new(right.start(Input::empty(), scope)),
            on_self,
            on_other,
            on_both,
        })
    }
}

/// Pull both sides at once, returning as soon as either side ends or
/// fails.
async fn pull_both<A, B, E>(
    left: &mut Upstream<A, E>,
    right: &mut Upstream<B, E>,
) -> Result<(Chunk<A>, Chunk<B>), Exit<(), E>>
where
    A: Value,
    B: Value,
    E: Value,
{
    let left_pull = left.next();
    let right_pull = right.next();
    tokio::pin!(left_pull, right_pull);
    let mut pulled_left = None;
    let mut pulled_right = None;
    loop {
        tokio::select! {
            step = &mut left_pull, if pulled_left.is_none() => match step {
                Step::Emit(chunk) => pulled_left = Some(chunk),
                Step::Done(()) => return Err(Ok(())),
                Step::Halt(cause) => return Err(Err(cause)),
            },
            step = &mut right_pull, if pulled_right.is_none() => match step {
                Step::Emit(chunk) => pulled_right = Some(chunk),
                Step::Done(()) => return Err(Ok(())),
                Step::Halt(cause) => return Err(Err(cause)),
            },
        }
        if let (Some(_), Some(_)) = (&pulled_left, &pulled_right) {
            break;
        }
    }
    match (pulled_left, pulled_right) {
        (Some(left), Some(right)) => Ok((left, right)),
        _ => Err(Ok(())),
    }
}

/// Pull both sides at once and wait for both results. A failure on either
/// side wins immediately and abandons the other pull.
async fn pull_both_steps<A, B, E>(
    left: &mut Upstream<A, E>,
    right: &mut Upstream<B, E>,
) -> Result<(Step<Chunk<A>, E, ()>, Step<Chunk<B>, E, ()>), Cause<E>>
where
    A: Value,
    B: Value,
    E: Value,
{
    let left_pull = left.next();
    let right_pull = right.next();
    tokio::pin!(left_pull, right_pull);
    let first = tokio::select! {
        step = &mut left_pull => Either::Left(step),
        step = &mut right_pull => Either::Right(step),
    };
    match first {
        Either::Left(step) => {
            let left = unless_halted(step)?;
            Ok((left, unless_halted(right_pull.await)?))
        }
        Either::Right(step) => {
            let right = unless_halted(step)?;
            Ok((unless_halted(left_pull.await)?, right))
        }
    }
}

fn unless_halted<O, E>(step: Step<O, E, ()>) -> Result<Step<O, E, ()>, Cause<E>> {
    match step {
        Step::Halt(cause) => Err(cause),
        step => Ok(step),
    }
}

fn end_signal<O, E>(exit: Exit<(), E>) -> Signal<O, E, ()> {
    match exit {
        Ok(()) => Signal::Done(()),
        Err(cause) => Signal::Halt(cause),
    }
}

// ============================================================================
// Positional zip
// ============================================================================

enum ZipState<A, B> {
    PullBoth,
    /// Right elements carried over, waiting for left ones.
    PullLeft(Chunk<B>),
    /// Left elements carried over, waiting for right ones.
    PullRight(Chunk<A>),
}

struct ZipChunks<A, B, E, F> {
    left: Upstream<A, E>,
    right: Upstream<B, E>,
    state: ZipState<A, B>,
    f: F,
}

impl<A, B, C, E, F> Process<Chunk<C>, E, ()> for ZipChunks<A, B, E, F>
where
    A: Value,
    B: Value,
    C: Value,
    E: Value,
    F: FnMut(Chunk<A>, Chunk<B>) -> (Chunk<C>, Remainder<A, B>) + Send,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<C>, E, ()>> {
        Box::pin(async move {
            loop {
                let (left, right) = match std::mem::replace(&mut self.state, ZipState::PullBoth) {
                    ZipState::PullBoth => match pull_both(&mut self.left, &mut self.right).await {
                        Ok(pair) => pair,
                        Err(exit) => return end_signal(exit),
                    },
                    ZipState::PullLeft(carried) => match self.left.next().await {
                        Step::Emit(chunk) => (chunk, carried),
                        Step::Done(()) => return Signal::Done(()),
                        Step::Halt(cause) => return Signal::Halt(cause),
                    },
                    ZipState::PullRight(carried) => match self.right.next().await {
                        Step::Emit(chunk) => (carried, chunk),
                        Step::Done(()) => return Signal::Done(()),
                        Step::Halt(cause) => return Signal::Halt(cause),
                    },
                };
                if left.is_empty() {
                    self.state = ZipState::PullLeft(right);
                    continue;
                }
                if right.is_empty() {
                    self.state = ZipState::PullRight(left);
                    continue;
                }
                let (out, remainder) = (self.f)(left, right);
                self.state = match remainder {
                    Remainder::Left(rest) if !rest.is_empty() => ZipState::PullRight(rest),
                    Remainder::Right(rest) if !rest.is_empty() => ZipState::PullLeft(rest),
                    _ => ZipState::PullBoth,
                };
                if !out.is_empty() {
                    return Signal::Emit(out);
                }
            }
        })
    }
}

// ============================================================================
// Zip until both end
// ============================================================================

enum ZipAllState<A, B> {
    PullBoth,
    PullLeft(Chunk<B>),
    PullRight(Chunk<A>),
    /// The right side ended.
    DrainLeft,
    /// The left side ended.
    DrainRight,
}

struct ZipAll<A, B, E, FS, FO, FB> {
    left: Upstream<A, E>,
    right: Upstream<B, E>,
    state: ZipAllState<A, B>,
    on_self: FS,
    on_other: FO,
    on_both: FB,
}

impl<A, B, C, E, FS, FO, FB> ZipAll<A, B, E, FS, FO, FB>
where
    A: Value,
    B: Value,
    C: Value,
    FS: FnMut(A) -> C,
    FO: FnMut(B) -> C,
    FB: FnMut(A, B) -> C,
{
    fn pair(&mut self, left: Chunk<A>, right: Chunk<B>) -> Chunk<C> {
        let n = left.len().min(right.len());
        let (left, left_rest) = left.split_at(n);
        let (right, right_rest) = right.split_at(n);
        self.state = if !left_rest.is_empty() {
            ZipAllState::PullRight(left_rest)
        } else if !right_rest.is_empty() {
            ZipAllState::PullLeft(right_rest)
        } else {
            ZipAllState::PullBoth
        };
        left.zip_with(right, &mut self.on_both)
    }
}

impl<A, B, C, E, FS, FO, FB> Process<Chunk<C>, E, ()> for ZipAll<A, B, E, FS, FO, FB>
where
    A: Value,
    B: Value,
    C: Value,
    E: Value,
    FS: FnMut(A) -> C + Send,
    FO: FnMut(B) -> C + Send,
    FB: FnMut(A, B) -> C + Send,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<C>, E, ()>> {
        Box::pin(async move {
            loop {
                let out = match std::mem::replace(&mut self.state, ZipAllState::PullBoth) {
                    ZipAllState::PullBoth => {
                        match pull_both_steps(&mut self.left, &mut self.right).await {
                            Err(cause) | Ok((Step::Halt(cause), _) | (_, Step::Halt(cause))) => {
                                return Signal::Halt(cause);
                            }
                            Ok((Step::Done(()), Step::Done(()))) => return Signal::Done(()),
                            Ok((Step::Emit(left), Step::Done(()))) => {
                                self.state = ZipAllState::DrainLeft;
                                left.map(&mut self.on_self)
                            }
                            Ok((Step::Done(()), Step::Emit(right))) => {
                                self.state = ZipAllState::DrainRight;
                                right.map(&mut self.on_other)
                            }
                            Ok((Step::Emit(left), Step::Emit(right))) => self.pair(left, right),
                        }
                    }
                    ZipAllState::PullLeft(carried) => match self.left.next().await {
                        Step::Emit(left) => self.pair(left, carried),
                        Step::Done(()) => {
                            self.state = ZipAllState::DrainRight;
                            carried.map(&mut self.on_other)
                        }
                        Step::Halt(cause) => return Signal::Halt(cause),
                    },
                    ZipAllState::PullRight(carried) => match self.right.next().await {
                        Step::Emit(right) => self.pair(carried, right),
                        Step::Done(()) => {
                            self.state = ZipAllState::DrainLeft;
                            carried.map(&mut self.on_self)
                        }
                        Step::Halt(cause) => return Signal::Halt(cause),
                    },
                    ZipAllState::DrainLeft => {
                        self.state = ZipAllState::DrainLeft;
                        match self.left.next().await {
                            Step::Emit(left) => left.map(&mut self.on_self),
                            Step::Done(()) => return Signal::Done(()),
                            Step::Halt(cause) => return Signal::Halt(cause),
                        }
                    }
                    ZipAllState::DrainRight => {
                        self.state = ZipAllState::DrainRight;
                        match self.right.next().await {
                            Step::Emit(right) => right.map(&mut self.on_other),
                            Step::Done(()) => return Signal::Done(()),
                            Step::Halt(cause) => return Signal::Halt(cause),
                        }
                    }
                };
                if !out.is_empty() {
                    return Signal::Emit(out);
                }
            }
        })
    }
}

// ============================================================================
// Sorted key join
// ============================================================================

/// One input of a sorted join: buffered elements and whether it ended.
struct Side<K, V, E> {
    upstream: Upstream<(K, V), E>,
    buffered: VecDeque<(K, V)>,
    ended: bool,
}

impl<K: Value, V: Value, E: Value> Side<K, V, E> {
    fn new(upstream: Upstream<(K, V), E>) -> Self {
        Self {
            upstream,
            buffered: VecDeque::new(),
            ended: false,
        }
    }

    fn wants_input(&self) -> bool {
        self.buffered.is_empty() && !self.ended
    }

    /// Record the result of a pull.
    fn receive(&mut self, step: Step<Chunk<(K, V)>, E, ()>) -> Result<(), Cause<E>> {
        match step {
            Step::Emit(chunk) => self.buffered.extend(chunk),
            Step::Done(()) => self.ended = true,
            Step::Halt(cause) => return Err(cause),
        }
        Ok(())
    }
}

struct ZipSorted<K, A, B, E, FS, FO, FB> {
    left: Side<K, A, E>,
    right: Side<K, B, E>,
    on_self: FS,
    on_other: FO,
    on_both: FB,
}

impl<K, A, B, C, E, FS, FO, FB> ZipSorted<K, A, B, E, FS, FO, FB>
where
    K: Value + Ord,
    A: Value,
    B: Value,
    C: Value,
    E: Value,
    FS: FnMut(A) -> C,
    FO: FnMut(B) -> C,
    FB: FnMut(A, B) -> C,
{
    async fn fill(&mut self) -> Result<(), Cause<E>> {
        match (self.left.wants_input(), self.right.wants_input()) {
            (true, true) => {
                let (left, right) =
                    pull_both_steps(&mut self.left.upstream, &mut self.right.upstream).await?;
                self.left.receive(left)?;
                self.right.receive(right)
            }
            (true, false) => {
                let step = self.left.upstream.next().await;
                self.left.receive(step)
            }
            (false, true) => {
                let step = self.right.upstream.next().await;
                self.right.receive(step)
            }
            (false, false) => Ok(()),
        }
    }

    /// Join everything that can be decided with the buffered elements.
    fn join_buffered(&mut self) -> Vec<(K, C)> {
        let mut out = Vec::new();
        loop {
            let order = match (self.left.buffered.front(), self.right.buffered.front()) {
                (Some((left, _)), Some((right, _))) => left.cmp(right),
                (Some(_), None) if self.right.ended => Ordering::Less,
                (None, Some(_)) if self.left.ended => Ordering::Greater,
                _ => return out,
            };
            match order {
                Ordering::Less => {
                    if let Some((key, a)) = self.left.buffered.pop_front() {
                        out.push((key, (self.on_self)(a)));
                    }
                }
                Ordering::Greater => {
                    if let Some((key, b)) = self.right.buffered.pop_front() {
                        out.push((key, (self.on_other)(b)));
                    }
                }
                Ordering::Equal => {
                    if let (Some((key, a)), Some((_, b))) =
                        (self.left.buffered.pop_front(), self.right.buffered.pop_front())
                    {
                        out.push((key, (self.on_both)(a, b)));
                    }
                }
            }
        }
    }
}

impl<K, A, B, C, E, FS, FO, FB> Process<Chunk<(K, C)>, E, ()> for ZipSorted<K, A, B, E, FS, FO, FB>
where
    K: Value + Ord,
    A: Value,
    B: Value,
    C: Value,
    E: Value,
    FS: FnMut(A) -> C + Send,
    FO: FnMut(B) -> C + Send,
    FB: FnMut(A, B) -> C + Send,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<(K, C)>, E, ()>> {
        Box::pin(async move {
            loop {
                let out = self.join_buffered();
                if !out.is_empty() {
                    return Signal::Emit(Chunk::from_vec(out));
                }
                if self.left.ended && self.right.ended {
                    return Signal::Done(());
                }
                if let Err(cause) = self.fill().await {
                    return Signal::Halt(cause);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zip_stops_at_shorter_side() {
        let out = Stream::<i32>::from_iter([1, 2, 3])
            .zip(Stream::from_iter(["a", "b"]))
            .run_collect()
            .await;
        assert_eq!(out, Ok(vec![(1, "a"), (2, "b")]));
    }

    #[tokio::test]
    async fn test_zip_with_across_chunk_boundaries() {
        let left = Stream::<i64>::range_with_chunk_size(1, 10, 3);
        let right = Stream::range_with_chunk_size(1, 10, 4);
        let out = left.zip_with(right, |a, b| a + b).run_collect().await;
        assert_eq!(out, Ok((1..=10).map(|n| n * 2).collect()));
    }

    #[tokio::test]
    async fn test_zip_propagates_failure() {
        let left: Stream<i32, &str> = Stream::from_iter([1]).concat(Stream::fail("left"));
        let out = left.zip(Stream::from_iter([1, 2, 3])).run_collect().await;
        assert_eq!(out, Err(Cause::fail("left")));
    }

    #[tokio::test]
    async fn test_zip_ends_even_if_other_side_never_does() {
        let out = Stream::<i32>::empty().zip(Stream::<i32>::never()).run_collect().await;
        assert_eq!(out, Ok(vec![]));
    }

    #[tokio::test]
    async fn test_zip_all_pads_shorter_side() {
        let out = Stream::<i32>::from_iter([1, 2, 3])
            .zip_all(Stream::from_iter([10]), 0, 0)
            .run_collect()
            .await;
        assert_eq!(out, Ok(vec![(1, 10), (2, 0), (3, 0)]));

        let out = Stream::<i32>::from_iter_with_chunk_size([1], 1)
            .zip_all(Stream::from_iter_with_chunk_size([10, 20, 30], 2), -1, -1)
            .run_collect()
            .await;
        assert_eq!(out, Ok(vec![(1, 10), (-1, 20), (-1, 30)]));
    }

    #[tokio::test]
    async fn test_zip_all_with() {
        let out = Stream::<i32>::from_iter([1, 2])
            .zip_all_with(
                Stream::from_iter([10, 20, 30]),
                |a| format!("L{a}"),
                |b| format!("R{b}"),
                |a, b| format!("{a}+{b}"),
            )
            .run_collect()
            .await;
        assert_eq!(out, Ok(vec!["1+10".to_string(), "2+20".into(), "R30".into()]));
    }

    #[tokio::test]
    async fn test_zip_all_sorted_by_key_with() {
        let left: Stream<(u32, &str)> = Stream::from_iter_with_chunk_size([(1, "a"), (3, "c"), (4, "d")], 2);
        let right = Stream::from_iter([(1, 10), (2, 20), (4, 40), (5, 50)]);
        let out = left
            .zip_all_sorted_by_key_with(
                right,
                |a| a.to_string(),
                |b| b.to_string(),
                |a, b| format!("{a}{b}"),
            )
            .run_collect()
            .await
            .unwrap();
        let expected: Vec<(u32, String)> = vec![
            (1, "a10".into()),
            (2, "20".into()),
            (3, "c".into()),
            (4, "d40".into()),
            (5, "50".into()),
        ];
        assert_eq!(out, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zip_all_fails_while_other_side_stalls() {
        let out = Stream::<i32, &str>::fail("left broke")
            .zip_all(Stream::never(), 0, 0)
            .run_collect()
            .await;
        assert_eq!(out, Err(Cause::fail("left broke")));

        let out = Stream::<i32, &str>::never()
            .zip_all(Stream::<i32, &str>::fail("right broke"), 0, 0)
            .run_collect()
            .await;
        assert_eq!(out, Err(Cause::fail("right broke")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zip_all_sorted_fails_while_other_side_stalls() {
        let left: Stream<(u32, i32), &str> = Stream::fail("left broke");
        let out = left
            .zip_all_sorted_by_key_with(Stream::<(u32, i32), &str>::never(), |a| a, |b| b, |a, b| a + b)
            .run_collect()
            .await;
        assert_eq!(out, Err(Cause::fail("left broke")));
    }
}
