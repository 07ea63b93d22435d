//! Element and chunk transformations.

use std::collections::VecDeque;
use std::future::Future;

use futures::future::BoxFuture;

use super::stage::Stage;
use super::{Outbox, Stream, Upstream};
use crate::Value;
use crate::cause::{Cause, Defect, Exit};
use crate::channel::{Process, Signal, Step};
use crate::chunk::Chunk;
use crate::runtime::{Fiber, fork_named};

// ============================================================================
// Stages
// ============================================================================

struct MapChunks<F>(F);

impl<A, B, F> Stage<A, B> for MapChunks<F>
where
    F: FnMut(Chunk<A>) -> Chunk<B> + Send,
{
    fn push(&mut self, chunk: Chunk<A>, out: &mut Vec<Chunk<B>>) {
        out.push((self.0)(chunk));
    }
}

struct Take {
    remaining: usize,
}

impl<A> Stage<A, A> for Take {
    fn push(&mut self, chunk: Chunk<A>, out: &mut Vec<Chunk<A>>) {
        let taken = chunk.take(self.remaining);
        self.remaining -= taken.len();
        out.push(taken);
    }

    fn is_done(&self) -> bool {
        self.remaining == 0
    }
}

struct TakeWhile<F> {
    pred: F,
    done: bool,
    /// Keep the first element failing `pred` (take_until) or not (take_while).
    inclusive: bool,
}

impl<A, F> Stage<A, A> for TakeWhile<F>
where
    F: FnMut(&A) -> bool + Send,
{
    fn push(&mut self, chunk: Chunk<A>, out: &mut Vec<Chunk<A>>) {
        let pred = &mut self.pred;
        let (mut kept, rest) = chunk.split_where(|elem| !pred(elem));
        if let Some(stop) = rest.first_owned() {
            self.done = true;
            if self.inclusive {
                kept = kept.append(stop);
            }
        }
        out.push(kept);
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

struct DropWhile<F> {
    pred: F,
    dropping: bool,
}

impl<A, F> Stage<A, A> for DropWhile<F>
where
    F: FnMut(&A) -> bool + Send,
{
    fn push(&mut self, chunk: Chunk<A>, out: &mut Vec<Chunk<A>>) {
        if !self.dropping {
            out.push(chunk);
            return;
        }
        let pred = &mut self.pred;
        let (_, rest) = chunk.split_where(|elem| !pred(elem));
        if !rest.is_empty() {
            self.dropping = false;
        }
        out.push(rest);
    }
}

struct MapAccum<S, F> {
    state: Option<S>,
    f: F,
}

impl<A, B, S, F> Stage<A, B> for MapAccum<S, F>
where
    S: Send,
    F: FnMut(S, A) -> (S, B) + Send,
{
    fn push(&mut self, chunk: Chunk<A>, out: &mut Vec<Chunk<B>>) {
        let Some(mut state) = self.state.take() else {
            return;
        };
        let mut mapped = Vec::with_capacity(chunk.len());
        for elem in chunk {
            let (next, b) = (self.f)(state, elem);
            state = next;
            mapped.push(b);
        }
        self.state = Some(state);
        out.push(Chunk::from_vec(mapped));
    }
}

struct Changes<A> {
    last: Option<A>,
}

impl<A> Stage<A, A> for Changes<A>
where
    A: PartialEq + Clone + Send,
{
    fn push(&mut self, chunk: Chunk<A>, out: &mut Vec<Chunk<A>>) {
        let mut changed = Vec::new();
        for elem in chunk {
            if self.last.as_ref() != Some(&elem) {
                self.last = Some(elem.clone());
                changed.push(elem);
            }
        }
        out.push(Chunk::from_vec(changed));
    }
}

struct Intersperse<A> {
    separator: A,
    started: bool,
}

impl<A: Clone + Send> Stage<A, A> for Intersperse<A> {
    fn push(&mut self, chunk: Chunk<A>, out: &mut Vec<Chunk<A>>) {
        let mut items = Vec::with_capacity(chunk.len() * 2);
        for elem in chunk {
            if self.started {
                items.push(self.separator.clone());
            }
            self.started = true;
            items.push(elem);
        }
        out.push(Chunk::from_vec(items));
    }
}

struct Rechunk<A> {
    size: usize,
    buffer: Vec<A>,
}

impl<A: Send> Stage<A, A> for Rechunk<A> {
    fn push(&mut self, chunk: Chunk<A>, out: &mut Vec<Chunk<A>>) {
        if self.buffer.is_empty() && chunk.len() == self.size {
            out.push(chunk);
            return;
        }
        for elem in chunk {
            self.buffer.push(elem);
            if self.buffer.len() == self.size {
                let full = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.size));
                out.push(Chunk::from_vec(full));
            }
        }
    }

    fn flush(&mut self, out: &mut Vec<Chunk<A>>) {
        out.push(Chunk::from_vec(std::mem::take(&mut self.buffer)));
    }
}

/// Ring buffer of the last `size` elements plus a count of everything seen.
struct Sliding<A> {
    size: usize,
    step: usize,
    window: VecDeque<A>,
    seen: usize,
}

impl<A: Clone + Send> Stage<A, Chunk<A>> for Sliding<A> {
    fn push(&mut self, chunk: Chunk<A>, out: &mut Vec<Chunk<Chunk<A>>>) {
        let mut windows = Vec::new();
        for elem in chunk {
            if self.window.len() == self.size {
                self.window.pop_front();
            }
            self.window.push_back(elem);
            self.seen += 1;
            if self.seen >= self.size && (self.seen - self.size) % self.step == 0 {
                windows.push(self.window.iter().cloned().collect());
            }
        }
        out.push(Chunk::from_vec(windows));
    }

    fn flush(&mut self, out: &mut Vec<Chunk<Chunk<A>>>) {
        if self.seen < self.size {
            if !self.window.is_empty() {
                out.push(Chunk::single(self.window.drain(..).collect()));
            }
            return;
        }
        let last_emit = self.seen - (self.seen - self.size) % self.step;
        if last_emit == self.seen {
            return;
        }
        // Elements that arrived after the last emitted window's successor
        // would have started.
        let consumed = (last_emit + self.step).saturating_sub(self.size);
        let leftover = self.seen.saturating_sub(consumed).min(self.window.len());
        if leftover > 0 {
            let skip = self.window.len() - leftover;
            out.push(Chunk::single(self.window.drain(..).skip(skip).collect()));
        }
    }
}

struct GroupAdjacentBy<A, K, F> {
    key: F,
    current: Option<(K, Vec<A>)>,
}

impl<A, K, F> Stage<A, (K, Chunk<A>)> for GroupAdjacentBy<A, K, F>
where
    A: Send,
    K: PartialEq + Send,
    F: FnMut(&A) -> K + Send,
{
    fn push(&mut self, chunk: Chunk<A>, out: &mut Vec<Chunk<(K, Chunk<A>)>>) {
        let mut groups = Vec::new();
        for elem in chunk {
            let key = (self.key)(&elem);
            if let Some((current, items)) = self.current.as_mut() {
                if *current == key {
                    items.push(elem);
                    continue;
                }
            }
            if let Some((done, items)) = self.current.replace((key, vec![elem])) {
                groups.push((done, Chunk::from_vec(items)));
            }
        }
        out.push(Chunk::from_vec(groups));
    }

    fn flush(&mut self, out: &mut Vec<Chunk<(K, Chunk<A>)>>) {
        if let Some((key, items)) = self.current.take() {
            out.push(Chunk::single((key, Chunk::from_vec(items))));
        }
    }
}

#[derive(Default)]
struct SplitLines {
    buffer: String,
}

impl Stage<String, String> for SplitLines {
    fn push(&mut self, chunk: Chunk<String>, out: &mut Vec<Chunk<String>>) {
        let mut lines = Vec::new();
        for text in chunk {
            self.buffer.push_str(&text);
            while let Some(newline) = self.buffer.find('\n') {
                let mut line: String = self.buffer.drain(..=newline).collect();
                line.pop();
                if line.ends_with('\r') {
                    line.pop();
                }
                lines.push(line);
            }
        }
        out.push(Chunk::from_vec(lines));
    }

    fn flush(&mut self, out: &mut Vec<Chunk<String>>) {
        if !self.buffer.is_empty() {
            out.push(Chunk::single(std::mem::take(&mut self.buffer)));
        }
    }
}

// ============================================================================
// Operators
// ============================================================================

impl<A: Value, E: Value> Stream<A, E> {
    /// Transform every element.
    pub fn map<B, F>(self, mut f: F) -> Stream<B, E>
    where
        B: Value,
        F: FnMut(A) -> B + Send + 'static,
    {
        self.map_chunks(move |chunk| chunk.map(&mut f))
    }

    /// Transform every chunk.
    pub fn map_chunks<B, F>(self, f: F) -> Stream<B, E>
    where
        B: Value,
        F: FnMut(Chunk<A>) -> Chunk<B> + Send + 'static,
    {
        self.via(MapChunks(f))
    }

    /// Keep elements matching `pred`.
    pub fn filter<F>(self, mut pred: F) -> Self
    where
        F: FnMut(&A) -> bool + Send + 'static,
    {
        self.map_chunks(move |chunk| chunk.filter(&mut pred))
    }

    /// Transform and filter in one pass.
    pub fn filter_map<B, F>(self, mut f: F) -> Stream<B, E>
    where
        B: Value,
        F: FnMut(A) -> Option<B> + Send + 'static,
    {
        self.map_chunks(move |chunk| chunk.filter_map(&mut f))
    }

    /// Observe every element without changing it.
    pub fn tap<F>(self, mut f: F) -> Self
    where
        F: FnMut(&A) + Send + 'static,
    {
        self.map_chunks(move |chunk| {
            chunk.iter().for_each(&mut f);
            chunk
        })
    }

    /// Keep the first `n` elements, then interrupt the upstream.
    pub fn take(self, n: usize) -> Self {
        if n == 0 {
            return Self::empty();
        }
        self.via(Take { remaining: n })
    }

    /// Keep elements while `pred` holds.
    pub fn take_while<F>(self, pred: F) -> Self
    where
        F: FnMut(&A) -> bool + Send + 'static,
    {
        self.via(TakeWhile {
            pred,
            done: false,
            inclusive: false,
        })
    }

    /// Keep elements up to and including the first one matching `pred`.
    pub fn take_until<F>(self, mut pred: F) -> Self
    where
        F: FnMut(&A) -> bool + Send + 'static,
    {
        self.via(TakeWhile {
            pred: move |elem: &A| !pred(elem),
            done: false,
            inclusive: true,
        })
    }

    /// Skip the first `n` elements.
    pub fn drop(self, n: usize) -> Self {
        let mut remaining = n;
        self.map_chunks(move |chunk| {
            let skip = remaining.min(chunk.len());
            remaining -= skip;
            chunk.drop(skip)
        })
    }

    /// Skip elements while `pred` holds.
    pub fn drop_while<F>(self, pred: F) -> Self
    where
        F: FnMut(&A) -> bool + Send + 'static,
    {
        self.via(DropWhile {
            pred,
            dropping: true,
        })
    }

    /// Thread a state through the elements, emitting one output per input.
    pub fn map_accum<S, B, F>(self, init: S, f: F) -> Stream<B, E>
    where
        S: Value,
        B: Value,
        F: FnMut(S, A) -> (S, B) + Send + 'static,
    {
        self.via(MapAccum {
            state: Some(init),
            f,
        })
    }

    /// Emit `init`, then every intermediate state of the fold.
    pub fn scan<S, F>(self, init: S, mut f: F) -> Stream<S, E>
    where
        S: Value + Clone,
        F: FnMut(S, A) -> S + Send + 'static,
    {
        Stream::succeed(init.clone()).concat(self.map_accum(init, move |state, elem| {
            let next = f(state, elem);
            (next.clone(), next)
        }))
    }

    /// Drop elements equal to their predecessor.
    pub fn changes(self) -> Self
    where
        A: PartialEq + Clone,
    {
        self.via(Changes { last: None })
    }

    /// Put `separator` between consecutive elements.
    pub fn intersperse(self, separator: A) -> Self
    where
        A: Clone,
    {
        self.via(Intersperse {
            separator,
            started: false,
        })
    }

    /// Pair every element with its position.
    pub fn zip_with_index(self) -> Stream<(A, u64), E> {
        self.map_accum(0u64, |index, elem| (index + 1, (elem, index)))
    }

    /// Pair every element with the one before it.
    pub fn zip_with_previous(self) -> Stream<(Option<A>, A), E>
    where
        A: Clone,
    {
        self.map_accum(None, |previous: Option<A>, elem: A| {
            (Some(elem.clone()), (previous, elem))
        })
    }

    /// Emit each chunk as a single element.
    pub fn chunks(self) -> Stream<Chunk<A>, E> {
        self.map_chunks(Chunk::single)
    }

    /// Re-cut the stream into chunks of exactly `size` elements; the last
    /// chunk may be shorter. A size of zero is treated as one.
    pub fn rechunk(self, size: usize) -> Self {
        let size = size.max(1);
        self.via(Rechunk {
            size,
            buffer: Vec::with_capacity(size),
        })
    }

    /// Group elements into chunks of `size`; the last one may be shorter.
    pub fn grouped(self, size: usize) -> Stream<Chunk<A>, E> {
        self.rechunk(size).chunks()
    }

    /// Windows of `size` elements, starting every `step` elements.
    ///
    /// When the stream ends between steps, one shorter window with the
    /// elements not yet covered is emitted. Zero `size` or `step` dies with
    /// [`Defect::InvalidArgument`].
    pub fn sliding(self, size: usize, step: usize) -> Stream<Chunk<A>, E>
    where
        A: Clone,
    {
        if size == 0 || step == 0 {
            return Stream::die(Defect::invalid_argument(format!(
                "sliding window needs a positive size and step, got size {size} and step {step}"
            )));
        }
        self.via(Sliding {
            size,
            step,
            window: VecDeque::with_capacity(size),
            seen: 0,
        })
    }

    /// Group runs of adjacent elements that share a key.
    pub fn group_adjacent_by<K, F>(self, key: F) -> Stream<(K, Chunk<A>), E>
    where
        K: Value + PartialEq,
        F: FnMut(&A) -> K + Send + 'static,
    {
        self.via(GroupAdjacentBy { key, current: None })
    }

    /// Run the future `f` derives from each element, one at a time.
    pub fn map_future<B, F, Fut>(self, f: F) -> Stream<B, E>
    where
        B: Value,
        F: FnMut(A) -> Fut + Send + 'static,
        Fut: Future<Output = Result<B, E>> + Send + 'static,
    {
        self.transform(move |upstream, _| MapFuture {
            upstream: Some(upstream),
            f,
            outbox: Outbox::default(),
        })
    }

    /// Run up to `limit` futures at once, emitting results in input order.
    pub fn map_future_par<B, F, Fut>(self, limit: usize, f: F) -> Stream<B, E>
    where
        B: Value,
        F: FnMut(A) -> Fut + Send + 'static,
        Fut: Future<Output = Result<B, E>> + Send + 'static,
    {
        self.transform(move |upstream, _| MapFuturePar {
            upstream: Some(upstream),
            waiting: VecDeque::new(),
            running: VecDeque::new(),
            limit: limit.max(1),
            f,
            end: None,
        })
    }
}

impl<A: Value, E: Value> Stream<Chunk<A>, E> {
    /// Emit the elements of every chunk element.
    pub fn flatten_chunks(self) -> Stream<A, E> {
        self.map_chunks(|chunks| chunks.into_iter().flatten().collect())
    }
}

impl<E: Value> Stream<String, E> {
    /// Split text into lines on `\n` or `\r\n`, across chunk boundaries.
    pub fn split_lines(self) -> Self {
        self.via(SplitLines::default())
    }
}

// ============================================================================
// Effectful mapping
// ============================================================================

struct MapFuture<A, B, E, F> {
    upstream: Option<Upstream<A, E>>,
    f: F,
    outbox: Outbox<B, E>,
}

impl<A, B, E, F, Fut> Process<Chunk<B>, E, ()> for MapFuture<A, B, E, F>
where
    A: Value,
    B: Value,
    E: Value,
    F: FnMut(A) -> Fut + Send,
    Fut: Future<Output = Result<B, E>> + Send,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<B>, E, ()>> {
        Box::pin(async move {
            loop {
                if let Some(signal) = self.outbox.next_signal() {
                    return signal;
                }
                let Some(upstream) = self.upstream.as_mut() else {
                    return Signal::Halt(Cause::die(Defect::message("map_future pulled after it ended")));
                };
                match upstream.next().await {
                    Step::Emit(chunk) => {
                        let mut mapped = Vec::with_capacity(chunk.len());
                        for elem in chunk {
                            match (self.f)(elem).await {
                                Ok(b) => mapped.push(b),
                                Err(error) => {
                                    self.upstream = None;
                                    self.outbox.finish(Err(Cause::fail(error)));
                                    break;
                                }
                            }
                        }
                        // Results computed before a failure are still emitted.
                        self.outbox.push(Chunk::from_vec(mapped));
                    }
                    Step::Done(()) => {
                        self.upstream = None;
                        self.outbox.finish(Ok(()));
                    }
                    Step::Halt(cause) => {
                        self.upstream = None;
                        self.outbox.finish(Err(cause));
                    }
                }
            }
        })
    }
}

struct MapFuturePar<A, B, E, F> {
    upstream: Option<Upstream<A, E>>,
    /// Pulled elements whose future has not started yet.
    waiting: VecDeque<A>,
    /// Started futures in input order.
    running: VecDeque<Fiber<Result<B, E>>>,
    limit: usize,
    f: F,
    end: Option<Exit<(), E>>,
}

impl<A, B, E, F, Fut> Process<Chunk<B>, E, ()> for MapFuturePar<A, B, E, F>
where
    A: Value,
    B: Value,
    E: Value,
    F: FnMut(A) -> Fut + Send,
    Fut: Future<Output = Result<B, E>> + Send + 'static,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<B>, E, ()>> {
        Box::pin(async move {
            loop {
                while self.running.len() < self.limit {
                    let Some(elem) = self.waiting.pop_front() else {
                        break;
                    };
                    self.running
                        .push_back(fork_named("map_future_par", (self.f)(elem)));
                }
                let front_ready = self.running.front().is_some_and(Fiber::is_finished);
                let saturated = self.running.len() >= self.limit || self.upstream.is_none();
                if !self.running.is_empty() && (front_ready || saturated) {
                    return self.emit_ready().await;
                }
                if let Some(upstream) = self.upstream.as_mut() {
                    match upstream.next().await {
                        Step::Emit(chunk) => self.waiting.extend(chunk),
                        Step::Done(()) => {
                            self.upstream = None;
                            self.end = Some(Ok(()));
                        }
                        Step::Halt(cause) => {
                            self.upstream = None;
                            self.end = Some(Err(cause));
                        }
                    }
                    continue;
                }
                return match self.end.take() {
                    Some(Err(cause)) => Signal::Halt(cause),
                    _ => Signal::Done(()),
                };
            }
        })
    }
}

impl<A, B, E, F> MapFuturePar<A, B, E, F>
where
    A: Value,
    B: Value,
    E: Value,
{
    /// Wait for the oldest future, then collect every result already done
    /// behind it.
    async fn emit_ready(&mut self) -> Signal<Chunk<B>, E, ()> {
        let mut results = Vec::new();
        while let Some(fiber) = self.running.pop_front() {
            if !results.is_empty() && !fiber.is_finished() {
                self.running.push_front(fiber);
                break;
            }
            match fiber.join::<E>().await {
                Ok(Ok(b)) => results.push(b),
                Ok(Err(error)) => return self.abort(Cause::fail(error)),
                Err(cause) => return self.abort(cause),
            }
        }
        Signal::Emit(Chunk::from_vec(results))
    }

    fn abort(&mut self, cause: Cause<E>) -> Signal<Chunk<B>, E, ()> {
        self.running.clear();
        self.waiting.clear();
        self.upstream = None;
        Signal::Halt(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sleep;
    use std::time::Duration;

    async fn collect_chunks<A: Value>(stream: Stream<A>) -> Vec<Vec<A>> {
        stream
            .chunks()
            .run_collect()
            .await
            .unwrap()
            .into_iter()
            .map(Chunk::into_vec)
            .collect()
    }

    #[tokio::test]
    async fn test_rechunk_range() {
        let chunks = collect_chunks(Stream::range(1, 10).rechunk(3)).await;
        assert_eq!(chunks, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9], vec![10]]);
    }

    #[tokio::test]
    async fn test_rechunk_passes_exact_chunks_through() {
        let stream = Stream::<i32>::from_chunks([Chunk::of([1, 2]), Chunk::of([3]), Chunk::of([4, 5])]);
        let chunks = collect_chunks(stream.rechunk(2)).await;
        assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5]]);
        let zero = collect_chunks(Stream::<i32>::from_iter([1, 2]).rechunk(0)).await;
        assert_eq!(zero, vec![vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn test_take_family() {
        let range = || Stream::<i64>::range(1, 10);
        assert_eq!(range().take(3).run_collect().await, Ok(vec![1, 2, 3]));
        assert_eq!(range().take(0).run_collect().await, Ok(vec![]));
        assert_eq!(range().take_while(|n| *n < 4).run_collect().await, Ok(vec![1, 2, 3]));
        assert_eq!(range().take_until(|n| *n == 4).run_collect().await, Ok(vec![1, 2, 3, 4]));
        assert_eq!(range().drop(8).run_collect().await, Ok(vec![9, 10]));
        assert_eq!(
            range().rechunk(3).drop_while(|n| *n < 5).run_collect().await,
            Ok(vec![5, 6, 7, 8, 9, 10])
        );
    }

    #[tokio::test]
    async fn test_take_interrupts_infinite_upstream() {
        let out = Stream::<u32>::iterate(0, |n| n + 1).take(5).run_collect().await;
        assert_eq!(out, Ok(vec![0, 1, 2, 3, 4]));
    }

    #[tokio::test]
    async fn test_scan_emits_initial_state() {
        let out = Stream::<i32>::from_iter([1, 2, 3]).scan(0, |acc, n| acc + n).run_collect().await;
        assert_eq!(out, Ok(vec![0, 1, 3, 6]));
    }

    #[tokio::test]
    async fn test_changes_intersperse_and_indexing() {
        let changes = Stream::<i32>::from_chunks([Chunk::of([1, 1, 2]), Chunk::of([2, 3, 1])]);
        assert_eq!(changes.changes().run_collect().await, Ok(vec![1, 2, 3, 1]));

        let words = Stream::<&str>::from_chunks([Chunk::of(["a", "b"]), Chunk::of(["c"])]);
        assert_eq!(words.intersperse(",").run_collect().await, Ok(vec!["a", ",", "b", ",", "c"]));

        let indexed = Stream::<char>::from_iter(['x', 'y']).zip_with_index().run_collect().await;
        assert_eq!(indexed, Ok(vec![('x', 0), ('y', 1)]));

        let pairs = Stream::<i32>::from_iter([1, 2, 3]).zip_with_previous().run_collect().await;
        assert_eq!(pairs, Ok(vec![(None, 1), (Some(1), 2), (Some(2), 3)]));
    }

    #[tokio::test]
    async fn test_sliding_windows() {
        let windows = |len: i64, size, step| async move {
            Stream::<i64>::range(1, len)
                .rechunk(2)
                .sliding(size, step)
                .map(Chunk::into_vec)
                .run_collect()
                .await
                .unwrap()
        };
        assert_eq!(
            windows(5, 3, 1).await,
            vec![vec![1, 2, 3], vec![2, 3, 4], vec![3, 4, 5]]
        );
        assert_eq!(windows(6, 3, 2).await, vec![vec![1, 2, 3], vec![3, 4, 5], vec![5, 6]]);
        assert_eq!(windows(2, 3, 1).await, vec![vec![1, 2]]);
        assert_eq!(windows(4, 2, 5).await, vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn test_sliding_rejects_zero_step() {
        let exit = Stream::<i32>::from_iter([1]).sliding(2, 0).run_collect().await;
        assert!(matches!(
            exit,
            Err(Cause::Die(Defect::InvalidArgument(_)))
        ));
    }

    #[tokio::test]
    async fn test_group_adjacent_by_crosses_chunks() {
        let stream = Stream::<i32, &str>::from_chunks([Chunk::of([1, 3, 2]), Chunk::of([4, 5])])
            .concat(Stream::fail("cut"));
        let mut pull = stream.group_adjacent_by(|n| n % 2).into_pull();
        let first = pull.pull().await.unwrap();
        assert_eq!(first, Chunk::of([(1, Chunk::of([1, 3]))]));
        let second = pull.pull().await.unwrap();
        assert_eq!(second, Chunk::of([(0, Chunk::of([2, 4]))]));
        assert_eq!(pull.pull().await.unwrap(), Chunk::of([(1, Chunk::of([5]))]));
        assert_eq!(pull.pull().await, Err(Some(Cause::fail("cut"))));
    }

    #[tokio::test]
    async fn test_split_lines() {
        let text = Stream::<String>::from_iter(["ab\r", "\ncd\n", "e", "f\ng"].map(String::from));
        let lines = text.split_lines().run_collect().await.unwrap();
        assert_eq!(lines, vec!["ab", "cd", "ef", "g"]);
    }

    #[tokio::test]
    async fn test_grouped_and_flatten_chunks() {
        let grouped = Stream::<i32>::from_iter(1..=5).grouped(2);
        let flat = grouped.flatten_chunks().run_collect().await;
        assert_eq!(flat, Ok(vec![1, 2, 3, 4, 5]));
    }

    #[tokio::test]
    async fn test_map_future_keeps_results_before_failure() {
        let stream: Stream<i32, &str> = Stream::from_iter([1, 2, 3]);
        let mut pull = stream
            .map_future(|n| async move { if n == 3 { Err("three") } else { Ok(n * 10) } })
            .into_pull();
        assert_eq!(pull.pull().await, Ok(Chunk::of([10, 20])));
        assert_eq!(pull.pull().await, Err(Some(Cause::fail("three"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_map_future_par_preserves_order() {
        let stream: Stream<u64, ()> = Stream::from_iter([30, 10, 20]);
        let out = stream
            .map_future_par(3, |ms| async move {
                sleep(Duration::from_millis(ms)).await;
                Ok(ms)
            })
            .run_collect()
            .await;
        assert_eq!(out, Ok(vec![30, 10, 20]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_map_future_par_runs_concurrently() {
        let start = tokio::time::Instant::now();
        let stream: Stream<u64, ()> = Stream::from_iter(0..8);
        let out = stream
            .map_future_par(4, |n| async move {
                sleep(Duration::from_secs(1)).await;
                Ok(n)
            })
            .run_count()
            .await;
        assert_eq!(out, Ok(8));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
