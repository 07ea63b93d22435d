//! Synchronous per-chunk stages and the process that drives them.

use std::collections::VecDeque;

use futures::future::BoxFuture;

use super::{Stream, Upstream};
use crate::Value;
use crate::cause::{Cause, Defect, Exit};
use crate::channel::{Process, Signal, Step};
use crate::chunk::Chunk;

/// A stateful, synchronous transformation from chunks of `A` to chunks of
/// `B`.
///
/// Most element-wise operators are stages. A stage may hold elements back
/// across chunks (`rechunk`, `sliding`, `group_adjacent_by`) and release
/// them in [`Stage::flush`], which runs once when the upstream ends or
/// fails, before the end is propagated.
pub trait Stage<A, B>: Send {
    /// Consume one input chunk, appending output chunks to `out`.
    fn push(&mut self, chunk: Chunk<A>, out: &mut Vec<Chunk<B>>);

    /// Release held elements at the end of input.
    fn flush(&mut self, out: &mut Vec<Chunk<B>>) {
        let _ = out;
    }

    /// Returns true once the stage needs no more input. The upstream is
    /// interrupted as soon as this holds.
    fn is_done(&self) -> bool {
        false
    }
}

/// Output waiting to be emitted, followed by how the process ends.
pub(crate) struct Outbox<B, E> {
    pending: VecDeque<Chunk<B>>,
    end: Option<Exit<(), E>>,
}

impl<B, E> Default for Outbox<B, E> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            end: None,
        }
    }
}

impl<B, E> Outbox<B, E> {
    pub(crate) fn push(&mut self, chunk: Chunk<B>) {
        if !chunk.is_empty() {
            self.pending.push_back(chunk);
        }
    }

    pub(crate) fn extend(&mut self, chunks: Vec<Chunk<B>>) {
        for chunk in chunks {
            self.push(chunk);
        }
    }

    /// Record the end; it is reported once everything pending is out.
    pub(crate) fn finish(&mut self, exit: Exit<(), E>) {
        self.end.get_or_insert(exit);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.end.is_some()
    }

    /// The next signal to hand downstream, if there is one.
    pub(crate) fn next_signal(&mut self) -> Option<Signal<Chunk<B>, E, ()>> {
        if let Some(chunk) = self.pending.pop_front() {
            return Some(Signal::Emit(chunk));
        }
        match self.end.take()? {
            Ok(()) => Some(Signal::Done(())),
            Err(cause) => Some(Signal::Halt(cause)),
        }
    }
}

pub(crate) struct Staged<A, B, E, S> {
    upstream: Option<Upstream<A, E>>,
    stage: S,
    outbox: Outbox<B, E>,
}

impl<A, B, E, S> Process<Chunk<B>, E, ()> for Staged<A, B, E, S>
where
    A: Value,
    B: Value,
    E: Value,
    S: Stage<A, B>,
{
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<B>, E, ()>> {
        Box::pin(async move {
            loop {
                if let Some(signal) = self.outbox.next_signal() {
                    return signal;
                }
                let Some(upstream) = self.upstream.as_mut() else {
                    return Signal::Halt(Cause::die(Defect::message("stage pulled after it ended")));
                };
                let mut out = Vec::new();
                let end = match upstream.next().await {
                    Step::Emit(chunk) => {
                        self.stage.push(chunk, &mut out);
                        self.stage.is_done().then_some(Ok(()))
                    }
                    Step::Done(()) => Some(Ok(())),
                    Step::Halt(cause) => Some(Err(cause)),
                };
                if let Some(exit) = end {
                    self.upstream = None;
                    self.stage.flush(&mut out);
                    self.outbox.extend(out);
                    self.outbox.finish(exit);
                } else {
                    self.outbox.extend(out);
                }
            }
        })
    }
}

impl<A: Value, E: Value> Stream<A, E> {
    /// Run every chunk through `stage`.
    pub fn via<B, S>(self, stage: S) -> Stream<B, E>
    where
        B: Value,
        S: Stage<A, B> + 'static,
    {
        self.transform(move |upstream, _| Staged {
            upstream: Some(upstream),
            stage,
            outbox: Outbox::default(),
        })
    }
}
