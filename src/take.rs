//! Tagged values that travel through queues and handoffs.

use crate::cause::Cause;
use crate::chunk::Chunk;

/// One pull's worth of a stream: data, a failure, or the end.
///
/// Once a consumer observes `Fail` or `End` no further `Chunk` follows on the
/// same logical stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Take<A, E> {
    /// A batch of elements.
    Chunk(Chunk<A>),
    /// The stream failed.
    Fail(Cause<E>),
    /// The stream ended.
    End,
}

impl<A, E> Take<A, E> {
    /// A data take.
    pub fn chunk(chunk: Chunk<A>) -> Self {
        Self::Chunk(chunk)
    }

    /// A data take holding one element.
    pub fn single(item: A) -> Self {
        Self::Chunk(Chunk::single(item))
    }

    /// A typed failure take.
    pub fn fail(error: E) -> Self {
        Self::Fail(Cause::fail(error))
    }

    /// A failure take with a full cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::Fail(cause)
    }

    /// The end-of-stream take.
    pub fn end() -> Self {
        Self::End
    }

    /// Rebuild a take from a pull result (the inverse of [`Take::done`]).
    pub fn from_pull(pull: Result<Chunk<A>, Option<Cause<E>>>) -> Self {
        match pull {
            Ok(chunk) => Self::Chunk(chunk),
            Err(Some(cause)) => Self::Fail(cause),
            Err(None) => Self::End,
        }
    }

    /// Convert to a pull result: `Err(None)` means no more data and
    /// `Err(Some(cause))` a real failure.
    pub fn done(self) -> Result<Chunk<A>, Option<Cause<E>>> {
        match self {
            Self::Chunk(chunk) => Ok(chunk),
            Self::Fail(cause) => Err(Some(cause)),
            Self::End => Err(None),
        }
    }

    /// Fold the take into a single value.
    pub fn fold<Z>(
        self,
        on_end: impl FnOnce() -> Z,
        on_failure: impl FnOnce(Cause<E>) -> Z,
        on_success: impl FnOnce(Chunk<A>) -> Z,
    ) -> Z {
        match self {
            Self::Chunk(chunk) => on_success(chunk),
            Self::Fail(cause) => on_failure(cause),
            Self::End => on_end(),
        }
    }

    /// Transform the elements of a data take.
    pub fn map<B>(self, f: impl FnMut(A) -> B) -> Take<B, E> {
        match self {
            Self::Chunk(chunk) => Take::Chunk(chunk.map(f)),
            Self::Fail(cause) => Take::Fail(cause),
            Self::End => Take::End,
        }
    }

    /// Returns true for the end-of-stream take.
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }

    /// Returns true for a failure take.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail(_))
    }

    /// Returns true for a data take.
    pub fn is_chunk(&self) -> bool {
        matches!(self, Self::Chunk(_))
    }
}

/// Why a handoff-driven producer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// A schedule driving the consumer completed.
    ScheduleEnd,
    /// The upstream stream completed.
    UpstreamEnd,
}

/// The value exchanged through a handoff between a producer fiber and the
/// stage consuming it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffSignal<A, E> {
    /// A batch of elements.
    Emit(Chunk<A>),
    /// The producer failed.
    Halt(Cause<E>),
    /// The producer stopped.
    End(EndReason),
}

impl<A, E> From<Take<A, E>> for HandoffSignal<A, E> {
    fn from(take: Take<A, E>) -> Self {
        match take {
            Take::Chunk(chunk) => Self::Emit(chunk),
            Take::Fail(cause) => Self::Halt(cause),
            Take::End => Self::End(EndReason::UpstreamEnd),
        }
    }
}
