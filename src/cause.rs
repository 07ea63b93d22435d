//! Structured failure values.
//!
//! A stream never halts with a bare error. It halts with a [`Cause`], which
//! records whether the failure was expected (a typed `E`), a defect (a bug or
//! a panic), or an interruption, and how several failures combined when more
//! than one happened (sequentially, or in parallel fibers).

use std::any::Any;
use std::fmt;

use thiserror::Error;

/// Exit value of a channel, fiber or stream run.
pub type Exit<A, E> = std::result::Result<A, Cause<E>>;

/// An unexpected failure that is not part of a stream's typed error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Defect {
    /// A per-pull timeout elapsed. `timeout_to` switches streams on this.
    #[error("stream timeout")]
    StreamTimeout,

    /// A fiber, callback or finalizer panicked.
    #[error("panic: {0}")]
    Panic(String),

    /// An operator was configured with an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Any other defect.
    #[error("{0}")]
    Message(String),
}

impl Defect {
    /// Create a defect from a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Create an invalid argument defect.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Convert a panic payload into a defect, keeping its message when the
    /// payload is a string.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => (*message).to_string(),
                Err(_) => "non-string panic payload".to_string(),
            },
        };
        Self::Panic(message)
    }
}

/// The full story of why a stream, channel or fiber failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause<E> {
    /// An expected, typed failure.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// The computation was interrupted.
    Interrupt,
    /// The first cause happened, then the second (e.g. a finalizer failing
    /// after the body failed).
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Both causes happened concurrently.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Self::Fail(error)
    }

    /// A defect.
    pub fn die(defect: Defect) -> Self {
        Self::Die(defect)
    }

    /// An interruption.
    pub fn interrupt() -> Self {
        Self::Interrupt
    }

    /// Sequential composition: `self` happened, then `next`.
    pub fn then(self, next: Cause<E>) -> Self {
        Self::Then(Box::new(self), Box::new(next))
    }

    /// Parallel composition: `self` and `other` happened concurrently.
    pub fn both(self, other: Cause<E>) -> Self {
        Self::Both(Box::new(self), Box::new(other))
    }

    /// Transform every typed failure in the cause.
    pub fn map<E2, F>(self, mut f: F) -> Cause<E2>
    where
        F: FnMut(E) -> E2,
    {
        self.map_with(&mut f)
    }

    fn map_with<E2, F>(self, f: &mut F) -> Cause<E2>
    where
        F: FnMut(E) -> E2,
    {
        match self {
            Cause::Fail(error) => Cause::Fail(f(error)),
            Cause::Die(defect) => Cause::Die(defect),
            Cause::Interrupt => Cause::Interrupt,
            Cause::Then(left, right) => {
                Cause::Then(Box::new((*left).map_with(f)), Box::new((*right).map_with(f)))
            }
            Cause::Both(left, right) => {
                Cause::Both(Box::new((*left).map_with(f)), Box::new((*right).map_with(f)))
            }
        }
    }

    /// Every typed failure, left to right.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.visit(&mut |cause| {
            if let Cause::Fail(error) = cause {
                out.push(error);
            }
        });
        out
    }

    /// Every defect, left to right.
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.visit(&mut |cause| {
            if let Cause::Die(defect) = cause {
                out.push(defect);
            }
        });
        out
    }

    fn visit<'a, F>(&'a self, f: &mut F)
    where
        F: FnMut(&'a Cause<E>),
    {
        match self {
            Cause::Then(left, right) | Cause::Both(left, right) => {
                left.visit(f);
                right.visit(f);
            }
            leaf => f(leaf),
        }
    }

    /// Returns true if the cause contains a typed failure.
    pub fn is_failure(&self) -> bool {
        !self.failures().is_empty()
    }

    /// Returns true if the cause contains a defect.
    pub fn is_die(&self) -> bool {
        !self.defects().is_empty()
    }

    /// Returns true if the cause contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        let mut found = false;
        self.visit(&mut |cause| found |= matches!(cause, Cause::Interrupt));
        found
    }

    /// Returns true if the cause is made of interruptions only.
    pub fn is_interrupted_only(&self) -> bool {
        let mut only = true;
        self.visit(&mut |cause| only &= matches!(cause, Cause::Interrupt));
        only
    }

    /// Returns true if the cause contains the given defect.
    pub fn contains_defect(&self, defect: &Defect) -> bool {
        self.defects().into_iter().any(|d| d == defect)
    }

    /// Returns true if the cause carries the [`Defect::StreamTimeout`] sentinel.
    pub fn is_stream_timeout(&self) -> bool {
        self.contains_defect(&Defect::StreamTimeout)
    }

    /// The first typed failure, or the whole cause if there is none.
    pub fn failure_or_cause(self) -> std::result::Result<E, Cause<E>> {
        match self {
            Cause::Fail(error) => Ok(error),
            Cause::Then(left, right) => match (*left).failure_or_cause() {
                Ok(error) => Ok(error),
                Err(left) => match (*right).failure_or_cause() {
                    Ok(error) => Ok(error),
                    Err(right) => Err(Cause::Then(Box::new(left), Box::new(right))),
                },
            },
            Cause::Both(left, right) => match (*left).failure_or_cause() {
                Ok(error) => Ok(error),
                Err(left) => match (*right).failure_or_cause() {
                    Ok(error) => Ok(error),
                    Err(right) => Err(Cause::Both(Box::new(left), Box::new(right))),
                },
            },
            other => Err(other),
        }
    }

    /// Remove every typed failure, keeping defects and interruptions.
    ///
    /// Returns `None` when nothing remains. The result can be retyped to any
    /// error type since it holds no `E`.
    pub fn strip_failures<E2>(self) -> Option<Cause<E2>> {
        match self {
            Cause::Fail(_) => None,
            Cause::Die(defect) => Some(Cause::Die(defect)),
            Cause::Interrupt => Some(Cause::Interrupt),
            Cause::Then(left, right) => match ((*left).strip_failures(), (*right).strip_failures()) {
                (Some(left), Some(right)) => Some(left.then(right)),
                (left, right) => left.or(right),
            },
            Cause::Both(left, right) => match ((*left).strip_failures(), (*right).strip_failures()) {
                (Some(left), Some(right)) => Some(left.both(right)),
                (left, right) => left.or(right),
            },
        }
    }
}

impl<E> From<Defect> for Cause<E> {
    fn from(defect: Defect) -> Self {
        Cause::Die(defect)
    }
}

impl<E: fmt::Display> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Fail(error) => write!(f, "{error}"),
            Cause::Die(defect) => write!(f, "defect: {defect}"),
            Cause::Interrupt => write!(f, "interrupted"),
            Cause::Then(left, right) => write!(f, "{left}; then {right}"),
            Cause::Both(left, right) => write!(f, "({left} | {right})"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Cause<E> {}
