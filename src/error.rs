//! Error types for Sluice.
//!
//! Two families of errors exist:
//!
//! - [`Error`] is returned by the coordination primitives (queues, pubsubs,
//!   push emitters) when they are used after shutdown or with bad arguments.
//! - [`Cause`](crate::cause::Cause) is the structured failure a stream halts
//!   with. It lives in its own module because it is generic over the stream's
//!   typed error.

use thiserror::Error;

/// Result type alias using Sluice's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Sluice primitive operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The queue, pubsub or push channel has been shut down.
    #[error("shut down: no further offers or takes are accepted")]
    Shutdown,

    /// An argument was outside its accepted range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The fiber running the operation was interrupted.
    #[error("interrupted")]
    Interrupted,
}

impl Error {
    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Returns true if this error reports a shutdown.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::invalid_argument("size must be positive").to_string(),
            "invalid argument: size must be positive"
        );
        assert!(Error::Shutdown.is_shutdown());
        assert!(!Error::Interrupted.is_shutdown());
    }
}
