//! # Sluice
//!
//! A chunked, pull-driven streaming engine with explicit backpressure,
//! deterministic resource cleanup and cancellation.
//!
//! A [`Stream`] is a lazy description of a producer of [`Chunk`]s. Operators
//! rewrite the stream's underlying [`Channel`], and running the stream drives
//! that channel to completion on the current Tokio runtime, forking sibling
//! fibers for concurrent operators (merges, zips, broadcasts) that talk to
//! each other through [`Queue`]s and [`Handoff`]s.
//!
//! ## Features
//!
//! - **Chunked transfer**: every stage moves batches, not single elements
//! - **Backpressure**: a stage that does not pull stops its upstream
//! - **Structured failure**: [`Cause`] keeps typed failures, defects and
//!   interruptions apart and never drops either side of a combination
//! - **Scoped cleanup**: finalizers run exactly once, in reverse acquisition
//!   order, even when a stream is dropped mid-run
//! - **Stack safety**: recursive channels run on a trampolining executor
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sluice::prelude::*;
//!
//! let chunks = Stream::range(1, 10)
//!     .rechunk(3)
//!     .chunks()
//!     .run_collect()
//!     .await?;
//! // [[1, 2, 3], [4, 5, 6], [7, 8, 9], [10]]
//!
//! let merged = Stream::from_iter([1, 2])
//!     .merge_with(Stream::from_iter([10, 20, 30]), HaltStrategy::Left)
//!     .run_collect()
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cause;
pub mod channel;
pub mod chunk;
pub mod config;
pub mod error;
pub mod observability;
pub mod runtime;
pub mod schedule;
pub mod sink;
pub mod stream;
pub mod sync;
pub mod take;

/// Bound shared by every element, error and done type that flows through
/// the engine: values move between fibers, so they must be `Send` and own
/// their data.
pub trait Value: Send + 'static {}

impl<T: Send + 'static> Value for T {}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::cause::{Cause, Defect, Exit};
    pub use crate::channel::{Channel, MergeMapOptions, MergeStrategy};
    pub use crate::chunk::Chunk;
    pub use crate::config::StreamConfig;
    pub use crate::error::{Error, Result};
    pub use crate::schedule::Schedule;
    pub use crate::sink::Sink;
    pub use crate::stream::{
        Emitter, FlatMapOptions, HaltStrategy, Stream, ThrottleOptions, ThrottleStrategy,
    };
    pub use crate::sync::{Handoff, OverflowStrategy, PubSub, Queue};
    pub use crate::take::Take;
}

pub use cause::{Cause, Defect, Exit};
pub use channel::Channel;
pub use chunk::Chunk;
pub use error::{Error, Result};
pub use sink::Sink;
pub use stream::Stream;
pub use take::Take;
