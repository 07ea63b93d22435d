//! Top-level driving of a channel that reads nothing.

use super::Channel;
use super::process::{Executor, Input, Step};
use crate::Value;
use crate::cause::{Cause, Exit};
use crate::runtime::Scope;

/// Owns the executor and scope of one run.
///
/// After every step the driver runs finalizers that abandoned processes
/// queued on the scope, so cleanup is never postponed past the next element.
pub(crate) struct Driver<O, E, D> {
    // Declared first: dropped before the scope so its deferrals land there.
    executor: Executor<O, E, D>,
    scope: Scope,
}

impl<O: Value, E: Value, D: Value> Driver<O, E, D> {
    pub(crate) fn new(channel: Channel<O, E, D>) -> Self {
        Self::with_scope(channel, Scope::new())
    }

    pub(crate) fn with_scope(channel: Channel<O, E, D>, scope: Scope) -> Self {
        let executor = channel.start(Input::empty(), scope.clone());
        Self { executor, scope }
    }

    pub(crate) fn scope(&self) -> &Scope {
        &self.scope
    }

    pub(crate) async fn next(&mut self) -> Step<O, E, D> {
        let step = self.executor.next().await;
        match self.scope.run_deferred().await {
            None => step,
            Some(defect) => match step {
                Step::Halt(cause) => Step::Halt(cause.then(Cause::die(defect))),
                _ => Step::Halt(Cause::die(defect)),
            },
        }
    }

    /// Interrupt whatever is still running, close the scope and fold any
    /// finalizer defect into `exit`.
    pub(crate) async fn finish<A>(self, exit: Exit<A, E>) -> Exit<A, E> {
        let Driver { executor, scope } = self;
        drop(executor);
        match scope.close().await {
            None => exit,
            Some(defect) => match exit {
                Ok(_) => Err(Cause::die(defect)),
                Err(cause) => Err(cause.then(Cause::die(defect))),
            },
        }
    }
}
