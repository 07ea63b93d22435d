//! Bridging callback-based producers into streams.
//!
//! The producer gets an [`Emitter`] backed by a bounded `kanal` channel. A
//! full channel makes `single`/`chunk` wait, which is how backpressure
//! reaches the producer; `try_single` reports it instead.

use std::future::Future;

use futures::future::BoxFuture;
use tracing::debug;

use super::Stream;
use crate::Value;
use crate::cause::Cause;
use crate::channel::{Process, Signal};
use crate::chunk::Chunk;
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::take::Take;

/// The producer side of [`Stream::async_push`].
///
/// Every method fails with [`Error::Shutdown`] once the stream has gone
/// away. Dropping every emitter ends the stream.
pub struct Emitter<A, E> {
    sender: kanal::Sender<Take<A, E>>,
}

impl<A, E> Clone for Emitter<A, E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<A: Value, E: Value> Emitter<A, E> {
    async fn send(&self, take: Take<A, E>) -> Result<()> {
        self.sender.as_async().send(take).await.map_err(|_| Error::Shutdown)
    }

    /// Emit one element, waiting for room.
    pub async fn single(&self, elem: A) -> Result<()> {
        self.send(Take::single(elem)).await
    }

    /// Emit a chunk, waiting for room. Empty chunks are skipped.
    pub async fn chunk(&self, chunk: Chunk<A>) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.send(Take::chunk(chunk)).await
    }

    /// Fail the stream.
    pub async fn fail(&self, error: E) -> Result<()> {
        self.send(Take::fail(error)).await
    }

    /// Fail the stream with a full cause.
    pub async fn fail_cause(&self, cause: Cause<E>) -> Result<()> {
        self.send(Take::fail_cause(cause)).await
    }

    /// End the stream.
    pub async fn end(&self) -> Result<()> {
        self.send(Take::end()).await
    }

    /// Emit one element if there is room. Returns false when the channel is
    /// full.
    pub fn try_single(&self, elem: A) -> Result<bool> {
        self.sender.try_send(Take::single(elem)).map_err(|_| Error::Shutdown)
    }

    /// Emit one element, blocking the current thread until there is room.
    /// For producers running outside the async runtime.
    pub fn blocking_single(&self, elem: A) -> Result<()> {
        self.sender.send(Take::single(elem)).map_err(|_| Error::Shutdown)
    }

    /// Returns true once the stream has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl<A: Value, E: Value> Stream<A, E> {
    /// A stream fed by `register`, which gets an [`Emitter`] when the stream
    /// starts. `capacity` chunks may wait in the channel.
    pub fn async_push<F>(register: F, capacity: usize) -> Self
    where
        F: FnOnce(Emitter<A, E>) + Send + 'static,
    {
        Self::async_scoped(
            move |emitter| {
                register(emitter);
                async {}
            },
            capacity,
        )
    }

    /// Like [`Stream::async_push`] with `config.push_capacity` chunks of
    /// room.
    pub fn async_push_with_config<F>(register: F, config: &StreamConfig) -> Self
    where
        F: FnOnce(Emitter<A, E>) + Send + 'static,
    {
        Self::async_push(register, config.push_capacity)
    }

    /// Like [`Stream::async_push`], with `register` returning a cleanup that
    /// runs when the stream exits.
    pub fn async_scoped<F, Fut>(register: F, capacity: usize) -> Self
    where
        F: FnOnce(Emitter<A, E>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::suspend(move || {
            let (sender, receiver) = kanal::bounded(capacity.max(1));
            let cleanup = register(Emitter { sender });
            Stream::from_process(move |_| PushReceiver {
                receiver: receiver.to_async(),
            })
            .ensuring(cleanup)
        })
    }
}

struct PushReceiver<A, E> {
    receiver: kanal::AsyncReceiver<Take<A, E>>,
}

impl<A: Value, E: Value> Process<Chunk<A>, E, ()> for PushReceiver<A, E> {
    fn step(&mut self) -> BoxFuture<'_, Signal<Chunk<A>, E, ()>> {
        Box::pin(async move {
            match self.receiver.recv().await {
                Ok(Take::Chunk(chunk)) => Signal::Emit(chunk),
                Ok(Take::End) => Signal::Done(()),
                Ok(Take::Fail(cause)) => Signal::Halt(cause),
                Err(_) => {
                    debug!("push stream: every emitter dropped");
                    Signal::Done(())
                }
            }
        })
    }
}

impl<A, E> Drop for PushReceiver<A, E> {
    fn drop(&mut self) {
        self.receiver.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_async_push_from_task() {
        let stream = Stream::<i32, &str>::async_push(
            |emitter| {
                tokio::spawn(async move {
                    for n in 1..=5 {
                        emitter.single(n).await?;
                    }
                    emitter.chunk(Chunk::of([6, 7])).await?;
                    emitter.end().await
                });
            },
            2,
        );
        assert_eq!(stream.run_collect().await, Ok(vec![1, 2, 3, 4, 5, 6, 7]));
    }

    #[tokio::test]
    async fn test_async_push_failure() {
        let stream = Stream::<i32, &str>::async_push(
            |emitter| {
                tokio::spawn(async move {
                    emitter.single(1).await?;
                    emitter.fail("producer broke").await
                });
            },
            16,
        );
        assert_eq!(stream.run_collect().await, Err(Cause::fail("producer broke")));
    }

    #[tokio::test]
    async fn test_dropping_every_emitter_ends_stream() {
        let stream = Stream::<i32>::async_push(
            |emitter| {
                tokio::spawn(async move {
                    let _ = emitter.single(9).await;
                });
            },
            16,
        );
        assert_eq!(stream.run_collect().await, Ok(vec![9]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_producer_and_try_single() {
        let stream = Stream::<u32>::async_push(
            |emitter| {
                std::thread::spawn(move || {
                    for n in 0..100 {
                        if emitter.blocking_single(n).is_err() {
                            return;
                        }
                    }
                });
            },
            1,
        );
        assert_eq!(stream.run_count().await, Ok(100));

        let (sender, _receiver) = kanal::bounded(1);
        let emitter: Emitter<u32, ()> = Emitter { sender };
        assert_eq!(emitter.try_single(1), Ok(true));
        assert_eq!(emitter.try_single(2), Ok(false));
    }

    #[tokio::test]
    async fn test_async_scoped_runs_cleanup_and_closes_emitter() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let stream = Stream::<u64>::async_scoped(
            move |emitter| {
                tokio::spawn(async move {
                    let mut n = 0;
                    while emitter.single(n).await.is_ok() {
                        n += 1;
                    }
                    let _ = tx.send(emitter.is_closed());
                });
                async move { flag.store(true, Ordering::SeqCst) }
            },
            4,
        );
        let out = stream.take(3).run_collect().await;
        assert_eq!(out, Ok(vec![0, 1, 2]));
        assert!(cleaned.load(Ordering::SeqCst));
        assert_eq!(rx.await, Ok(true));
    }
}
