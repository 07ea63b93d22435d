//! Single-slot synchronous rendezvous.

use std::sync::{Arc, Mutex};

use super::{Latch, lock};

enum Slot<T> {
    Empty { filled: Latch },
    Full { value: T, taken: Latch },
}

/// A single-slot rendezvous between one producer and one consumer.
///
/// [`Handoff::offer`] deposits a value and waits until the consumer has taken
/// it; [`Handoff::take`] waits for a value. Each transfer uses a fresh pair of
/// latches, so a cycle is complete only when both sides have met. The
/// discipline is one offer and one take in flight at a time; concurrent
/// offers are served in no particular order.
pub struct Handoff<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Clone for Handoff<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Default for Handoff<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Handoff<T> {
    /// Create an empty handoff.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Empty {
                filled: Latch::new(),
            })),
        }
    }

    /// Deposit `value` and wait until it has been taken.
    ///
    /// If the offer is cancelled after the value was deposited, the value
    /// stays in the slot for the consumer.
    pub async fn offer(&self, value: T) {
        let taken = loop {
            let busy = {
                let mut slot = lock(&self.slot);
                match &*slot {
                    Slot::Full { taken, .. } => taken.clone(),
                    Slot::Empty { filled } => {
                        let filled = filled.clone();
                        let taken = Latch::new();
                        *slot = Slot::Full {
                            value,
                            taken: taken.clone(),
                        };
                        filled.open();
                        break taken;
                    }
                }
            };
            busy.wait().await;
        };
        taken.wait().await;
    }

    /// Wait for a value and remove it from the slot.
    ///
    /// Cancel-safe: the value is removed in the same step that observes it.
    pub async fn take(&self) -> T {
        loop {
            let filled = match self.try_take() {
                Ok(value) => return value,
                Err(filled) => filled,
            };
            filled.wait().await;
        }
    }

    /// Take the value if one is waiting.
    pub fn poll(&self) -> Option<T> {
        self.try_take().ok()
    }

    fn try_take(&self) -> Result<T, Latch> {
        let mut slot = lock(&self.slot);
        if let Slot::Empty { filled } = &*slot {
            return Err(filled.clone());
        }
        let previous = std::mem::replace(
            &mut *slot,
            Slot::Empty {
                filled: Latch::new(),
            },
        );
        match previous {
            Slot::Full { value, taken } => {
                taken.open();
                Ok(value)
            }
            Slot::Empty { filled } => Err(filled),
        }
    }

    /// Returns true if a value is waiting to be taken.
    pub fn is_full(&self) -> bool {
        matches!(&*lock(&self.slot), Slot::Full { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_offer_waits_for_take() {
        let handoff = Handoff::new();
        let producer = {
            let handoff = handoff.clone();
            tokio::spawn(async move {
                handoff.offer(1).await;
                handoff.offer(2).await;
            })
        };
        assert_eq!(handoff.take().await, 1);
        assert_eq!(handoff.take().await, 2);
        producer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_blocks_until_taken() {
        let handoff = Handoff::new();
        let producer = {
            let handoff = handoff.clone();
            tokio::spawn(async move { handoff.offer("value").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handoff.is_full());
        assert!(!producer.is_finished());

        assert_eq!(handoff.poll(), Some("value"));
        producer.await.unwrap();
        assert!(!handoff.is_full());
    }

    #[tokio::test]
    async fn test_poll_empty() {
        let handoff: Handoff<u8> = Handoff::new();
        assert_eq!(handoff.poll(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_take_loses_nothing() {
        let handoff = Handoff::new();
        let pending = tokio::time::timeout(Duration::from_millis(10), handoff.take()).await;
        assert!(pending.is_err());

        let producer = {
            let handoff = handoff.clone();
            tokio::spawn(async move { handoff.offer(9).await })
        };
        assert_eq!(handoff.take().await, 9);
        producer.await.unwrap();
    }
}
