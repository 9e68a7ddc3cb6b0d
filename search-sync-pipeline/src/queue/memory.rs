//! In-memory queue broker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use search_sync_shared::ChangeEvent;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::broker::{BrokerMessage, QueueBroker, Receipt};
use crate::errors::QueueError;

#[derive(Debug)]
struct Stored {
    event: ChangeEvent,
    visible_at: Instant,
    /// Receipt of the current delivery, if the message is leased out.
    lease: Option<String>,
    deliveries: u64,
}

/// A dead-lettered event with the reason it was parked.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: ChangeEvent,
    pub reason: String,
}

#[derive(Debug, Default)]
struct Inner {
    messages: BTreeMap<u64, Stored>,
    next_seq: u64,
    dead_letters: Vec<DeadLetter>,
}

/// Broker holding messages in process memory.
///
/// Redelivery follows the visibility timeout model: a received message that
/// is neither acked nor nacked becomes visible again once its timeout passes,
/// with `attempt_count` incremented. Time is read from `tokio::time`, so
/// paused-clock tests control redelivery.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    inner: Mutex<Inner>,
    unreachable: AtomicBool,
    failing_sends: AtomicU32,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail the next `count` sends with a transient broker error.
    pub fn fail_next_sends(&self, count: u32) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Messages not yet acked, leased ones included.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Messages currently leased to a consumer.
    pub async fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .await
            .messages
            .values()
            .filter(|m| m.lease.is_some() && m.visible_at > now)
            .count()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().await.dead_letters.clone()
    }

    fn check_reachable(&self) -> Result<(), QueueError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(QueueError::connection("in-memory broker marked unreachable"));
        }
        Ok(())
    }

    async fn hand_back(&self, receipt: &Receipt, delay: Duration, failed: bool) -> Result<(), QueueError> {
        self.check_reachable()?;
        let seq = Self::parse_receipt(receipt)?;
        let mut inner = self.inner.lock().await;
        match inner.messages.get_mut(&seq) {
            Some(stored) if stored.lease.as_deref() == Some(receipt.0.as_str()) => {
                stored.lease = None;
                if failed {
                    stored.event.attempt_count += 1;
                }
                stored.visible_at = Instant::now() + delay;
                Ok(())
            }
            _ => Err(QueueError::UnknownReceipt(receipt.0.clone())),
        }
    }

    fn parse_receipt(receipt: &Receipt) -> Result<u64, QueueError> {
        receipt
            .0
            .split_once('.')
            .and_then(|(seq, _)| seq.parse().ok())
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.0.clone()))
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    async fn send(&self, event: &ChangeEvent) -> Result<(), QueueError> {
        self.check_reachable()?;
        let failed = self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(QueueError::broker("injected send failure"));
        }

        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.messages.insert(
            seq,
            Stored {
                event: event.clone(),
                visible_at: Instant::now(),
                lease: None,
                deliveries: 0,
            },
        );
        Ok(())
    }

    async fn receive(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<BrokerMessage>, QueueError> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let mut received = Vec::new();
        for (seq, stored) in inner.messages.iter_mut() {
            if received.len() >= max {
                break;
            }
            if stored.visible_at > now {
                continue;
            }
            // A lease that ran out is a failed delivery.
            if stored.lease.take().is_some() {
                stored.event.attempt_count += 1;
            }
            stored.deliveries += 1;
            let receipt = format!("{}.{}", seq, stored.deliveries);
            stored.lease = Some(receipt.clone());
            stored.visible_at = now + visibility_timeout;
            received.push(BrokerMessage {
                event: stored.event.clone(),
                receipt: Receipt(receipt),
            });
        }
        Ok(received)
    }

    async fn ack(&self, receipt: &Receipt) -> Result<(), QueueError> {
        self.check_reachable()?;
        let seq = Self::parse_receipt(receipt)?;
        let mut inner = self.inner.lock().await;
        let owned = inner
            .messages
            .get(&seq)
            .is_some_and(|stored| stored.lease.as_deref() == Some(receipt.0.as_str()));
        if !owned {
            return Err(QueueError::UnknownReceipt(receipt.0.clone()));
        }
        inner.messages.remove(&seq);
        Ok(())
    }

    async fn nack(&self, receipt: &Receipt, delay: Duration) -> Result<(), QueueError> {
        self.hand_back(receipt, delay, true).await
    }

    async fn release(&self, receipt: &Receipt, delay: Duration) -> Result<(), QueueError> {
        self.hand_back(receipt, delay, false).await
    }

    async fn dead_letter(&self, event: &ChangeEvent, reason: &str) -> Result<(), QueueError> {
        self.check_reachable()?;
        self.inner.lock().await.dead_letters.push(DeadLetter {
            event: event.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn ping(&self) -> Result<bool, QueueError> {
        Ok(!self.unreachable.load(Ordering::SeqCst))
    }
}
