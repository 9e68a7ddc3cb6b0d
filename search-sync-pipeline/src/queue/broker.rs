//! Durable queue broker trait definition.

use std::time::Duration;

use async_trait::async_trait;
use search_sync_shared::ChangeEvent;

use crate::errors::QueueError;

/// Opaque handle identifying one delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(pub String);

impl std::fmt::Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed out by the broker, hidden from other consumers until it
/// is acked, nacked, or its visibility timeout expires.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub event: ChangeEvent,
    pub receipt: Receipt,
}

/// At-least-once broker with visibility-timeout redelivery.
///
/// `attempt_count` on received events reflects the failed deliveries the
/// broker has observed (nacks and expired visibility timeouts). Releases are
/// not counted.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Append an event. Must be safe to call concurrently.
    async fn send(&self, event: &ChangeEvent) -> Result<(), QueueError>;

    /// Receive up to `max` visible messages, hiding them for
    /// `visibility_timeout`. Returns an empty vec when nothing is visible.
    async fn receive(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<BrokerMessage>, QueueError>;

    /// Remove a delivered message for good.
    async fn ack(&self, receipt: &Receipt) -> Result<(), QueueError>;

    /// Give a delivered message back, visible again after `delay`.
    async fn nack(&self, receipt: &Receipt, delay: Duration) -> Result<(), QueueError>;

    /// Give a delivered message back without counting a failed delivery,
    /// visible again after `delay`. For when the consumer, not the message,
    /// is at fault.
    async fn release(&self, receipt: &Receipt, delay: Duration) -> Result<(), QueueError>;

    /// Park an event on the dead-letter channel.
    async fn dead_letter(&self, event: &ChangeEvent, reason: &str) -> Result<(), QueueError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<bool, QueueError>;
}
