//! Change event queue.
//!
//! At-least-once delivery of [`ChangeEvent`]s between producers and the
//! indexer, on top of a pluggable [`QueueBroker`].

mod broker;
mod kafka;
mod memory;
mod offsets;

pub use broker::{BrokerMessage, QueueBroker, Receipt};
pub use kafka::{KafkaBroker, KafkaBrokerConfig};
pub use memory::{DeadLetter, InMemoryBroker};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use search_sync_shared::ChangeEvent;
use tokio::sync::watch;
use tracing::{debug, error, instrument, warn};

use crate::errors::QueueError;
use crate::retry::{retry, Backoff};

/// Configuration for the change event queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Delivery attempts (and publish attempts) before an event is dead-lettered.
    pub max_attempts: u32,
    /// How long a received message stays hidden before redelivery.
    pub visibility_timeout: Duration,
    /// Maximum messages requested per broker receive.
    pub receive_batch: usize,
    /// Pause between receives when the queue is empty.
    pub poll_interval: Duration,
    /// Retry schedule for transient broker errors.
    pub backoff: Backoff,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            visibility_timeout: Duration::from_secs(30),
            receive_batch: 100,
            poll_interval: Duration::from_millis(250),
            backoff: Backoff::default(),
        }
    }
}

/// Result of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishAck {
    /// The broker accepted the event.
    Enqueued,
    /// The broker kept failing and the event went to the dead-letter channel.
    DeadLettered,
}

/// Acknowledgement handle of a single delivery.
///
/// Dropping the handle without acking leaves the message to be redelivered
/// once its visibility timeout expires.
pub struct AckHandle {
    broker: Arc<dyn QueueBroker>,
    receipt: Receipt,
}

impl AckHandle {
    pub fn receipt(&self) -> &Receipt {
        &self.receipt
    }

    /// Remove the message from the queue.
    pub async fn ack(self) -> Result<(), QueueError> {
        self.broker.ack(&self.receipt).await
    }

    /// Hand the message back for redelivery after `delay`.
    pub async fn nack(self, delay: Duration) -> Result<(), QueueError> {
        self.broker.nack(&self.receipt, delay).await
    }

    /// Hand the message back after `delay` without spending a delivery attempt.
    pub async fn release(self, delay: Duration) -> Result<(), QueueError> {
        self.broker.release(&self.receipt, delay).await
    }

    /// Park the event on the dead-letter channel and remove it from the queue.
    pub async fn dead_letter(self, event: &ChangeEvent, reason: &str) -> Result<(), QueueError> {
        self.broker.dead_letter(event, reason).await?;
        self.broker.ack(&self.receipt).await
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle")
            .field("receipt", &self.receipt)
            .finish()
    }
}

/// One delivered event and its acknowledgement handle.
#[derive(Debug)]
pub struct Delivery {
    pub event: ChangeEvent,
    pub handle: AckHandle,
}

/// Queue of change events.
///
/// Cheap to share: publishing takes `&self` and is safe from many producers.
pub struct ChangeEventQueue {
    broker: Arc<dyn QueueBroker>,
    config: QueueConfig,
}

impl ChangeEventQueue {
    pub fn new(broker: Arc<dyn QueueBroker>, config: QueueConfig) -> Self {
        Self { broker, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue an event.
    ///
    /// Transient broker errors are retried with backoff. Once retries are
    /// exhausted the event is dead-lettered and [`PublishAck::DeadLettered`]
    /// is returned; an error is only returned if the dead-letter write fails
    /// too, or the failure was not transient.
    #[instrument(skip(self, event), fields(entity_id = %event.entity_id, version = event.source_version))]
    pub async fn publish(&self, event: ChangeEvent) -> Result<PublishAck, QueueError> {
        let result = retry(
            "queue_publish",
            &self.config.backoff,
            self.config.max_attempts,
            QueueError::is_retryable,
            || self.broker.send(&event),
        )
        .await;

        match result {
            Ok(()) => Ok(PublishAck::Enqueued),
            Err(e) if e.is_retryable() => {
                warn!(
                    entity_id = %event.entity_id,
                    event_id = %event.event_id,
                    error = %e,
                    "Publish retries exhausted, dead-lettering event"
                );
                self.broker
                    .dead_letter(&event, &format!("publish failed: {}", e))
                    .await?;
                Ok(PublishAck::DeadLettered)
            }
            Err(e) => Err(e),
        }
    }

    /// Liveness probe of the underlying broker.
    pub async fn test_connection(&self) -> Result<bool, QueueError> {
        self.broker.ping().await
    }

    /// Consume deliveries until `shutdown` turns true.
    ///
    /// The stream suspends while the queue is empty and ends once shutdown is
    /// signalled. Receive errors are yielded after a backoff pause so the
    /// consumer can record them; the stream keeps going afterwards. Events
    /// that already failed `max_attempts` deliveries are dead-lettered here
    /// and never yielded.
    pub fn consume(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> impl Stream<Item = Result<Delivery, QueueError>> + Send + 'static {
        let state = ConsumeState {
            broker: self.broker.clone(),
            config: self.config.clone(),
            shutdown,
            buffered: VecDeque::new(),
            consecutive_errors: 0,
        };

        stream::unfold(state, |mut state| async move {
            let item = state.next().await?;
            Some((item, state))
        })
    }
}

struct ConsumeState {
    broker: Arc<dyn QueueBroker>,
    config: QueueConfig,
    shutdown: watch::Receiver<bool>,
    buffered: VecDeque<Delivery>,
    consecutive_errors: u32,
}

impl ConsumeState {
    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `delay` unless shutdown arrives first. Returns false on shutdown.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_shutdown(),
            changed = self.shutdown.changed() => changed.is_ok() && !self.is_shutdown(),
        }
    }

    async fn next(&mut self) -> Option<Result<Delivery, QueueError>> {
        loop {
            if self.is_shutdown() {
                return None;
            }
            if let Some(delivery) = self.buffered.pop_front() {
                return Some(Ok(delivery));
            }

            let received = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    continue;
                }
                received = self.broker.receive(self.config.receive_batch, self.config.visibility_timeout) => received,
            };

            match received {
                Ok(messages) if messages.is_empty() => {
                    self.consecutive_errors = 0;
                    if !self.pause(self.config.poll_interval).await {
                        return None;
                    }
                }
                Ok(messages) => {
                    self.consecutive_errors = 0;
                    for message in messages {
                        if let Some(delivery) = self.admit(message).await {
                            self.buffered.push_back(delivery);
                        }
                    }
                }
                Err(e) => {
                    let delay = self.config.backoff.delay(self.consecutive_errors);
                    self.consecutive_errors = self.consecutive_errors.saturating_add(1);
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "Queue receive failed");
                    if !self.pause(delay).await {
                        return None;
                    }
                    return Some(Err(e));
                }
            }
        }
    }

    /// Dead-letter deliveries that ran out of attempts, pass the rest through.
    async fn admit(&self, message: BrokerMessage) -> Option<Delivery> {
        let handle = AckHandle {
            broker: self.broker.clone(),
            receipt: message.receipt,
        };

        if message.event.attempt_count >= self.config.max_attempts {
            warn!(
                entity_id = %message.event.entity_id,
                event_id = %message.event.event_id,
                attempts = message.event.attempt_count,
                "Delivery attempts exhausted, dead-lettering event"
            );
            let reason = format!("delivery failed {} times", message.event.attempt_count);
            if let Err(e) = handle.dead_letter(&message.event, &reason).await {
                error!(event_id = %message.event.event_id, error = %e, "Failed to dead-letter event");
            }
            return None;
        }

        debug!(entity_id = %message.event.entity_id, attempt = message.event.attempt_count, "Delivering event");
        Some(Delivery {
            event: message.event,
            handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn queue_with(broker: Arc<InMemoryBroker>, config: QueueConfig) -> ChangeEventQueue {
        ChangeEventQueue::new(broker, config)
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            max_attempts: 3,
            visibility_timeout: Duration::from_secs(5),
            receive_batch: 10,
            poll_interval: Duration::from_millis(10),
            backoff: Backoff::constant(Duration::from_millis(10)),
        }
    }

    fn event(id: &str, version: u64) -> ChangeEvent {
        ChangeEvent::upsert("listing", id, json!({"title": id}), version)
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_retries_transient_failures() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.fail_next_sends(2);
        let queue = queue_with(broker.clone(), fast_config());

        let ack = queue.publish(event("L1", 1)).await.unwrap();

        assert_eq!(ack, PublishAck::Enqueued);
        assert_eq!(broker.len().await, 1);
        assert!(broker.dead_letters().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_dead_letters_after_exhaustion() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.fail_next_sends(10);
        let queue = queue_with(broker.clone(), fast_config());

        let ack = queue.publish(event("L1", 1)).await.unwrap();

        assert_eq!(ack, PublishAck::DeadLettered);
        assert!(broker.is_empty().await);
        let dead = broker.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.starts_with("publish failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_redelivers_unacked() {
        let broker = Arc::new(InMemoryBroker::new());
        let queue = queue_with(broker.clone(), fast_config());
        queue.publish(event("L1", 1)).await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let mut deliveries = Box::pin(queue.consume(rx));

        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.event.attempt_count, 0);
        drop(first);

        // Not acked: comes back after the visibility timeout.
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.event.attempt_count, 1);
        second.handle.ack().await.unwrap();
        assert!(broker.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_dead_letters_exhausted_events() {
        let broker = Arc::new(InMemoryBroker::new());
        let queue = queue_with(broker.clone(), fast_config());
        queue.publish(event("L1", 1)).await.unwrap();
        queue.publish(event("L2", 1)).await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let mut deliveries = Box::pin(queue.consume(rx));

        let mut seen_l2 = false;
        while let Ok(Some(Ok(delivery))) =
            tokio::time::timeout(Duration::from_secs(1), deliveries.next()).await
        {
            if delivery.event.entity_id == "L1" {
                delivery.handle.nack(Duration::ZERO).await.unwrap();
            } else {
                seen_l2 = true;
                delivery.handle.ack().await.unwrap();
            }
        }

        assert!(seen_l2);
        let dead = broker.dead_letters().await;
        assert_eq!(dead[0].event.entity_id, "L1");
        assert_eq!(dead[0].event.attempt_count, 3);
        assert!(broker.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_ends_on_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let queue = queue_with(broker, fast_config());

        let (tx, rx) = watch::channel(false);
        let mut deliveries = Box::pin(queue.consume(rx));

        let waiter = tokio::spawn(async move { deliveries.next().await.is_none() });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_surfaces_receive_errors() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_unreachable(true);
        let queue = queue_with(broker.clone(), fast_config());

        let (_tx, rx) = watch::channel(false);
        let mut deliveries = Box::pin(queue.consume(rx));

        let item = deliveries.next().await.unwrap();
        assert!(matches!(item, Err(QueueError::ConnectionError(_))));
    }
}
