//! Kafka-backed queue broker.
//!
//! Events are JSON-encoded and keyed by document id, so all events for one
//! record land on the same partition. Acks are manual offset commits.
//!
//! Kafka has no per-message visibility timeout: an uncommitted message is
//! redelivered when the group rebalances, which happens once a consumer
//! exceeds `max.poll.interval.ms`. The broker therefore sets that interval
//! from the configured visibility timeout.
//!
//! A nack republishes the event with `attempt_count + 1` once its delay has
//! passed; a release republishes it unchanged. Commits are cumulative, so a
//! partition only commits past an offset once every earlier offset received
//! from it is settled. A redelivery still waiting for its delay when the
//! process exits leaves its offset uncommitted and is consumed again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::{Header, Message, OwnedHeaders},
    producer::{FutureProducer, FutureRecord, Producer},
    Offset, TopicPartitionList,
};
use search_sync_shared::ChangeEvent;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::broker::{BrokerMessage, QueueBroker, Receipt};
use super::offsets::OffsetTracker;
use crate::errors::QueueError;

/// How long `receive` waits for the first message.
const RECEIVE_WAIT: Duration = Duration::from_secs(1);

/// How long `receive` waits for each further message of a batch.
const DRAIN_WAIT: Duration = Duration::from_millis(20);

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct InFlight {
    event: ChangeEvent,
    partition: i32,
    offset: i64,
}

/// Settings for [`KafkaBroker`].
#[derive(Debug, Clone)]
pub struct KafkaBrokerConfig {
    /// Comma-separated bootstrap servers.
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
    /// Maps onto `max.poll.interval.ms`.
    pub visibility_timeout: Duration,
}

impl KafkaBrokerConfig {
    /// Topic receiving dead-lettered events.
    pub fn dead_letter_topic(&self) -> String {
        format!("{}.dlq", self.topic)
    }
}

/// Clients and commit state shared with delayed redeliveries.
struct Shared {
    producer: FutureProducer,
    consumer: StreamConsumer,
    topic: String,
    dead_letter_topic: String,
    offsets: StdMutex<OffsetTracker>,
}

impl Shared {
    async fn produce(&self, topic: &str, key: &str, payload: &[u8], kind: &str) -> Result<(), QueueError> {
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(OwnedHeaders::new().insert(Header {
                key: "event-kind",
                value: Some(kind),
            }));

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| QueueError::from(e))
    }

    fn track(&self, partition: i32, offset: i64) {
        self.offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .track(partition, offset);
    }

    /// Settle an offset and commit the partition if its settled prefix grew.
    fn settle(&self, partition: i32, offset: i64) -> Result<(), QueueError> {
        // Held through the commit so positions reach the consumer in order.
        let mut offsets = self.offsets.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(position) = offsets.settle(partition, offset) else {
            debug!(
                partition = partition,
                offset = offset,
                outstanding = offsets.outstanding(partition),
                "Commit waits for earlier offsets"
            );
            return Ok(());
        };
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, partition, Offset::Offset(position))?;
        self.consumer.commit(&tpl, CommitMode::Async)?;
        debug!(partition = partition, position = position, "Committed offset");
        Ok(())
    }

    /// Put the event back on the topic, then settle the original offset.
    async fn republish(&self, entry: InFlight, attempt_count: u32) -> Result<(), QueueError> {
        let mut event = entry.event;
        event.attempt_count = attempt_count;

        let payload = serde_json::to_vec(&event)?;
        let kind = event.operation.to_string();
        self.produce(&self.topic, &event.key().document_id(), &payload, &kind)
            .await?;
        self.settle(entry.partition, entry.offset)
    }
}

/// Queue broker on top of a Kafka topic.
pub struct KafkaBroker {
    shared: Arc<Shared>,
    in_flight: Mutex<HashMap<Receipt, InFlight>>,
}

impl KafkaBroker {
    /// Create the producer and consumer and subscribe to the topic.
    ///
    /// # Returns
    ///
    /// * `Ok(KafkaBroker)` - A connected broker
    /// * `Err(QueueError)` - If either client cannot be created
    pub fn new(config: &KafkaBrokerConfig) -> Result<Self, QueueError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("compression.type", "zstd")
            .set("message.timeout.ms", "5000")
            .set("enable.idempotence", "true")
            .create()?;

        // librdkafka requires max.poll.interval.ms >= session.timeout.ms.
        let max_poll_interval = config.visibility_timeout.as_millis().max(6000);
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .set("max.poll.interval.ms", max_poll_interval.to_string())
            .create()?;

        consumer.subscribe(&[config.topic.as_str()])?;

        info!(
            brokers = %config.brokers,
            group_id = %config.group_id,
            topic = %config.topic,
            "Created Kafka broker"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                producer,
                consumer,
                topic: config.topic.clone(),
                dead_letter_topic: config.dead_letter_topic(),
                offsets: StdMutex::new(OffsetTracker::default()),
            }),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    async fn take_in_flight(&self, receipt: &Receipt) -> Result<InFlight, QueueError> {
        self.in_flight
            .lock()
            .await
            .remove(receipt)
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.0.clone()))
    }

    /// Republish a delivered event after `delay`. The original offset stays
    /// uncommitted until the copy is on the topic.
    async fn hand_back(&self, receipt: &Receipt, delay: Duration, failed: bool) -> Result<(), QueueError> {
        let entry = self.take_in_flight(receipt).await?;
        let attempt_count = entry.event.attempt_count + u32::from(failed);

        if delay.is_zero() {
            return self.shared.republish(entry, attempt_count).await;
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let (partition, offset) = (entry.partition, entry.offset);
            if let Err(e) = shared.republish(entry, attempt_count).await {
                warn!(
                    partition = partition,
                    offset = offset,
                    error = %e,
                    "Delayed redelivery failed, offset left uncommitted"
                );
            }
        });
        Ok(())
    }
}

fn decode_payload(payload: Option<&[u8]>) -> Option<ChangeEvent> {
    serde_json::from_slice(payload?).ok()
}

#[async_trait]
impl QueueBroker for KafkaBroker {
    #[instrument(skip(self, event), fields(entity_id = %event.entity_id))]
    async fn send(&self, event: &ChangeEvent) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(event)?;
        let kind = event.operation.to_string();
        self.shared
            .produce(&self.shared.topic, &event.key().document_id(), &payload, &kind)
            .await
    }

    async fn receive(
        &self,
        max: usize,
        _visibility_timeout: Duration,
    ) -> Result<Vec<BrokerMessage>, QueueError> {
        let mut received: Vec<(Receipt, InFlight)> = Vec::new();

        while received.len() < max {
            let wait = if received.is_empty() { RECEIVE_WAIT } else { DRAIN_WAIT };
            let (partition, offset, decoded) = match timeout(wait, self.shared.consumer.recv()).await {
                Err(_) => break,
                Ok(Err(e)) if received.is_empty() => return Err(e.into()),
                Ok(Err(e)) => {
                    warn!(error = %e, "Kafka error while draining a batch");
                    break;
                }
                Ok(Ok(msg)) => (msg.partition(), msg.offset(), decode_payload(msg.payload())),
            };
            self.shared.track(partition, offset);

            let Some(event) = decoded else {
                warn!(partition = partition, offset = offset, "Skipping undecodable message");
                self.shared.settle(partition, offset)?;
                continue;
            };

            let receipt = Receipt(format!("{}/{}/{}", self.shared.topic, partition, offset));
            debug!(receipt = %receipt, entity_id = %event.entity_id, "Received message");
            received.push((
                receipt,
                InFlight {
                    event,
                    partition,
                    offset,
                },
            ));
        }

        let mut in_flight = self.in_flight.lock().await;
        Ok(received
            .into_iter()
            .map(|(receipt, entry)| {
                let message = BrokerMessage {
                    event: entry.event.clone(),
                    receipt: receipt.clone(),
                };
                in_flight.insert(receipt, entry);
                message
            })
            .collect())
    }

    async fn ack(&self, receipt: &Receipt) -> Result<(), QueueError> {
        let entry = self.take_in_flight(receipt).await?;
        self.shared.settle(entry.partition, entry.offset)
    }

    async fn nack(&self, receipt: &Receipt, delay: Duration) -> Result<(), QueueError> {
        self.hand_back(receipt, delay, true).await
    }

    async fn release(&self, receipt: &Receipt, delay: Duration) -> Result<(), QueueError> {
        self.hand_back(receipt, delay, false).await
    }

    async fn dead_letter(&self, event: &ChangeEvent, reason: &str) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(&json!({
            "reason": reason,
            "event": event,
        }))?;
        self.shared.produce(
            &self.shared.dead_letter_topic,
            &event.key().document_id(),
            &payload,
            "DEAD_LETTER",
        )
        .await
    }

    async fn ping(&self) -> Result<bool, QueueError> {
        let producer = self.shared.producer.clone();
        let topic = self.shared.topic.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(topic.as_str()), METADATA_TIMEOUT)
                .map(|m| m.brokers().len())
        })
        .await
        .map_err(|e| QueueError::connection(e.to_string()))?;

        match metadata {
            Ok(brokers) => Ok(brokers > 0),
            Err(e) => Err(QueueError::connection(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_payload() {
        let event = ChangeEvent::upsert("listing", "L1", json!({"title": "Chair"}), 3);
        let bytes = serde_json::to_vec(&event).unwrap();

        assert_eq!(decode_payload(Some(&bytes)), Some(event));
        assert_eq!(decode_payload(Some(b"not json")), None);
        assert_eq!(decode_payload(None), None);
    }

    #[test]
    fn test_dead_letter_topic() {
        let config = KafkaBrokerConfig {
            brokers: "localhost:9092".into(),
            group_id: "search-sync".into(),
            topic: "search.change-events".into(),
            visibility_timeout: Duration::from_secs(30),
        };
        assert_eq!(config.dead_letter_topic(), "search.change-events.dlq");
    }
}
