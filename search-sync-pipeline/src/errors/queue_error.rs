//! Change event queue errors.

use thiserror::Error;

/// Errors raised by the change event queue and its brokers.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// The broker could not be reached.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The broker rejected or failed an operation.
    #[error("Broker error: {0}")]
    BrokerError(String),

    /// An event could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The receipt does not match an in-flight delivery (acked twice, or the
    /// visibility timeout expired and the message was handed out again).
    #[error("Unknown receipt: {0}")]
    UnknownReceipt(String),
}

impl QueueError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionError(msg.into())
    }

    /// Create a broker error.
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::BrokerError(msg.into())
    }

    /// Create a serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }

    /// Transient broker failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::ConnectionError(_) | QueueError::BrokerError(_))
    }
}

impl From<rdkafka::error::KafkaError> for QueueError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Self::BrokerError(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(QueueError::connection("refused").is_retryable());
        assert!(QueueError::broker("leader not available").is_retryable());
        assert!(!QueueError::serialization("bad json").is_retryable());
        assert!(!QueueError::UnknownReceipt("0:1".into()).is_retryable());
    }
}
