//! Primary datastore and outbox error types.

use thiserror::Error;

/// Errors that can occur while reading the primary datastore or the outbox.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The datastore could not be reached.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A query failed.
    #[error("Query error: {0}")]
    QueryError(String),

    /// A row could not be decoded.
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// The store was configured with an invalid value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionError(msg.into())
    }

    /// Create a query error.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::QueryError(msg.into())
    }

    /// Create a decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::DecodeError(msg.into())
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::ConnectionError(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Tls(_) => Self::ConnectionError(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::DecodeError(err.to_string())
            }
            _ => Self::QueryError(err.to_string()),
        }
    }
}
