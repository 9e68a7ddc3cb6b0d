//! Search error types.
//!
//! This module defines the error types that can occur during search engine operations.

use thiserror::Error;

/// Errors that can occur during search engine operations.
#[derive(Error, Debug, Clone)]
pub enum SearchError {
    /// Failed to establish connection to the search engine.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Failed to index a single document.
    #[error("Index error: {0}")]
    IndexError(String),

    /// The bulk request as a whole was rejected.
    #[error("Bulk index error: {0}")]
    BulkIndexError(String),

    /// Failed to delete a document.
    #[error("Delete error: {0}")]
    DeleteError(String),

    /// Failed to create or delete the search index.
    #[error("Index creation error: {0}")]
    IndexCreationError(String),

    /// Failed to parse response from search engine.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Failed to serialize data for the search engine.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl SearchError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionError(msg.into())
    }

    /// Create an index error.
    pub fn index(msg: impl Into<String>) -> Self {
        Self::IndexError(msg.into())
    }

    /// Create a bulk index error.
    pub fn bulk_index(msg: impl Into<String>) -> Self {
        Self::BulkIndexError(msg.into())
    }

    /// Create a delete error.
    pub fn delete(msg: impl Into<String>) -> Self {
        Self::DeleteError(msg.into())
    }

    /// Create an index creation error.
    pub fn index_creation(msg: impl Into<String>) -> Self {
        Self::IndexCreationError(msg.into())
    }

    /// Create a parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Determine if an error is retryable (transient failures).
    pub fn is_retryable(&self) -> bool {
        match self {
            SearchError::ConnectionError(_) => true,
            // Parse errors might be transient (e.g., server temporarily unavailable)
            SearchError::ParseError(_) => true,
            SearchError::BulkIndexError(msg)
            | SearchError::IndexError(msg)
            | SearchError::DeleteError(msg) => is_transient_message(msg),
            SearchError::IndexCreationError(_) | SearchError::SerializationError(_) => false,
        }
    }
}

/// Rate limiting, timeouts and unavailable nodes are worth retrying.
fn is_transient_message(msg: &str) -> bool {
    let msg_lower = msg.to_lowercase();
    msg_lower.contains("rate limit")
        || msg_lower.contains("timeout")
        || msg_lower.contains("timed out")
        || msg_lower.contains("connection")
        || msg_lower.contains("503")
        || msg_lower.contains("429")
        || msg_lower.contains("es_rejected_execution")
}
