//! Sync orchestrator errors.

use std::time::Duration;

use search_sync_repository::StoreError;
use search_sync_shared::OrchestratorState;
use thiserror::Error;

use super::{IndexError, QueueError};

/// Errors raised by the sync orchestrator.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The operation is not allowed in the current lifecycle state.
    #[error("{operation} is not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: OrchestratorState,
    },

    /// The operation conflicts with one already in progress.
    #[error("Conflict: {0}")]
    ConflictError(String),

    /// Draining did not finish within the shutdown bound.
    #[error("Shutdown did not complete within {0:?}")]
    TimeoutError(Duration),

    /// A required dependency stayed unreachable during startup.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The migration checkpoint could not be read or written.
    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    /// The operation was interrupted by shutdown.
    #[error("Cancelled by shutdown")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl OrchestratorError {
    /// Create a conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ConflictError(msg.into())
    }

    /// Create a checkpoint error.
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::CheckpointError(msg.into())
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        Self::CheckpointError(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::CheckpointError(err.to_string())
    }
}
