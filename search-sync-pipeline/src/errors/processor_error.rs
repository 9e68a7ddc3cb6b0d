//! Queue processor errors.

use search_sync_repository::StoreError;
use thiserror::Error;

use super::IndexError;

/// Errors raised by the outbox queue processor.
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// `start_processing` was called while the loop is already running.
    #[error("Queue processor is already running")]
    AlreadyRunning,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),
}
