//! Error types for the search sync pipeline.

mod index_error;
mod orchestrator_error;
mod processor_error;
mod queue_error;

pub use index_error::IndexError;
pub use orchestrator_error::OrchestratorError;
pub use processor_error::ProcessorError;
pub use queue_error::QueueError;

use search_sync_repository::{SearchError, StoreError};
use thiserror::Error;

/// Umbrella error for callers driving the whole pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Queue processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
