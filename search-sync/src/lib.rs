//! # Search Sync
//!
//! Entry point wiring for the search index sync service: configuration from
//! the environment, dependency construction and the health summary exposed to
//! the host.

pub mod config;
pub mod health;

pub use config::{Dependencies, Settings};

use thiserror::Error;

/// Errors that can occur while starting or running the service.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Pipeline error: {0}")]
    PipelineError(#[from] search_sync_pipeline::PipelineError),

    #[error("Orchestrator error: {0}")]
    OrchestratorError(#[from] search_sync_pipeline::errors::OrchestratorError),

    #[error("Queue error: {0}")]
    QueueError(#[from] search_sync_pipeline::errors::QueueError),

    #[error("Queue processor error: {0}")]
    ProcessorError(#[from] search_sync_pipeline::errors::ProcessorError),

    #[error("Search error: {0}")]
    SearchError(#[from] search_sync_repository::SearchError),

    #[error("Store error: {0}")]
    StoreError(#[from] search_sync_repository::StoreError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SyncError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}
