//! # Search Sync Pipeline
//!
//! Keeps a search index consistent with the primary datastore.
//!
//! ## Architecture
//!
//! 1. **Queue**: at-least-once delivery of change events (Kafka or in-memory)
//! 2. **Indexer**: applies events to the search engine with per-key version ordering
//! 3. **Orchestrator**: tails the queue, runs full migrations, owns the lifecycle
//! 4. **Queue Processor**: drains the reindex outbox on a timer through the same indexer

pub mod errors;
pub mod indexer;
pub mod orchestrator;
pub mod queue;
pub mod queue_processor;
pub mod retry;

pub use errors::PipelineError;
pub use indexer::Indexer;
pub use orchestrator::Orchestrator;
pub use queue::ChangeEventQueue;
pub use queue_processor::QueueProcessor;
