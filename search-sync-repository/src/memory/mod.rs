//! In-memory implementations of the collaborator interfaces.
//!
//! Used by the test suites and for running the pipeline locally without
//! external services. They honour the same versioning and claim semantics as
//! the real backends and support failure injection.

mod outbox;
mod primary_store;
mod search_engine;

pub use outbox::InMemoryOutbox;
pub use primary_store::InMemoryPrimaryStore;
pub use search_engine::InMemorySearchEngine;
