//! Interface definitions for the pipeline's collaborators.
//!
//! These traits allow for dependency injection and swappable backends: the
//! pipeline only ever sees `Arc<dyn Trait>` handles.

mod outbox_store;
mod primary_store;
mod search_engine_client;

pub use outbox_store::OutboxStore;
pub use primary_store::PrimaryStoreReader;
pub use search_engine_client::SearchEngineClient;
