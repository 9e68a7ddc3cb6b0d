//! # Search Sync Repository
//!
//! Interfaces for the collaborators the sync pipeline talks to (the search
//! engine, the primary datastore and the reindex outbox), with an OpenSearch
//! implementation of the search engine, Postgres implementations of the
//! datastore reader and outbox, and in-memory implementations of all three.

pub mod config;
pub mod errors;
pub mod interfaces;
pub mod memory;
pub mod opensearch;
pub mod postgres;
pub mod types;

pub use config::SearchIndexConfig;
pub use errors::{SearchError, StoreError};
pub use interfaces::{OutboxStore, PrimaryStoreReader, SearchEngineClient};
pub use memory::{InMemoryOutbox, InMemoryPrimaryStore, InMemorySearchEngine};
pub use opensearch::OpenSearchClient;
pub use postgres::{PostgresOutbox, PostgresPrimaryStore};
pub use types::{DeleteRequest, HealthStatus, ItemOutcome, PerItemResult};
