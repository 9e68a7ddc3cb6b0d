//! Search engine client trait definition.
//!
//! This module defines the abstract interface for search engine operations,
//! allowing for different backend implementations (OpenSearch, in-memory, etc.).

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::SearchError;
use crate::types::{DeleteRequest, HealthStatus, PerItemResult};
use search_sync_shared::{DocumentKey, DocumentVersion, SearchDocument};

/// Abstract interface for search engine operations.
///
/// The search engine is the sole mutator of the index state; the pipeline
/// owns the mapping from source records to [`SearchDocument`]s.
///
/// # Versioning
///
/// Every document carries the `source_version` of the record it reflects.
/// Implementations must reject an upsert whose version is not strictly
/// greater than the stored one, and a delete whose version is lower than the
/// stored one, reporting [`crate::ItemOutcome::VersionConflict`] for that item.
/// Deletes leave a tombstone behind so that ordering survives them.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync` to allow use across async tasks.
#[async_trait]
pub trait SearchEngineClient: Send + Sync {
    /// Check if the search engine is healthy and reachable.
    ///
    /// # Returns
    ///
    /// * `Ok(HealthStatus)` - The cluster health
    /// * `Err(SearchError)` - If the health check fails to execute
    async fn health(&self) -> Result<HealthStatus, SearchError>;

    /// Index multiple documents in bulk.
    ///
    /// # Returns
    ///
    /// * `Ok(Vec<PerItemResult>)` - One result per document, in input order
    /// * `Err(SearchError)` - If the bulk call failed as a whole
    async fn bulk_upsert(&self, documents: &[SearchDocument])
        -> Result<Vec<PerItemResult>, SearchError>;

    /// Delete multiple documents in bulk, leaving tombstones.
    ///
    /// Deleting a document that does not exist succeeds.
    ///
    /// # Returns
    ///
    /// * `Ok(Vec<PerItemResult>)` - One result per request, in input order
    /// * `Err(SearchError)` - If the bulk call failed as a whole
    async fn bulk_delete(&self, requests: &[DeleteRequest])
        -> Result<Vec<PerItemResult>, SearchError>;

    /// Look up the version state currently held for each key.
    ///
    /// Keys with neither a document nor a tombstone are absent from the map.
    async fn fetch_versions(
        &self,
        keys: &[DocumentKey],
    ) -> Result<HashMap<DocumentKey, DocumentVersion>, SearchError>;

    /// Fetch the live document for a key. Tombstones read as `None`.
    async fn get_document(&self, key: &DocumentKey) -> Result<Option<SearchDocument>, SearchError>;

    /// Create the index with the given settings and mappings.
    async fn create_index(&self, mapping: &Value) -> Result<(), SearchError>;

    /// Delete the index and everything in it.
    async fn delete_index(&self) -> Result<(), SearchError>;

    /// Create the index with the default mappings if it does not exist yet.
    ///
    /// This should be called during application startup.
    async fn ensure_index(&self) -> Result<(), SearchError>;
}
