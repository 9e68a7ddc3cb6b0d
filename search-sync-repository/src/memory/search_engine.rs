//! In-memory search engine.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::errors::SearchError;
use crate::interfaces::SearchEngineClient;
use crate::types::{DeleteRequest, HealthStatus, PerItemResult};
use search_sync_shared::{DocumentKey, DocumentVersion, SearchDocument};

#[derive(Debug, Clone)]
struct StoredEntry {
    version: DocumentVersion,
    document: Option<SearchDocument>,
}

/// Search engine holding documents in a map, with OpenSearch external
/// versioning semantics.
#[derive(Default)]
pub struct InMemorySearchEngine {
    entries: Mutex<HashMap<DocumentKey, StoredEntry>>,
    failing_keys: Mutex<HashSet<DocumentKey>>,
    index_exists: AtomicBool,
    unreachable: AtomicBool,
    mutations: AtomicUsize,
    bulk_calls: AtomicUsize,
}

impl InMemorySearchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make bulk items for `key` fail until [`clear_failures`](Self::clear_failures).
    pub async fn fail_key(&self, key: DocumentKey) {
        self.failing_keys.lock().await.insert(key);
    }

    pub async fn clear_failures(&self) {
        self.failing_keys.lock().await.clear();
    }

    /// Number of mutations applied since creation (conflicts excluded).
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Number of bulk requests received.
    pub fn bulk_call_count(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    /// Number of live (non-tombstone) documents.
    pub async fn live_count(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.document.is_some())
            .count()
    }

    /// Version state held for a key.
    pub async fn version_of(&self, key: &DocumentKey) -> Option<DocumentVersion> {
        self.entries.lock().await.get(key).map(|e| e.version)
    }

    /// All live documents, sorted by id.
    pub async fn documents(&self) -> Vec<SearchDocument> {
        let mut docs: Vec<SearchDocument> = self
            .entries
            .lock()
            .await
            .values()
            .filter_map(|e| e.document.clone())
            .collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs
    }

    fn check_reachable(&self) -> Result<(), SearchError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SearchError::connection("connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchEngineClient for InMemorySearchEngine {
    async fn health(&self) -> Result<HealthStatus, SearchError> {
        self.check_reachable()?;
        Ok(HealthStatus::Green)
    }

    async fn bulk_upsert(
        &self,
        documents: &[SearchDocument],
    ) -> Result<Vec<PerItemResult>, SearchError> {
        self.check_reachable()?;
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self.failing_keys.lock().await.clone();
        let mut entries = self.entries.lock().await;
        let mut results = Vec::with_capacity(documents.len());

        for doc in documents {
            let key = doc.key();
            if failing.contains(&key) {
                results.push(PerItemResult::failed(key, "injected failure"));
                continue;
            }
            // version_type=external: strictly greater wins
            let stale = entries
                .get(&key)
                .map(|e| doc.source_version <= e.version.source_version)
                .unwrap_or(false);
            if stale {
                results.push(PerItemResult::conflict(key));
                continue;
            }

            entries.insert(
                key.clone(),
                StoredEntry {
                    version: DocumentVersion::live(doc.source_version),
                    document: Some(doc.clone()),
                },
            );
            self.mutations.fetch_add(1, Ordering::SeqCst);
            results.push(PerItemResult::ok(key));
        }

        Ok(results)
    }

    async fn bulk_delete(
        &self,
        requests: &[DeleteRequest],
    ) -> Result<Vec<PerItemResult>, SearchError> {
        self.check_reachable()?;
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self.failing_keys.lock().await.clone();
        let mut entries = self.entries.lock().await;
        let mut results = Vec::with_capacity(requests.len());

        for request in requests {
            let key = request.key.clone();
            if failing.contains(&key) {
                results.push(PerItemResult::failed(key, "injected failure"));
                continue;
            }
            // version_type=external_gte: equal versions overwrite
            let stale = entries
                .get(&key)
                .map(|e| request.source_version < e.version.source_version)
                .unwrap_or(false);
            if stale {
                results.push(PerItemResult::conflict(key));
                continue;
            }

            entries.insert(
                key.clone(),
                StoredEntry {
                    version: DocumentVersion::tombstone(request.source_version),
                    document: None,
                },
            );
            self.mutations.fetch_add(1, Ordering::SeqCst);
            results.push(PerItemResult::ok(key));
        }

        Ok(results)
    }

    async fn fetch_versions(
        &self,
        keys: &[DocumentKey],
    ) -> Result<HashMap<DocumentKey, DocumentVersion>, SearchError> {
        self.check_reachable()?;
        let entries = self.entries.lock().await;

        Ok(keys
            .iter()
            .filter_map(|k| entries.get(k).map(|e| (k.clone(), e.version)))
            .collect())
    }

    async fn get_document(&self, key: &DocumentKey) -> Result<Option<SearchDocument>, SearchError> {
        self.check_reachable()?;
        Ok(self
            .entries
            .lock()
            .await
            .get(key)
            .and_then(|e| e.document.clone()))
    }

    async fn create_index(&self, _mapping: &Value) -> Result<(), SearchError> {
        self.check_reachable()?;
        self.index_exists.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_index(&self) -> Result<(), SearchError> {
        self.check_reachable()?;
        self.entries.lock().await.clear();
        self.index_exists.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure_index(&self) -> Result<(), SearchError> {
        self.check_reachable()?;
        self.index_exists.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemOutcome;
    use std::collections::BTreeMap;

    fn doc(id: &str, version: u64, title: &str) -> SearchDocument {
        SearchDocument {
            id: format!("listing:{}", id),
            entity_type: "listing".to_string(),
            entity_id: id.to_string(),
            title: title.to_string(),
            description: None,
            category: None,
            tags: vec![],
            price: None,
            currency: "USD".to_string(),
            status: "active".to_string(),
            seller_id: None,
            location: None,
            image_urls: vec![],
            created_at: None,
            updated_at: None,
            attributes: BTreeMap::new(),
            source_version: version,
        }
    }

    fn key(id: &str) -> DocumentKey {
        DocumentKey::new("listing", id)
    }

    #[tokio::test]
    async fn test_upsert_rejects_equal_or_older_version() {
        let engine = InMemorySearchEngine::new();

        let results = engine.bulk_upsert(&[doc("L1", 5, "new")]).await.unwrap();
        assert_eq!(results[0].outcome, ItemOutcome::Ok);

        let results = engine
            .bulk_upsert(&[doc("L1", 5, "same"), doc("L1", 3, "old")])
            .await
            .unwrap();
        assert_eq!(results[0].outcome, ItemOutcome::VersionConflict);
        assert_eq!(results[1].outcome, ItemOutcome::VersionConflict);

        let stored = engine.get_document(&key("L1")).await.unwrap().unwrap();
        assert_eq!(stored.title, "new");
        assert_eq!(engine.mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone_and_wins_tie() {
        let engine = InMemorySearchEngine::new();
        engine.bulk_upsert(&[doc("L1", 10, "chair")]).await.unwrap();

        let results = engine
            .bulk_delete(&[DeleteRequest::new(key("L1"), 10)])
            .await
            .unwrap();
        assert_eq!(results[0].outcome, ItemOutcome::Ok);
        assert!(engine.get_document(&key("L1")).await.unwrap().is_none());
        assert_eq!(
            engine.version_of(&key("L1")).await,
            Some(DocumentVersion::tombstone(10))
        );

        let results = engine.bulk_upsert(&[doc("L1", 10, "again")]).await.unwrap();
        assert_eq!(results[0].outcome, ItemOutcome::VersionConflict);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let engine = InMemorySearchEngine::new();
        engine.fail_key(key("L2")).await;

        let results = engine
            .bulk_upsert(&[doc("L1", 1, "a"), doc("L2", 1, "b")])
            .await
            .unwrap();
        assert_eq!(results[0].outcome, ItemOutcome::Ok);
        assert!(matches!(results[1].outcome, ItemOutcome::Failed(_)));

        engine.set_unreachable(true);
        assert!(engine.health().await.is_err());
        assert!(engine.bulk_upsert(&[doc("L3", 1, "c")]).await.is_err());
    }
}
