//! Indexer.
//!
//! Applies change events to the search engine, enforcing per-key version
//! ordering: an event is only written if it is newer than what the index
//! already holds for its key, with deletes winning ties.

pub mod mapping;
mod report;

pub use mapping::build_document;
pub use report::{ApplyOutcome, BatchReport, ItemOutcome, ItemReport, SkipReason};

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use search_sync_repository::{DeleteRequest, PerItemResult, SearchEngineClient};
use search_sync_shared::{ChangeEvent, DocumentKey, DocumentVersion, SearchDocument};
use tracing::{debug, info, instrument, warn};

use crate::errors::IndexError;

/// Whether `event` is already reflected by the version the index holds.
fn is_stale(event: &ChangeEvent, current: &DocumentVersion) -> bool {
    if event.source_version != current.source_version {
        return event.source_version < current.source_version;
    }
    // Same version: only a delete over a live document still has work to do.
    !(event.is_delete() && !current.deleted)
}

/// Applies change events to the search engine.
///
/// Stateless apart from the shared client, so one indexer serves both the
/// queue tailing path and the outbox processor.
pub struct Indexer {
    client: Arc<dyn SearchEngineClient>,
}

impl Indexer {
    pub fn new(client: Arc<dyn SearchEngineClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<dyn SearchEngineClient> {
        &self.client
    }

    /// Apply a single event.
    ///
    /// # Returns
    ///
    /// * `Ok(ApplyOutcome::Applied)` - The mutation was written
    /// * `Ok(ApplyOutcome::Skipped(_))` - The index already reflects this version or a newer one
    /// * `Err(IndexError)` - The event could not be applied
    #[instrument(skip(self, event), fields(entity_id = %event.entity_id, version = event.source_version))]
    pub async fn apply_event(&self, event: ChangeEvent) -> Result<ApplyOutcome, IndexError> {
        let key = event.key();
        let report = self.apply_batch(vec![event]).await?;

        match report.items.into_iter().next().map(|item| item.outcome) {
            Some(ItemOutcome::Applied) => Ok(ApplyOutcome::Applied),
            Some(ItemOutcome::Skipped(reason)) => Ok(ApplyOutcome::Skipped(reason)),
            Some(ItemOutcome::Failed(err)) => Err(err),
            None => Err(IndexError::rejected(key.to_string(), "no outcome reported")),
        }
    }

    /// Apply a batch of events with one version lookup and at most one bulk
    /// upsert and one bulk delete.
    ///
    /// Events for the same key are collapsed to the one that wins under
    /// [`ChangeEvent::supersedes`]; the others are reported as superseded.
    /// Item failures are reported per event and never affect siblings.
    ///
    /// # Returns
    ///
    /// * `Ok(BatchReport)` - One item per input event, in input order
    /// * `Err(IndexError)` - The current versions could not be read, nothing was written
    #[instrument(skip(self, events), fields(event_count = events.len()))]
    pub async fn apply_batch(&self, events: Vec<ChangeEvent>) -> Result<BatchReport, IndexError> {
        if events.is_empty() {
            return Ok(BatchReport::default());
        }

        let mut outcomes: Vec<Option<ItemOutcome>> = vec![None; events.len()];
        let mut documents: HashMap<usize, SearchDocument> = HashMap::new();

        for (idx, event) in events.iter().enumerate() {
            if event.is_delete() {
                continue;
            }
            match event.payload.as_ref() {
                Some(payload) if payload.is_object() => {
                    documents.insert(idx, build_document(&event.key(), payload, event.source_version));
                }
                Some(_) => {
                    outcomes[idx] = Some(ItemOutcome::Failed(IndexError::mapping(
                        event.key().to_string(),
                        "payload is not a JSON object",
                    )));
                }
                None => {
                    outcomes[idx] = Some(ItemOutcome::Failed(IndexError::mapping(
                        event.key().to_string(),
                        "upsert without payload",
                    )));
                }
            }
        }

        let winners = collapse(&events, &mut outcomes);

        let keys: Vec<DocumentKey> = winners.iter().map(|&idx| events[idx].key()).collect();
        let versions = self.client.fetch_versions(&keys).await?;

        let mut upsert_idx = Vec::new();
        let mut upsert_docs = Vec::new();
        let mut delete_idx = Vec::new();
        let mut delete_reqs = Vec::new();

        for (&idx, key) in winners.iter().zip(keys) {
            let event = &events[idx];
            if let Some(current) = versions.get(&key) {
                if is_stale(event, current) {
                    debug!(
                        entity_id = %event.entity_id,
                        version = event.source_version,
                        current_version = current.source_version,
                        "Skipping stale event"
                    );
                    outcomes[idx] = Some(ItemOutcome::Skipped(SkipReason::Stale {
                        current_version: current.source_version,
                    }));
                    continue;
                }
            }

            if event.is_delete() {
                delete_idx.push(idx);
                delete_reqs.push(DeleteRequest::new(key, event.source_version));
            } else if let Some(doc) = documents.remove(&idx) {
                upsert_idx.push(idx);
                upsert_docs.push(doc);
            }
        }

        if !upsert_docs.is_empty() {
            let results = self.client.bulk_upsert(&upsert_docs).await;
            record_results(&events, &mut outcomes, &upsert_idx, results);
        }
        if !delete_reqs.is_empty() {
            let results = self.client.bulk_delete(&delete_reqs).await;
            record_results(&events, &mut outcomes, &delete_idx, results);
        }

        let report = BatchReport {
            items: events
                .iter()
                .zip(outcomes)
                .map(|(event, outcome)| ItemReport {
                    event_id: event.event_id,
                    key: event.key(),
                    source_version: event.source_version,
                    outcome: outcome.unwrap_or_else(|| {
                        ItemOutcome::Failed(IndexError::rejected(
                            event.key().to_string(),
                            "no outcome reported",
                        ))
                    }),
                })
                .collect(),
        };

        for (item, err) in report.failures() {
            warn!(
                entity_id = %item.key.entity_id,
                version = item.source_version,
                error = %err,
                "Failed to apply event"
            );
        }
        info!(
            applied = report.applied_count(),
            skipped = report.skipped_count(),
            failed = report.failed_count(),
            "Applied batch"
        );

        Ok(report)
    }
}

/// Pick one winning event per key among events not yet decided, marking the
/// rest superseded. Winners are returned in input order.
fn collapse(events: &[ChangeEvent], outcomes: &mut [Option<ItemOutcome>]) -> Vec<usize> {
    let mut winners: HashMap<DocumentKey, usize> = HashMap::new();

    for (idx, event) in events.iter().enumerate() {
        if outcomes[idx].is_some() {
            continue;
        }
        match winners.entry(event.key()) {
            Entry::Vacant(slot) => {
                slot.insert(idx);
            }
            Entry::Occupied(mut slot) => {
                let current = *slot.get();
                if event.supersedes(&events[current]) {
                    outcomes[current] = Some(ItemOutcome::Skipped(SkipReason::Superseded {
                        by: event.event_id,
                    }));
                    slot.insert(idx);
                } else {
                    outcomes[idx] = Some(ItemOutcome::Skipped(SkipReason::Superseded {
                        by: events[current].event_id,
                    }));
                }
            }
        }
    }

    let mut winners: Vec<usize> = winners.into_values().collect();
    winners.sort_unstable();
    winners
}

/// Record the outcome of one bulk call for the events at `indices`.
///
/// A failed call fails every event it carried.
fn record_results(
    events: &[ChangeEvent],
    outcomes: &mut [Option<ItemOutcome>],
    indices: &[usize],
    results: Result<Vec<PerItemResult>, search_sync_repository::SearchError>,
) {
    let results = match results {
        Ok(results) => results,
        Err(err) => {
            warn!(count = indices.len(), error = %err, "Bulk request failed");
            for &idx in indices {
                outcomes[idx] = Some(ItemOutcome::Failed(IndexError::Search(err.clone())));
            }
            return;
        }
    };

    for (pos, &idx) in indices.iter().enumerate() {
        let outcome = match results.get(pos).map(|r| &r.outcome) {
            Some(search_sync_repository::ItemOutcome::Ok) => ItemOutcome::Applied,
            Some(search_sync_repository::ItemOutcome::VersionConflict) => {
                ItemOutcome::Skipped(SkipReason::VersionConflict)
            }
            Some(search_sync_repository::ItemOutcome::Failed(reason)) => {
                ItemOutcome::Failed(IndexError::rejected(events[idx].key().to_string(), reason.clone()))
            }
            None => ItemOutcome::Failed(IndexError::rejected(
                events[idx].key().to_string(),
                "missing from bulk response",
            )),
        };
        outcomes[idx] = Some(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use search_sync_repository::{HealthStatus, InMemorySearchEngine, SearchError};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn upsert(id: &str, version: u64, title: &str) -> ChangeEvent {
        ChangeEvent::upsert("listing", id, json!({ "title": title }), version)
    }

    fn delete(id: &str, version: u64) -> ChangeEvent {
        ChangeEvent::delete("listing", id, version)
    }

    fn indexer() -> (Arc<InMemorySearchEngine>, Indexer) {
        let engine = Arc::new(InMemorySearchEngine::new());
        (engine.clone(), Indexer::new(engine))
    }

    async fn title_of(engine: &InMemorySearchEngine, id: &str) -> Option<String> {
        engine
            .get_document(&DocumentKey::new("listing", id))
            .await
            .unwrap()
            .map(|d| d.title)
    }

    #[test]
    fn test_is_stale() {
        let live = DocumentVersion::live(5);
        let tombstone = DocumentVersion::tombstone(5);

        assert!(is_stale(&upsert("L1", 4, "a"), &live));
        assert!(is_stale(&upsert("L1", 5, "a"), &live));
        assert!(!is_stale(&upsert("L1", 6, "a"), &live));
        assert!(!is_stale(&delete("L1", 5), &live));
        assert!(is_stale(&delete("L1", 5), &tombstone));
        assert!(is_stale(&upsert("L1", 5, "a"), &tombstone));
    }

    #[tokio::test]
    async fn test_apply_event_twice_is_idempotent() {
        let (engine, indexer) = indexer();
        let event = upsert("L1", 3, "Chair");

        assert_eq!(indexer.apply_event(event.clone()).await.unwrap(), ApplyOutcome::Applied);
        let again = indexer.apply_event(event).await.unwrap();

        assert_eq!(
            again,
            ApplyOutcome::Skipped(SkipReason::Stale { current_version: 3 })
        );
        assert_eq!(engine.mutation_count(), 1);
        assert_eq!(title_of(&engine, "L1").await.as_deref(), Some("Chair"));
    }

    #[tokio::test]
    async fn test_out_of_order_keeps_newer() {
        let (engine, indexer) = indexer();

        indexer.apply_event(upsert("L1", 5, "New")).await.unwrap();
        let outcome = indexer.apply_event(upsert("L1", 3, "Old")).await.unwrap();

        assert!(matches!(outcome, ApplyOutcome::Skipped(SkipReason::Stale { .. })));
        assert_eq!(title_of(&engine, "L1").await.as_deref(), Some("New"));
    }

    #[tokio::test]
    async fn test_delete_wins_tie_in_either_order() {
        let (engine, indexer) = indexer();
        indexer.apply_event(upsert("L1", 10, "Chair")).await.unwrap();
        indexer.apply_event(delete("L1", 10)).await.unwrap();
        assert_eq!(title_of(&engine, "L1").await, None);

        let (engine, indexer) = self::indexer();
        indexer.apply_event(delete("L2", 10)).await.unwrap();
        let outcome = indexer.apply_event(upsert("L2", 10, "Chair")).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Skipped(_)));
        assert_eq!(title_of(&engine, "L2").await, None);
    }

    #[tokio::test]
    async fn test_batch_collapses_per_key() {
        let (engine, indexer) = indexer();
        let events = vec![
            upsert("L1", 1, "v1"),
            upsert("L1", 2, "v2"),
            upsert("L1", 3, "v3"),
        ];
        let winner = events[2].event_id;

        let report = indexer.apply_batch(events).await.unwrap();

        assert_eq!(report.applied_count(), 1);
        assert_eq!(report.skipped_count(), 2);
        assert!(matches!(
            report.items[0].outcome,
            ItemOutcome::Skipped(SkipReason::Superseded { by }) if by == winner
        ));
        assert_eq!(engine.mutation_count(), 1);
        assert_eq!(title_of(&engine, "L1").await.as_deref(), Some("v3"));
    }

    #[tokio::test]
    async fn test_batch_tie_delete_wins_within_batch() {
        let (engine, indexer) = indexer();
        let report = indexer
            .apply_batch(vec![delete("L1", 10), upsert("L1", 10, "Chair")])
            .await
            .unwrap();

        assert!(matches!(report.items[0].outcome, ItemOutcome::Applied));
        assert!(matches!(report.items[1].outcome, ItemOutcome::Skipped(_)));
        assert_eq!(engine.version_of(&DocumentKey::new("listing", "L1")).await, Some(DocumentVersion::tombstone(10)));
    }

    #[tokio::test]
    async fn test_mapping_error_does_not_block_siblings() {
        let (engine, indexer) = indexer();
        let mut bad = upsert("L1", 1, "x");
        bad.payload = Some(Value::String("oops".into()));
        let mut missing = upsert("L2", 1, "x");
        missing.payload = None;

        let report = indexer
            .apply_batch(vec![bad, missing, upsert("L3", 1, "ok")])
            .await
            .unwrap();

        assert!(matches!(&report.items[0].outcome, ItemOutcome::Failed(e) if e.is_mapping_error()));
        assert!(matches!(&report.items[1].outcome, ItemOutcome::Failed(e) if e.is_mapping_error()));
        assert!(matches!(report.items[2].outcome, ItemOutcome::Applied));
        assert_eq!(engine.live_count().await, 1);
    }

    #[tokio::test]
    async fn test_item_failure_is_contained() {
        let (engine, indexer) = indexer();
        engine.fail_key(DocumentKey::new("listing", "L1")).await;

        let report = indexer
            .apply_batch(vec![upsert("L1", 1, "a"), upsert("L2", 1, "b")])
            .await
            .unwrap();

        assert!(matches!(&report.items[0].outcome, ItemOutcome::Failed(e) if e.is_retryable()));
        assert!(matches!(report.items[1].outcome, ItemOutcome::Applied));
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_unreachable_engine_fails_whole_batch() {
        let (engine, indexer) = indexer();
        engine.set_unreachable(true);

        let err = indexer
            .apply_batch(vec![upsert("L1", 1, "a"), delete("L2", 1)])
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(engine.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (engine, indexer) = indexer();
        let report = indexer.apply_batch(Vec::new()).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(engine.bulk_call_count(), 0);
    }

    /// Client whose version lookup works but whose bulk calls fail as a whole.
    struct BulkFailingClient {
        bulk_calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchEngineClient for BulkFailingClient {
        async fn health(&self) -> Result<HealthStatus, SearchError> {
            Ok(HealthStatus::Green)
        }

        async fn bulk_upsert(&self, _: &[SearchDocument]) -> Result<Vec<PerItemResult>, SearchError> {
            self.bulk_calls.fetch_add(1, Ordering::SeqCst);
            Err(SearchError::bulk_index("429 Too Many Requests"))
        }

        async fn bulk_delete(&self, requests: &[DeleteRequest]) -> Result<Vec<PerItemResult>, SearchError> {
            self.bulk_calls.fetch_add(1, Ordering::SeqCst);
            Ok(requests.iter().map(|r| PerItemResult::ok(r.key.clone())).collect())
        }

        async fn fetch_versions(
            &self,
            _: &[DocumentKey],
        ) -> Result<HashMap<DocumentKey, DocumentVersion>, SearchError> {
            Ok(HashMap::new())
        }

        async fn get_document(&self, _: &DocumentKey) -> Result<Option<SearchDocument>, SearchError> {
            Ok(None)
        }

        async fn create_index(&self, _: &Value) -> Result<(), SearchError> {
            Ok(())
        }

        async fn delete_index(&self) -> Result<(), SearchError> {
            Ok(())
        }

        async fn ensure_index(&self) -> Result<(), SearchError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_bulk_call_only_fails_its_items() {
        let client = Arc::new(BulkFailingClient {
            bulk_calls: AtomicUsize::new(0),
        });
        let indexer = Indexer::new(client.clone());

        let report = indexer
            .apply_batch(vec![upsert("L1", 1, "a"), delete("L2", 1)])
            .await
            .unwrap();

        assert_eq!(client.bulk_calls.load(Ordering::SeqCst), 2);
        assert!(matches!(&report.items[0].outcome, ItemOutcome::Failed(e) if e.is_retryable()));
        assert!(matches!(report.items[1].outcome, ItemOutcome::Applied));
    }
}
