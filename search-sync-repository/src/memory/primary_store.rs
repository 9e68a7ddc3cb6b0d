//! In-memory primary datastore.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::StoreError;
use crate::interfaces::PrimaryStoreReader;
use search_sync_shared::{Page, SourceRecord};

/// Primary dataset held in an ordered map keyed by entity id.
pub struct InMemoryPrimaryStore {
    entity_type: String,
    records: RwLock<BTreeMap<String, SourceRecord>>,
    // Remaining page fetches before reads start failing; negative disables.
    pages_until_failure: AtomicI64,
}

impl InMemoryPrimaryStore {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            records: RwLock::new(BTreeMap::new()),
            pages_until_failure: AtomicI64::new(-1),
        }
    }

    /// Insert or replace a record.
    pub async fn insert(&self, entity_id: impl Into<String>, version: u64, payload: Value) {
        let entity_id = entity_id.into();
        let record = SourceRecord {
            entity_type: self.entity_type.clone(),
            entity_id: entity_id.clone(),
            version,
            payload,
        };
        self.records.write().await.insert(entity_id, record);
    }

    /// Remove a record.
    pub async fn remove(&self, entity_id: &str) -> Option<SourceRecord> {
        self.records.write().await.remove(entity_id)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Serve `pages` more page fetches, then fail every read until
    /// [`heal`](Self::heal) is called.
    pub fn fail_after_pages(&self, pages: u32) {
        self.pages_until_failure.store(pages as i64, Ordering::SeqCst);
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        self.pages_until_failure.store(-1, Ordering::SeqCst);
    }

    fn take_page_budget(&self) -> Result<(), StoreError> {
        let remaining = self.pages_until_failure.load(Ordering::SeqCst);
        if remaining < 0 {
            return Ok(());
        }
        if remaining == 0 {
            return Err(StoreError::connection("primary datastore unavailable"));
        }
        self.pages_until_failure.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PrimaryStoreReader for InMemoryPrimaryStore {
    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page, StoreError> {
        self.take_page_budget()?;

        let records = self.records.read().await;
        let lower = match cursor {
            Some(c) => Bound::Excluded(c.to_string()),
            None => Bound::Unbounded,
        };
        let page: Vec<SourceRecord> = records
            .range((lower, Bound::Unbounded))
            .take(page_size)
            .map(|(_, r)| r.clone())
            .collect();

        let next_cursor = if page.len() == page_size {
            page.last().map(|r| r.entity_id.clone())
        } else {
            None
        };

        Ok(Page {
            records: page,
            next_cursor,
        })
    }

    async fn fetch_record(&self, entity_id: &str) -> Result<Option<SourceRecord>, StoreError> {
        if self.pages_until_failure.load(Ordering::SeqCst) == 0 {
            return Err(StoreError::connection("primary datastore unavailable"));
        }
        Ok(self.records.read().await.get(entity_id).cloned())
    }
}
