//! Primary datastore reader trait definition.

use async_trait::async_trait;

use crate::errors::StoreError;
use search_sync_shared::{Page, SourceRecord};

/// Read-only access to the authoritative dataset.
///
/// Used by the full resync and by outbox reindex jobs.
#[async_trait]
pub trait PrimaryStoreReader: Send + Sync {
    /// Fetch the page of records following `cursor`, ordered by entity id.
    ///
    /// # Arguments
    ///
    /// * `cursor` - Entity id of the last record already seen, `None` to start at the beginning
    /// * `page_size` - Maximum number of records to return
    ///
    /// # Returns
    ///
    /// * `Ok(Page)` - The records and the cursor of the next page (`None` when exhausted)
    /// * `Err(StoreError)` - If the read fails
    async fn fetch_page(&self, cursor: Option<&str>, page_size: usize)
        -> Result<Page, StoreError>;

    /// Fetch a single record by id, `None` if it no longer exists.
    async fn fetch_record(&self, entity_id: &str) -> Result<Option<SourceRecord>, StoreError>;
}
