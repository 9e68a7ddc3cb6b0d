//! Rows read from the primary datastore.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::ChangeEvent;

/// One record of the primary dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub entity_type: String,
    pub entity_id: String,
    /// Last-modified marker of the row.
    pub version: u64,
    /// The row projected as JSON.
    pub payload: Value,
}

impl SourceRecord {
    /// Synthesize the upsert event that brings the index in line with this record.
    pub fn to_upsert_event(&self) -> ChangeEvent {
        ChangeEvent::upsert(
            self.entity_type.clone(),
            self.entity_id.clone(),
            self.payload.clone(),
            self.version,
        )
    }
}

/// A page of records ordered by entity id.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<SourceRecord>,
    /// Cursor for the next page, `None` when the dataset is exhausted.
    pub next_cursor: Option<String>,
}
