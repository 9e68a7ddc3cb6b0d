//! Search document types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::DocumentKey;

/// The denormalized representation of a source record in the search index.
///
/// Built from a change event payload by the indexer's mapping function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    /// Search engine document id (`{entity_type}:{entity_id}`).
    pub id: String,
    /// Logical type of the source record.
    pub entity_type: String,
    /// Identifier of the source record.
    pub entity_id: String,
    /// Display title.
    pub title: String,
    /// Optional long-form description.
    pub description: Option<String>,
    /// Category slug.
    pub category: Option<String>,
    /// Free-form tags, trimmed and deduplicated.
    pub tags: Vec<String>,
    /// Asking price.
    pub price: Option<f64>,
    /// ISO currency code.
    pub currency: String,
    /// Lifecycle status of the listing.
    pub status: String,
    /// Owner of the record.
    pub seller_id: Option<String>,
    /// Human readable location.
    pub location: Option<String>,
    /// Image URLs, in payload order.
    pub image_urls: Vec<String>,
    /// Creation time reported by the primary datastore.
    pub created_at: Option<DateTime<Utc>>,
    /// Last modification time reported by the primary datastore.
    pub updated_at: Option<DateTime<Utc>>,
    /// Remaining scalar payload fields.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Version of the source record this document reflects.
    pub source_version: u64,
}

impl SearchDocument {
    /// The key of the source record this document was built from.
    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.entity_type.clone(), self.entity_id.clone())
    }
}

/// The version state the search engine currently holds for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentVersion {
    /// Source version of the last applied mutation.
    pub source_version: u64,
    /// Whether the last applied mutation was a delete (tombstone).
    pub deleted: bool,
}

impl DocumentVersion {
    /// Version state of a live document.
    pub fn live(source_version: u64) -> Self {
        Self {
            source_version,
            deleted: false,
        }
    }

    /// Version state of a tombstone.
    pub fn tombstone(source_version: u64) -> Self {
        Self {
            source_version,
            deleted: true,
        }
    }
}
