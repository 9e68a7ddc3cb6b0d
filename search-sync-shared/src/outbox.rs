//! Outbox jobs.
//!
//! Persisted out-of-band reindex requests, written by the admin surface and
//! drained by the queue processor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What an outbox job asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxJobKind {
    /// Re-read the record from the primary datastore and index it.
    Reindex,
    /// Remove the record's document from the index.
    Remove,
}

impl OutboxJobKind {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxJobKind::Reindex => "reindex",
            OutboxJobKind::Remove => "remove",
        }
    }

    /// Parse the database representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reindex" => Some(OutboxJobKind::Reindex),
            "remove" => Some(OutboxJobKind::Remove),
            _ => None,
        }
    }
}

/// A pending reindex request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxJob {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub kind: OutboxJobKind,
    pub requested_at: DateTime<Utc>,
    /// Failed processing attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl OutboxJob {
    /// Create a job for the given record.
    pub fn new(
        id: i64,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        kind: OutboxJobKind,
    ) -> Self {
        Self {
            id,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            kind,
            requested_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }
}
