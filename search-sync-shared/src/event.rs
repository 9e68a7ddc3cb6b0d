//! Change events.
//!
//! A [`ChangeEvent`] is the unit of work flowing from the primary datastore,
//! through the queue, into the search index.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The mutation carried by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Record was created or updated.
    Upsert,
    /// Record was deleted.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Upsert => write!(f, "UPSERT"),
            Operation::Delete => write!(f, "DELETE"),
        }
    }
}

/// Identity of a source record, and of its document in the search index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    /// Logical type of the source record (e.g. "listing").
    pub entity_type: String,
    /// Stable identifier of the source record.
    pub entity_id: String,
}

impl DocumentKey {
    /// Create a key for the given type and id.
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// The search engine document id.
    ///
    /// Uses format: `{entity_type}:{entity_id}`.
    pub fn document_id(&self) -> String {
        format!("{}:{}", self.entity_type, self.entity_id)
    }

    /// Parse a document id produced by [`DocumentKey::document_id`].
    pub fn from_document_id(id: &str) -> Option<Self> {
        let (entity_type, entity_id) = id.split_once(':')?;
        if entity_type.is_empty() || entity_id.is_empty() {
            return None;
        }
        Some(Self::new(entity_type, entity_id))
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// A single notified mutation of a source record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Unique id of this event, used for log correlation and broker receipts.
    pub event_id: Uuid,
    /// Logical type of the source record.
    pub entity_type: String,
    /// Stable identifier of the source record.
    pub entity_id: String,
    /// Upsert or delete.
    pub operation: Operation,
    /// Current projection of the record. Absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Monotonic marker from the primary datastore (row version or
    /// last-modified timestamp in milliseconds).
    pub source_version: u64,
    /// When the event entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// Number of failed deliveries so far.
    #[serde(default)]
    pub attempt_count: u32,
}

impl ChangeEvent {
    /// Create a new upsert event.
    pub fn upsert(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
        source_version: u64,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation: Operation::Upsert,
            payload: Some(payload),
            source_version,
            enqueued_at: Utc::now(),
            attempt_count: 0,
        }
    }

    /// Create a new delete event.
    pub fn delete(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        source_version: u64,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation: Operation::Delete,
            payload: None,
            source_version,
            enqueued_at: Utc::now(),
            attempt_count: 0,
        }
    }

    /// The key this event applies to.
    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Whether this event deletes its record.
    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }

    /// Whether this event should win over `other` for the same key.
    ///
    /// Higher `source_version` wins. On equal versions a delete wins over an
    /// upsert; two events of the same kind at the same version do not
    /// supersede each other.
    pub fn supersedes(&self, other: &ChangeEvent) -> bool {
        match self.source_version.cmp(&other.source_version) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.is_delete() && !other.is_delete(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_id_round_trip() {
        let key = DocumentKey::new("listing", "L1");
        assert_eq!(key.document_id(), "listing:L1");
        assert_eq!(DocumentKey::from_document_id("listing:L1"), Some(key));
        assert!(DocumentKey::from_document_id("listing").is_none());
        assert!(DocumentKey::from_document_id(":L1").is_none());
    }

    #[test]
    fn test_supersedes_by_version() {
        let older = ChangeEvent::upsert("listing", "L1", json!({}), 3);
        let newer = ChangeEvent::upsert("listing", "L1", json!({}), 5);

        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
    }

    #[test]
    fn test_delete_wins_tie() {
        let upsert = ChangeEvent::upsert("listing", "L1", json!({}), 10);
        let delete = ChangeEvent::delete("listing", "L1", 10);

        assert!(delete.supersedes(&upsert));
        assert!(!upsert.supersedes(&delete));
        assert!(!upsert.supersedes(&upsert.clone()));
    }

    #[test]
    fn test_operation_wire_format() {
        let event = ChangeEvent::delete("listing", "L1", 2);
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["operation"], "DELETE");
        assert!(value.get("payload").is_none());

        let decoded: ChangeEvent = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, event);
    }
}
