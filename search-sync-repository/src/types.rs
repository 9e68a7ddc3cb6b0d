//! Request and response types for search engine operations.

use search_sync_shared::DocumentKey;

/// Cluster health as reported by the search engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Green,
    Yellow,
    Red,
    /// The engine did not answer.
    Unreachable,
}

impl HealthStatus {
    /// Parse a cluster health status string.
    pub fn from_status(status: &str) -> Self {
        match status {
            "green" => HealthStatus::Green,
            "yellow" => HealthStatus::Yellow,
            "red" => HealthStatus::Red,
            _ => HealthStatus::Unreachable,
        }
    }

    /// Whether writes can be expected to succeed.
    pub fn is_available(&self) -> bool {
        matches!(self, HealthStatus::Green | HealthStatus::Yellow)
    }
}

/// Request to delete the document for a key.
///
/// The delete is recorded as a tombstone at `source_version`, so a stale
/// upsert arriving later is still rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub key: DocumentKey,
    pub source_version: u64,
}

impl DeleteRequest {
    pub fn new(key: DocumentKey, source_version: u64) -> Self {
        Self {
            key,
            source_version,
        }
    }
}

/// Outcome of a single item within a bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The mutation was applied.
    Ok,
    /// The engine already holds an equal or newer version.
    VersionConflict,
    /// The item was rejected.
    Failed(String),
}

/// Result of a bulk operation for a single item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerItemResult {
    pub key: DocumentKey,
    pub outcome: ItemOutcome,
}

impl PerItemResult {
    pub fn ok(key: DocumentKey) -> Self {
        Self {
            key,
            outcome: ItemOutcome::Ok,
        }
    }

    pub fn conflict(key: DocumentKey) -> Self {
        Self {
            key,
            outcome: ItemOutcome::VersionConflict,
        }
    }

    pub fn failed(key: DocumentKey, error: impl Into<String>) -> Self {
        Self {
            key,
            outcome: ItemOutcome::Failed(error.into()),
        }
    }
}
