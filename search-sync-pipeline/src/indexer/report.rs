//! Outcome reporting for applied change events.

use search_sync_shared::DocumentKey;
use uuid::Uuid;

use crate::errors::IndexError;

/// Why an event was acknowledged without being applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The index already reflects this version or a newer one.
    Stale { current_version: u64 },
    /// A newer event for the same key in the same batch was applied instead.
    Superseded { by: Uuid },
    /// The search engine reported a version conflict at write time.
    VersionConflict,
}

/// Result of applying a single event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Skipped(SkipReason),
}

/// Per-event outcome within a batch.
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Applied,
    Skipped(SkipReason),
    Failed(IndexError),
}

impl ItemOutcome {
    /// Applied and skipped events are done and can be acked.
    pub fn is_done(&self) -> bool {
        !matches!(self, ItemOutcome::Failed(_))
    }
}

/// Outcome of one event of a batch.
#[derive(Debug, Clone)]
pub struct ItemReport {
    pub event_id: Uuid,
    pub key: DocumentKey,
    pub source_version: u64,
    pub outcome: ItemOutcome,
}

/// Per-item outcomes of [`crate::indexer::Indexer::apply_batch`], in input order.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub items: Vec<ItemReport>,
}

impl BatchReport {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn applied_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Applied))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Skipped(_)))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Failed(_)))
            .count()
    }

    /// Whether every item was applied or skipped.
    pub fn is_clean(&self) -> bool {
        self.items.iter().all(|i| i.outcome.is_done())
    }

    /// Outcome of a given event.
    pub fn outcome_of(&self, event_id: Uuid) -> Option<&ItemOutcome> {
        self.items
            .iter()
            .find(|i| i.event_id == event_id)
            .map(|i| &i.outcome)
    }

    /// The failed items.
    pub fn failures(&self) -> impl Iterator<Item = (&ItemReport, &IndexError)> {
        self.items.iter().filter_map(|item| match &item.outcome {
            ItemOutcome::Failed(err) => Some((item, err)),
            _ => None,
        })
    }
}
