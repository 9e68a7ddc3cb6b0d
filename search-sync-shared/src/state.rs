//! Process-wide sync state and migration progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states of the sync orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestratorState {
    Uninitialized,
    Initializing,
    Running,
    Draining,
    Stopped,
    /// Terminal: a required dependency stayed unreachable during startup.
    Failed,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OrchestratorState::Uninitialized => "UNINITIALIZED",
            OrchestratorState::Initializing => "INITIALIZING",
            OrchestratorState::Running => "RUNNING",
            OrchestratorState::Draining => "DRAINING",
            OrchestratorState::Stopped => "STOPPED",
            OrchestratorState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Snapshot of the pipeline's health, read by the host's liveness endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub orchestrator_state: OrchestratorState,
    pub is_connected_to_queue: bool,
    pub is_connected_to_search_engine: bool,
    pub last_processed_at: Option<DateTime<Utc>>,
    /// Processing cycles that failed in a row. Reset by any successful cycle.
    pub consecutive_failures: u32,
    pub migration_active: bool,
    pub tailing_paused: bool,
}

impl SyncState {
    /// Whether an operator dashboard should show the "search may be stale" banner.
    pub fn is_degraded(&self, failure_threshold: u32) -> bool {
        !self.is_connected_to_queue
            || !self.is_connected_to_search_engine
            || self.consecutive_failures > failure_threshold
    }

    /// Record a processing cycle that made progress.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_processed_at = Some(Utc::now());
        self.is_connected_to_search_engine = true;
    }

    /// Record a processing cycle that failed.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            orchestrator_state: OrchestratorState::Uninitialized,
            is_connected_to_queue: false,
            is_connected_to_search_engine: false,
            last_processed_at: None,
            consecutive_failures: 0,
            migration_active: false,
            tailing_paused: false,
        }
    }
}

/// Progress of a full resync, checkpointed after every committed page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCursor {
    pub run_id: Uuid,
    /// Last entity id of the last committed page. `None` before the first page.
    pub last_entity_id: Option<String>,
    pub total_migrated: u64,
    pub total_failed: u64,
    pub pages: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed: bool,
}

impl MigrationCursor {
    /// Start a fresh cursor at the beginning of the dataset.
    pub fn start() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            last_entity_id: None,
            total_migrated: 0,
            total_failed: 0,
            pages: 0,
            started_at: now,
            updated_at: now,
            completed: false,
        }
    }

    /// Advance past a committed page.
    pub fn advance(&mut self, last_entity_id: Option<String>, migrated: u64, failed: u64) {
        if last_entity_id.is_some() {
            self.last_entity_id = last_entity_id;
        }
        self.total_migrated += migrated;
        self.total_failed += failed;
        self.pages += 1;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_threshold() {
        let mut state = SyncState {
            is_connected_to_queue: true,
            is_connected_to_search_engine: true,
            ..Default::default()
        };
        assert!(!state.is_degraded(3));

        for _ in 0..4 {
            state.record_failure();
        }
        assert!(state.is_degraded(3));

        state.record_success();
        assert!(!state.is_degraded(3));
        assert!(state.last_processed_at.is_some());
    }

    #[test]
    fn test_cursor_advance() {
        let mut cursor = MigrationCursor::start();
        cursor.advance(Some("L10".to_string()), 10, 0);
        cursor.advance(None, 0, 0);

        assert_eq!(cursor.last_entity_id.as_deref(), Some("L10"));
        assert_eq!(cursor.total_migrated, 10);
        assert_eq!(cursor.pages, 2);
    }
}
