//! Health summary of the sync pipeline.

use chrono::{DateTime, Utc};
use search_sync_shared::{OrchestratorState, SyncState};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{info, warn};

/// Overall status reported to the host.
pub fn status(state: &SyncState, degraded_threshold: u32) -> &'static str {
    match state.orchestrator_state {
        OrchestratorState::Failed | OrchestratorState::Stopped => "down",
        OrchestratorState::Uninitialized | OrchestratorState::Initializing => "starting",
        OrchestratorState::Draining => "draining",
        OrchestratorState::Running if state.is_degraded(degraded_threshold) => "degraded",
        OrchestratorState::Running => "ok",
    }
}

/// JSON body for the host's health endpoint.
pub fn describe(state: &SyncState, degraded_threshold: u32, now: DateTime<Utc>) -> Value {
    let lag_seconds = state
        .last_processed_at
        .map(|at| (now - at).num_seconds().max(0));

    json!({
        "status": status(state, degraded_threshold),
        "state": state,
        "search_may_be_stale": state.is_degraded(degraded_threshold),
        "seconds_since_last_processed": lag_seconds,
    })
}

/// Log every change of the sync state until the orchestrator goes away.
pub async fn log_state_changes(mut rx: watch::Receiver<SyncState>, degraded_threshold: u32) {
    let mut last_status = status(&rx.borrow_and_update(), degraded_threshold);

    while rx.changed().await.is_ok() {
        let state = rx.borrow_and_update().clone();
        let current = status(&state, degraded_threshold);
        if current == last_status {
            continue;
        }

        let summary = describe(&state, degraded_threshold, Utc::now());
        if current == "degraded" || current == "down" {
            warn!(status = current, health = %summary, "Sync health changed");
        } else {
            info!(status = current, health = %summary, "Sync health changed");
        }
        last_status = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn running() -> SyncState {
        SyncState {
            orchestrator_state: OrchestratorState::Running,
            is_connected_to_queue: true,
            is_connected_to_search_engine: true,
            ..SyncState::default()
        }
    }

    #[test]
    fn test_status() {
        assert_eq!(status(&running(), 3), "ok");
        assert_eq!(status(&SyncState::default(), 3), "starting");

        let mut failing = running();
        failing.consecutive_failures = 4;
        assert_eq!(status(&failing, 3), "degraded");

        let mut no_search = running();
        no_search.is_connected_to_search_engine = false;
        assert_eq!(status(&no_search, 3), "degraded");

        let mut failed = running();
        failed.orchestrator_state = OrchestratorState::Failed;
        assert_eq!(status(&failed, 3), "down");
    }

    #[test]
    fn test_describe_reports_lag() {
        let now = Utc::now();
        let mut state = running();
        state.last_processed_at = Some(now - Duration::seconds(42));

        let body = describe(&state, 3, now);

        assert_eq!(body["status"], "ok");
        assert_eq!(body["seconds_since_last_processed"], 42);
        assert_eq!(body["search_may_be_stale"], false);
        assert_eq!(body["state"]["orchestrator_state"], "RUNNING");
    }

    #[test]
    fn test_describe_without_progress() {
        let body = describe(&running(), 3, Utc::now());
        assert!(body["seconds_since_last_processed"].is_null());
    }
}
