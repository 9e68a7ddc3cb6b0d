//! Orchestrator configuration.

use std::time::Duration;

use crate::retry::Backoff;

/// Configuration for the sync orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum deliveries applied per batch while tailing.
    pub batch_size: usize,
    /// How long a partial batch waits for more deliveries.
    pub batch_linger: Duration,
    /// Records read per page during a full migration.
    pub migration_page_size: usize,
    /// Retry schedule for startup probes and migration page reads.
    pub startup_backoff: Backoff,
    /// Attempts per startup probe.
    pub startup_attempts: u32,
    /// Keep running when the search engine is unreachable at startup.
    pub continue_without_search: bool,
    /// Consecutive failed cycles before the sync state reads as degraded.
    pub degraded_threshold: u32,
    /// Upper bound for draining in-flight work on shutdown.
    pub shutdown_timeout: Duration,
    /// Delay schedule for redelivering failed events, by attempt count.
    pub redelivery_backoff: Backoff,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_linger: Duration::from_millis(200),
            migration_page_size: 500,
            startup_backoff: Backoff::default(),
            startup_attempts: 3,
            continue_without_search: true,
            degraded_threshold: 5,
            shutdown_timeout: Duration::from_secs(10),
            redelivery_backoff: Backoff::default(),
        }
    }
}
