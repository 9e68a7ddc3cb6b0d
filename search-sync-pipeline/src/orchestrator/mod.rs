//! Sync orchestrator.
//!
//! Owns the lifecycle of the queue consumer and the indexer, and runs the
//! two kinds of synchronization: continuous tailing of the change queue and
//! one-shot full migrations from the primary datastore.
//!
//! ```text
//! UNINITIALIZED -> INITIALIZING -> RUNNING -> DRAINING -> STOPPED
//!                       |
//!                       +-> FAILED
//! ```

mod checkpoint;
mod config;
mod migration;
mod tailing;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
pub use config::OrchestratorConfig;
pub use migration::MigrationReport;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use search_sync_repository::{PrimaryStoreReader, SearchError};
use search_sync_shared::{OrchestratorState, SyncState};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::errors::{OrchestratorError, QueueError};
use crate::indexer::Indexer;
use crate::queue::ChangeEventQueue;
use crate::retry::retry;
use tailing::Tailer;

/// Coordinates queue tailing, full migrations and shutdown.
///
/// All operations take `&self`, so the orchestrator can be shared behind an
/// `Arc` with the host's operator actions.
pub struct Orchestrator {
    queue: Arc<ChangeEventQueue>,
    indexer: Arc<Indexer>,
    reader: Arc<dyn PrimaryStoreReader>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: OrchestratorConfig,
    state: Arc<watch::Sender<SyncState>>,
    shutdown_tx: watch::Sender<bool>,
    paused_tx: watch::Sender<bool>,
    migration_active: AtomicBool,
    tailing: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Create an orchestrator in the `UNINITIALIZED` state.
    pub fn new(
        queue: Arc<ChangeEventQueue>,
        indexer: Arc<Indexer>,
        reader: Arc<dyn PrimaryStoreReader>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::default());
        let (shutdown_tx, _) = watch::channel(false);
        let (paused_tx, _) = watch::channel(false);

        Self {
            queue,
            indexer,
            reader,
            checkpoints,
            config,
            state: Arc::new(state),
            shutdown_tx,
            paused_tx,
            migration_active: AtomicBool::new(false),
            tailing: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Snapshot of the sync state.
    pub fn sync_state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every sync state change.
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> OrchestratorState {
        self.state.borrow().orchestrator_state
    }

    /// Whether the host should show the "search may be stale" banner.
    pub fn is_degraded(&self) -> bool {
        self.state.borrow().is_degraded(self.config.degraded_threshold)
    }

    /// Probe dependencies and move to `RUNNING`.
    ///
    /// Each probe is retried with the startup backoff. An unreachable queue is
    /// logged as an error and tailing keeps retrying once started. An
    /// unreachable search engine is a warning when `continue_without_search`
    /// is set and moves the orchestrator to `FAILED` otherwise.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<SyncState, OrchestratorError> {
        self.transition(
            "initialize",
            &[OrchestratorState::Uninitialized],
            OrchestratorState::Initializing,
        )?;
        info!("Initializing sync orchestrator");

        let queue_ok = self.probe_queue().await;
        let search_ok = self.probe_search().await;

        if search_ok {
            if let Err(e) = self.indexer.client().ensure_index().await {
                warn!(error = %e, "Failed to ensure search index exists");
            }
        }

        self.state.send_modify(|s| {
            s.is_connected_to_queue = queue_ok;
            s.is_connected_to_search_engine = search_ok;
        });

        if !queue_ok {
            error!("Change queue unreachable at startup, running degraded until it recovers");
        }
        if !search_ok {
            if self.config.continue_without_search {
                warn!("Search engine unreachable at startup, continuing without search");
            } else {
                self.set_state(OrchestratorState::Failed);
                error!("Search engine unreachable at startup");
                return Err(OrchestratorError::ConnectionError(
                    "search engine unreachable after startup retries".to_string(),
                ));
            }
        }

        self.transition(
            "initialize",
            &[OrchestratorState::Initializing],
            OrchestratorState::Running,
        )?;
        info!(queue_ok = queue_ok, search_ok = search_ok, "Sync orchestrator running");
        Ok(self.sync_state())
    }

    async fn probe_queue(&self) -> bool {
        let queue = &self.queue;
        retry(
            "queue_probe",
            &self.config.startup_backoff,
            self.config.startup_attempts,
            |_: &QueueError| true,
            || async move {
                match queue.test_connection().await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(QueueError::connection("broker reported no connection")),
                    Err(e) => Err(e),
                }
            },
        )
        .await
        .is_ok()
    }

    async fn probe_search(&self) -> bool {
        let client = self.indexer.client();
        retry(
            "search_probe",
            &self.config.startup_backoff,
            self.config.startup_attempts,
            |_: &SearchError| true,
            || async move {
                match client.health().await {
                    Ok(health) if health.is_available() => Ok(()),
                    Ok(health) => Err(SearchError::connection(format!("cluster health {:?}", health))),
                    Err(e) => Err(e),
                }
            },
        )
        .await
        .is_ok()
    }

    /// Spawn the queue tailing task.
    ///
    /// # Errors
    ///
    /// * `InvalidState` - The orchestrator is not running
    /// * `ConflictError` - Tailing is already running
    #[instrument(skip(self))]
    pub async fn start_tailing(&self) -> Result<(), OrchestratorError> {
        self.require_running("start_tailing")?;

        let mut tailing = self.tailing.lock().await;
        if tailing.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(OrchestratorError::conflict("tailing is already running"));
        }

        let tailer = Tailer::new(
            self.queue.clone(),
            self.indexer.clone(),
            self.state.clone(),
            self.config.clone(),
            self.shutdown_tx.subscribe(),
            self.paused_tx.subscribe(),
        );
        *tailing = Some(tokio::spawn(tailer.run()));
        Ok(())
    }

    /// Stop pulling from the queue until [`resume_tailing`](Self::resume_tailing).
    ///
    /// The batch in progress, if any, still completes.
    pub fn pause_tailing(&self) {
        self.paused_tx.send_replace(true);
        self.state.send_modify(|s| s.tailing_paused = true);
    }

    pub fn resume_tailing(&self) {
        self.paused_tx.send_replace(false);
        self.state.send_modify(|s| s.tailing_paused = false);
    }

    /// Drain in-flight work and stop.
    ///
    /// Signals tailing and any running migration, then waits up to the
    /// configured shutdown timeout for them to finish. The state ends in
    /// `STOPPED` either way.
    ///
    /// # Errors
    ///
    /// * `TimeoutError` - Draining did not finish in time; the tailing task was aborted
    /// * `ConflictError` - A shutdown is already draining
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        match self.state() {
            OrchestratorState::Stopped => return Ok(()),
            OrchestratorState::Draining => {
                return Err(OrchestratorError::conflict("shutdown already in progress"))
            }
            OrchestratorState::Running => {
                self.transition("shutdown", &[OrchestratorState::Running], OrchestratorState::Draining)?;
            }
            // FAILED is terminal; shutting down only signals background work.
            OrchestratorState::Failed => {
                self.shutdown_tx.send_replace(true);
                return Ok(());
            }
            OrchestratorState::Uninitialized | OrchestratorState::Initializing => {
                self.shutdown_tx.send_replace(true);
                self.set_state(OrchestratorState::Stopped);
                return Ok(());
            }
        }

        info!("Draining sync orchestrator");
        self.shutdown_tx.send_replace(true);

        let handle = self.tailing.lock().await.take();
        let abort = handle.as_ref().map(|h| h.abort_handle());
        let mut state_rx = self.state.subscribe();

        let drain = async move {
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Tailing task ended abnormally");
                }
            }
            let _ = state_rx.wait_for(|s| !s.migration_active).await;
        };

        let result = match tokio::time::timeout(self.config.shutdown_timeout, drain).await {
            Ok(()) => {
                info!("Sync orchestrator stopped");
                Ok(())
            }
            Err(_) => {
                if let Some(abort) = abort {
                    abort.abort();
                }
                error!(timeout_ms = self.config.shutdown_timeout.as_millis() as u64, "Shutdown timed out");
                Err(OrchestratorError::TimeoutError(self.config.shutdown_timeout))
            }
        };

        self.set_state(OrchestratorState::Stopped);
        result
    }

    fn require_running(&self, operation: &'static str) -> Result<(), OrchestratorError> {
        let state = self.state();
        if state == OrchestratorState::Running {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidState { operation, state })
        }
    }

    fn set_state(&self, to: OrchestratorState) {
        self.state.send_modify(|s| s.orchestrator_state = to);
    }

    /// Move to `to` if the current state is one of `from`.
    fn transition(
        &self,
        operation: &'static str,
        from: &[OrchestratorState],
        to: OrchestratorState,
    ) -> Result<(), OrchestratorError> {
        let mut result = Ok(());
        self.state.send_if_modified(|s| {
            if from.contains(&s.orchestrator_state) {
                s.orchestrator_state = to;
                true
            } else {
                result = Err(OrchestratorError::InvalidState {
                    operation,
                    state: s.orchestrator_state,
                });
                false
            }
        });
        result
    }
}
