//! Full-dataset migration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use search_sync_repository::StoreError;
use search_sync_shared::{ChangeEvent, MigrationCursor, SourceRecord, SyncState};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::Orchestrator;
use crate::errors::{IndexError, OrchestratorError};
use crate::queue::PublishAck;
use crate::retry::retry;

/// Summary of a completed migration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub run_id: Uuid,
    /// Whether the run continued from a saved checkpoint.
    pub resumed: bool,
    /// Pages committed, including those of the interrupted run when resumed.
    pub pages: u64,
    /// Records applied or already up to date.
    pub total_migrated: u64,
    /// Records that could not be indexed nor handed to the queue.
    pub total_failed: u64,
    /// Records whose indexing failed transiently and were published to the
    /// change queue for the live pipeline to retry.
    pub requeued: u64,
    pub elapsed: Duration,
}

/// Clears the migration flags however the run ends.
struct MigrationGuard<'a> {
    active: &'a AtomicBool,
    state: &'a watch::Sender<SyncState>,
}

impl Drop for MigrationGuard<'_> {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.state.send_modify(|s| s.migration_active = false);
    }
}

impl Orchestrator {
    /// Walk the primary dataset and bring the index in line with it.
    ///
    /// Pages are read in entity id order and applied through the indexer as
    /// upserts carrying each record's own version, so records changed by
    /// the live pipeline in the meantime are skipped as stale. The cursor is
    /// checkpointed after every page; a run that crashed or was cancelled
    /// resumes after the last committed page.
    ///
    /// # Errors
    ///
    /// * `ConflictError` - Another migration is running
    /// * `InvalidState` - The orchestrator is not running
    /// * `Cancelled` - Shutdown was signalled; the checkpoint is kept
    #[instrument(skip(self))]
    pub async fn initial_data_migration(&self) -> Result<MigrationReport, OrchestratorError> {
        self.require_running("initial_data_migration")?;

        if self
            .migration_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(OrchestratorError::conflict("a migration is already running"));
        }
        let _guard = MigrationGuard {
            active: &self.migration_active,
            state: &self.state,
        };
        self.state.send_modify(|s| s.migration_active = true);

        let started = Instant::now();
        let (mut cursor, resumed) = match self.checkpoints.load().await? {
            Some(cursor) if !cursor.completed => (cursor, true),
            _ => (MigrationCursor::start(), false),
        };
        let mut requeued = 0u64;

        info!(
            run_id = %cursor.run_id,
            resumed = resumed,
            after = ?cursor.last_entity_id,
            page_size = self.config.migration_page_size,
            "Starting initial data migration"
        );

        loop {
            if *self.shutdown_tx.borrow() {
                info!(run_id = %cursor.run_id, pages = cursor.pages, "Migration interrupted by shutdown, checkpoint kept");
                return Err(OrchestratorError::Cancelled);
            }

            let after = cursor.last_entity_id.clone();
            let page = retry(
                "migration_fetch_page",
                &self.config.startup_backoff,
                self.config.startup_attempts,
                StoreError::is_retryable,
                || self.reader.fetch_page(after.as_deref(), self.config.migration_page_size),
            )
            .await?;

            if page.records.is_empty() {
                break;
            }

            let last_entity_id = page.records.last().map(|r| r.entity_id.clone());
            let events: Vec<ChangeEvent> = page
                .records
                .iter()
                .map(SourceRecord::to_upsert_event)
                .collect();

            let report = retry(
                "migration_apply_page",
                &self.config.startup_backoff,
                self.config.startup_attempts,
                IndexError::is_retryable,
                || self.indexer.apply_batch(events.clone()),
            )
            .await?;

            let migrated = (report.applied_count() + report.skipped_count()) as u64;
            let mut failed = 0u64;
            let mut by_id: HashMap<Uuid, ChangeEvent> =
                events.into_iter().map(|e| (e.event_id, e)).collect();

            for (item, err) in report.failures() {
                let Some(event) = by_id.remove(&item.event_id) else {
                    continue;
                };
                if !err.is_retryable() {
                    warn!(entity_id = %item.key.entity_id, error = %err, "Record cannot be indexed");
                    failed += 1;
                    continue;
                }
                match self.queue.publish(event).await {
                    Ok(PublishAck::Enqueued) => requeued += 1,
                    Ok(PublishAck::DeadLettered) => failed += 1,
                    Err(e) => {
                        warn!(entity_id = %item.key.entity_id, error = %e, "Failed to requeue record");
                        failed += 1;
                    }
                }
            }

            cursor.advance(last_entity_id, migrated, failed);
            self.checkpoints.save(&cursor).await?;
            debug!(
                page = cursor.pages,
                migrated = cursor.total_migrated,
                failed = cursor.total_failed,
                "Committed migration page"
            );

            if page.next_cursor.is_none() {
                break;
            }
        }

        cursor.completed = true;
        self.checkpoints.clear().await?;

        let report = MigrationReport {
            run_id: cursor.run_id,
            resumed,
            pages: cursor.pages,
            total_migrated: cursor.total_migrated,
            total_failed: cursor.total_failed,
            requeued,
            elapsed: started.elapsed(),
        };
        info!(
            run_id = %report.run_id,
            pages = report.pages,
            migrated = report.total_migrated,
            failed = report.total_failed,
            requeued = report.requeued,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Initial data migration complete"
        );
        Ok(report)
    }
}
