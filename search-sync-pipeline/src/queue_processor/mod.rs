//! Outbox queue processor.
//!
//! A self-ticking loop, independent of queue tailing, that drains reindex
//! requests recorded in the outbox by the admin surface. Jobs become change
//! events and go through the same [`Indexer`] as live traffic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use search_sync_repository::{OutboxStore, PrimaryStoreReader};
use search_sync_shared::{ChangeEvent, OutboxJob, OutboxJobKind};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::errors::ProcessorError;
use crate::indexer::{Indexer, ItemOutcome};

/// Queue processor settings.
#[derive(Debug, Clone, Copy)]
pub struct QueueProcessorConfig {
    /// Jobs claimed per tick.
    pub page_size: usize,
}

impl Default for QueueProcessorConfig {
    fn default() -> Self {
        Self { page_size: 100 }
    }
}

/// Counts for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Drains the reindex outbox on a fixed interval.
pub struct QueueProcessor {
    core: Arc<Core>,
    running: Mutex<Option<Running>>,
}

struct Core {
    outbox: Arc<dyn OutboxStore>,
    reader: Arc<dyn PrimaryStoreReader>,
    indexer: Arc<Indexer>,
    config: QueueProcessorConfig,
}

impl QueueProcessor {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        reader: Arc<dyn PrimaryStoreReader>,
        indexer: Arc<Indexer>,
        config: QueueProcessorConfig,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                outbox,
                reader,
                indexer,
                config,
            }),
            running: Mutex::new(None),
        }
    }

    /// Start ticking every `period`.
    ///
    /// Ticks never overlap: the tick runs inline in the processing task and
    /// fires that fall due while it runs are skipped, not queued.
    ///
    /// # Errors
    ///
    /// * `AlreadyRunning` - Called again without an intervening `stop_processing`
    #[instrument(skip(self))]
    pub async fn start_processing(&self, period: Duration) -> Result<(), ProcessorError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ProcessorError::AlreadyRunning);
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let core = self.core.clone();
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = period.as_millis() as u64, "Queue processor started");

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.wait_for(|stop| *stop) => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = core.tick().await {
                    warn!(error = %e, "Queue processor tick failed");
                }
            }

            info!("Queue processor stopped");
        });

        *running = Some(Running { stop_tx, handle });
        Ok(())
    }

    /// Stop ticking and wait for the tick in progress, if any.
    ///
    /// No tick starts after this returns. Stopping a processor that is not
    /// running is a no-op.
    pub async fn stop_processing(&self) {
        let Some(Running { stop_tx, handle }) = self.running.lock().await.take() else {
            return;
        };
        stop_tx.send_replace(true);
        if let Err(e) = handle.await {
            warn!(error = %e, "Queue processor task ended abnormally");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Drain one page of the outbox immediately.
    pub async fn run_once(&self) -> Result<TickReport, ProcessorError> {
        self.core.tick().await
    }
}

impl Core {
    async fn tick(&self) -> Result<TickReport, ProcessorError> {
        let jobs = self.outbox.fetch_pending(self.config.page_size).await?;
        let mut report = TickReport {
            fetched: jobs.len(),
            ..TickReport::default()
        };
        if jobs.is_empty() {
            return Ok(report);
        }
        debug!(count = jobs.len(), "Processing outbox jobs");

        let mut pending: Vec<(OutboxJob, Uuid)> = Vec::with_capacity(jobs.len());
        let mut events = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.to_event(&job).await {
                Ok(event) => {
                    pending.push((job, event.event_id));
                    events.push(event);
                }
                Err(e) => {
                    warn!(job_id = job.id, entity_id = %job.entity_id, error = %e, "Failed to read record for outbox job");
                    self.fail(&job, &e.to_string()).await;
                    report.failed += 1;
                }
            }
        }

        let batch = match self.indexer.apply_batch(events).await {
            Ok(batch) => batch,
            Err(e) => {
                let reason = e.to_string();
                for (job, _) in &pending {
                    self.fail(job, &reason).await;
                }
                return Err(e.into());
            }
        };

        let outcomes: HashMap<Uuid, &ItemOutcome> = batch
            .items
            .iter()
            .map(|item| (item.event_id, &item.outcome))
            .collect();

        for (job, event_id) in &pending {
            let result = match outcomes.get(event_id) {
                Some(ItemOutcome::Applied) => {
                    report.applied += 1;
                    self.outbox.complete(job.id).await
                }
                Some(ItemOutcome::Skipped(_)) => {
                    report.skipped += 1;
                    self.outbox.complete(job.id).await
                }
                Some(ItemOutcome::Failed(e)) => {
                    report.failed += 1;
                    self.outbox.fail(job.id, &e.to_string()).await
                }
                None => {
                    report.failed += 1;
                    self.outbox.fail(job.id, "no outcome reported").await
                }
            };
            if let Err(e) = result {
                warn!(job_id = job.id, error = %e, "Failed to settle outbox job");
            }
        }

        info!(
            fetched = report.fetched,
            applied = report.applied,
            skipped = report.skipped,
            failed = report.failed,
            "Outbox tick complete"
        );
        Ok(report)
    }

    /// Turn a job into the change event it stands for.
    ///
    /// A reindex of a record that no longer exists becomes a delete, versioned
    /// by when the job was requested.
    async fn to_event(&self, job: &OutboxJob) -> Result<ChangeEvent, ProcessorError> {
        let requested_version = job.requested_at.timestamp_millis().max(0) as u64;
        let event = match job.kind {
            OutboxJobKind::Reindex => match self.reader.fetch_record(&job.entity_id).await? {
                Some(record) => record.to_upsert_event(),
                None => ChangeEvent::delete(&job.entity_type, &job.entity_id, requested_version),
            },
            OutboxJobKind::Remove => {
                ChangeEvent::delete(&job.entity_type, &job.entity_id, requested_version)
            }
        };
        Ok(event)
    }

    async fn fail(&self, job: &OutboxJob, reason: &str) {
        if let Err(e) = self.outbox.fail(job.id, reason).await {
            warn!(job_id = job.id, error = %e, "Failed to record outbox job failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use search_sync_repository::{
        InMemoryOutbox, InMemoryPrimaryStore, InMemorySearchEngine, StoreError,
    };
    use search_sync_shared::DocumentKey;
    use serde_json::json;

    /// Outbox whose claims take a while and that records overlapping calls.
    struct SlowOutbox {
        delay: Duration,
        ticks: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl SlowOutbox {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                ticks: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl OutboxStore for SlowOutbox {
        async fn fetch_pending(&self, _limit: usize) -> Result<Vec<OutboxJob>, StoreError> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn complete(&self, _job_id: i64) -> Result<(), StoreError> {
            Ok(())
        }

        async fn fail(&self, _job_id: i64, _error: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn processor(
        outbox: Arc<dyn OutboxStore>,
        store: Arc<InMemoryPrimaryStore>,
        engine: Arc<InMemorySearchEngine>,
    ) -> QueueProcessor {
        QueueProcessor::new(
            outbox,
            store,
            Arc::new(Indexer::new(engine)),
            QueueProcessorConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_never_overlap() {
        let outbox = Arc::new(SlowOutbox::new(Duration::from_millis(250)));
        let qp = processor(
            outbox.clone(),
            Arc::new(InMemoryPrimaryStore::new("listing")),
            Arc::new(InMemorySearchEngine::new()),
        );

        qp.start_processing(Duration::from_millis(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        qp.stop_processing().await;

        let ticks = outbox.ticks.load(Ordering::SeqCst);
        assert!((4..=5).contains(&ticks), "expected about one tick per 250ms, got {}", ticks);
        assert_eq!(outbox.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_an_error() {
        let qp = processor(
            Arc::new(InMemoryOutbox::new(3)),
            Arc::new(InMemoryPrimaryStore::new("listing")),
            Arc::new(InMemorySearchEngine::new()),
        );

        qp.start_processing(Duration::from_millis(100)).await.unwrap();
        assert!(matches!(
            qp.start_processing(Duration::from_millis(100)).await,
            Err(ProcessorError::AlreadyRunning)
        ));

        qp.stop_processing().await;
        assert!(!qp.is_running().await);
        qp.start_processing(Duration::from_millis(100)).await.unwrap();
        qp.stop_processing().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_running_tick() {
        let outbox = Arc::new(SlowOutbox::new(Duration::from_millis(250)));
        let qp = processor(
            outbox.clone(),
            Arc::new(InMemoryPrimaryStore::new("listing")),
            Arc::new(InMemorySearchEngine::new()),
        );

        qp.start_processing(Duration::from_millis(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(outbox.in_flight.load(Ordering::SeqCst), 1);

        qp.stop_processing().await;
        assert_eq!(outbox.in_flight.load(Ordering::SeqCst), 0);

        let ticks = outbox.ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(outbox.ticks.load(Ordering::SeqCst), ticks);
    }

    #[tokio::test]
    async fn test_run_once_reindexes_and_removes() {
        let outbox = Arc::new(InMemoryOutbox::new(3));
        let store = Arc::new(InMemoryPrimaryStore::new("listing"));
        let engine = Arc::new(InMemorySearchEngine::new());
        store.insert("L1", 3, json!({"title": "Lamp"})).await;
        store.insert("L2", 1, json!({"title": "Desk"})).await;

        let qp = processor(outbox.clone(), store.clone(), engine.clone());
        outbox.push("listing", "L1", OutboxJobKind::Reindex).await;
        outbox.push("listing", "L2", OutboxJobKind::Reindex).await;
        let report = qp.run_once().await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(engine.live_count().await, 2);

        outbox.push("listing", "L2", OutboxJobKind::Remove).await;
        store.remove("L1").await;
        outbox.push("listing", "L1", OutboxJobKind::Reindex).await;
        let report = qp.run_once().await.unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(report.applied, 2);
        assert_eq!(engine.live_count().await, 0);
        assert_eq!(outbox.completed_count().await, 4);
        assert!(engine
            .version_of(&DocumentKey::new("listing", "L2"))
            .await
            .is_some_and(|v| v.deleted));
    }

    #[tokio::test]
    async fn test_reindex_of_current_record_is_skipped() {
        let outbox = Arc::new(InMemoryOutbox::new(3));
        let store = Arc::new(InMemoryPrimaryStore::new("listing"));
        let engine = Arc::new(InMemorySearchEngine::new());
        store.insert("L1", 3, json!({"title": "Lamp"})).await;
        let qp = processor(outbox.clone(), store, engine.clone());

        outbox.push("listing", "L1", OutboxJobKind::Reindex).await;
        qp.run_once().await.unwrap();
        outbox.push("listing", "L1", OutboxJobKind::Reindex).await;
        let report = qp.run_once().await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(engine.mutation_count(), 1);
        assert_eq!(outbox.completed_count().await, 2);
    }

    #[tokio::test]
    async fn test_unreachable_engine_fails_jobs() {
        let outbox = Arc::new(InMemoryOutbox::new(3));
        let store = Arc::new(InMemoryPrimaryStore::new("listing"));
        let engine = Arc::new(InMemorySearchEngine::new());
        store.insert("L1", 1, json!({"title": "Lamp"})).await;
        engine.set_unreachable(true);
        let qp = processor(outbox.clone(), store, engine);

        let id = outbox.push("listing", "L1", OutboxJobKind::Reindex).await;
        assert!(qp.run_once().await.is_err());

        let job = outbox.job(id).await.unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.is_some());
        assert_eq!(outbox.pending_count().await, 1);
    }
}
