//! Continuous tailing of the change event queue.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use search_sync_shared::SyncState;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::OrchestratorConfig;
use crate::indexer::{Indexer, ItemOutcome};
use crate::queue::{ChangeEventQueue, Delivery};

/// Resolves once tailing is paused. Resolves `false` if the sender is gone.
async fn until_paused(paused: &mut watch::Receiver<bool>) -> bool {
    paused.wait_for(|p| *p).await.is_ok()
}

/// Resolves once tailing is resumed. Resolves `false` if the sender is gone.
async fn until_resumed(paused: &mut watch::Receiver<bool>) -> bool {
    paused.wait_for(|p| !*p).await.is_ok()
}

/// Unmappable events remembered for their single immediate retry.
const MAPPING_RETRY_CAPACITY: usize = 1024;

/// The background consumer started by `Orchestrator::start_tailing`.
///
/// While the search engine is unreachable nothing is pulled from the queue:
/// batches that hit the outage are released without spending a delivery
/// attempt, and tailing resumes once a health check passes.
pub(crate) struct Tailer {
    queue: Arc<ChangeEventQueue>,
    indexer: Arc<Indexer>,
    state: Arc<watch::Sender<SyncState>>,
    config: OrchestratorConfig,
    shutdown: watch::Receiver<bool>,
    paused: watch::Receiver<bool>,
    mapping_retried: HashSet<Uuid>,
}

impl Tailer {
    pub fn new(
        queue: Arc<ChangeEventQueue>,
        indexer: Arc<Indexer>,
        state: Arc<watch::Sender<SyncState>>,
        config: OrchestratorConfig,
        shutdown: watch::Receiver<bool>,
        paused: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            indexer,
            state,
            config,
            shutdown,
            paused,
            mapping_retried: HashSet::new(),
        }
    }

    pub async fn run(mut self) {
        info!(batch_size = self.config.batch_size, "Tailing started");
        let mut deliveries = Box::pin(self.queue.consume(self.shutdown.clone()));

        loop {
            if *self.paused.borrow() {
                info!("Tailing paused");
                let mut shutdown = self.shutdown.clone();
                tokio::select! {
                    resumed = until_resumed(&mut self.paused) => {
                        if !resumed {
                            break;
                        }
                        info!("Tailing resumed");
                    }
                    _ = shutdown.wait_for(|s| *s) => break,
                }
            }

            let search_down = !self.state.borrow().is_connected_to_search_engine;
            if search_down && !self.wait_for_search().await {
                break;
            }

            // The stream ends on shutdown. Pausing abandons the wait, not the
            // stream: an in-progress receive resumes on the next poll.
            let next = tokio::select! {
                next = deliveries.next() => next,
                _ = until_paused(&mut self.paused) => continue,
            };

            let first = match next {
                None => break,
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!(error = %e, "Queue unavailable");
                    self.state.send_modify(|s| {
                        s.is_connected_to_queue = false;
                        s.record_failure();
                    });
                    continue;
                }
            };
            self.state.send_if_modified(|s| {
                let changed = !s.is_connected_to_queue;
                s.is_connected_to_queue = true;
                changed
            });

            let mut batch = vec![first];
            let deadline = Instant::now() + self.config.batch_linger;
            while batch.len() < self.config.batch_size {
                match timeout_at(deadline, deliveries.next()).await {
                    Ok(Some(Ok(delivery))) => batch.push(delivery),
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "Queue error while filling batch");
                        break;
                    }
                    Ok(None) | Err(_) => break,
                }
            }

            self.process(batch).await;
        }

        info!("Tailing stopped");
    }

    /// Apply one batch and settle every delivery in it.
    async fn process(&mut self, batch: Vec<Delivery>) {
        let events = batch.iter().map(|d| d.event.clone()).collect();

        let report = match self.indexer.apply_batch(events).await {
            Ok(report) => report,
            Err(e) if e.is_unreachable() => {
                warn!(count = batch.len(), error = %e, "Search engine unreachable, releasing batch");
                for delivery in batch {
                    if let Err(e) = delivery.handle.release(Duration::ZERO).await {
                        warn!(error = %e, "Failed to release delivery");
                    }
                }
                self.lost_search();
                return;
            }
            Err(e) => {
                warn!(count = batch.len(), error = %e, "Batch failed, withholding acks");
                for delivery in batch {
                    let delay = self.redelivery_delay(delivery.event.attempt_count);
                    if let Err(e) = delivery.handle.nack(delay).await {
                        warn!(error = %e, "Failed to nack delivery");
                    }
                }
                self.state.send_modify(|s| s.record_failure());
                return;
            }
        };

        let all_failed = report.failed_count() == report.len();
        let unreachable = report.failures().any(|(_, e)| e.is_unreachable());
        for (delivery, item) in batch.into_iter().zip(report.items) {
            self.settle(delivery, item.outcome).await;
        }

        if unreachable {
            self.lost_search();
            return;
        }
        self.state.send_modify(|s| {
            if all_failed {
                s.record_failure();
            } else {
                s.record_success();
            }
        });
        self.warn_if_degraded();
    }

    async fn settle(&mut self, delivery: Delivery, outcome: ItemOutcome) {
        let Delivery { event, handle } = delivery;

        let result = match outcome {
            ItemOutcome::Applied | ItemOutcome::Skipped(_) => {
                self.mapping_retried.remove(&event.event_id);
                handle.ack().await
            }
            // Not the event's fault; it goes back untouched.
            ItemOutcome::Failed(e) if e.is_unreachable() => handle.release(Duration::ZERO).await,
            // One immediate retry, then park it.
            ItemOutcome::Failed(e)
                if e.is_mapping_error() && !self.mapping_retried.contains(&event.event_id) =>
            {
                debug!(entity_id = %event.entity_id, "Retrying unmappable event once");
                if self.mapping_retried.len() >= MAPPING_RETRY_CAPACITY {
                    self.mapping_retried.clear();
                }
                self.mapping_retried.insert(event.event_id);
                handle.nack(Duration::ZERO).await
            }
            ItemOutcome::Failed(e) if e.is_retryable() => {
                handle.nack(self.redelivery_delay(event.attempt_count)).await
            }
            ItemOutcome::Failed(e) => {
                self.mapping_retried.remove(&event.event_id);
                error!(
                    entity_id = %event.entity_id,
                    event_id = %event.event_id,
                    error = %e,
                    "Dead-lettering event"
                );
                handle.dead_letter(&event, &e.to_string()).await
            }
        };

        if let Err(e) = result {
            warn!(event_id = %event.event_id, error = %e, "Failed to settle delivery");
        }
    }

    fn lost_search(&self) {
        self.state.send_modify(|s| {
            s.is_connected_to_search_engine = false;
            s.record_failure();
        });
        self.warn_if_degraded();
    }

    fn warn_if_degraded(&self) {
        let state = self.state.borrow();
        if state.is_degraded(self.config.degraded_threshold) {
            warn!(
                consecutive_failures = state.consecutive_failures,
                "Sync is degraded, search results may be stale"
            );
        }
    }

    /// Hold off pulling until the search engine passes a health check.
    /// Returns `false` if shutdown arrives first.
    async fn wait_for_search(&self) -> bool {
        info!("Search engine unavailable, holding events in the queue");
        let mut shutdown = self.shutdown.clone();
        let mut checks: u32 = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.redelivery_delay(checks)) => {}
                _ = shutdown.wait_for(|s| *s) => return false,
            }

            match self.indexer.client().health().await {
                Ok(health) if health.is_available() => {
                    info!(checks, "Search engine reachable, resuming tailing");
                    self.state.send_modify(|s| s.is_connected_to_search_engine = true);
                    return true;
                }
                Ok(health) => debug!(?health, "Search engine still unavailable"),
                Err(e) => debug!(error = %e, "Search engine still unreachable"),
            }
            checks = checks.saturating_add(1);
        }
    }

    fn redelivery_delay(&self, attempt_count: u32) -> Duration {
        self.config.redelivery_backoff.delay(attempt_count)
    }
}
