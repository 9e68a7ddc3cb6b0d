//! In-memory reindex outbox.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::StoreError;
use crate::interfaces::OutboxStore;
use search_sync_shared::{OutboxJob, OutboxJobKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

/// Outbox held in memory, with the same status lifecycle as the Postgres table.
pub struct InMemoryOutbox {
    jobs: Mutex<BTreeMap<i64, (OutboxJob, JobStatus)>>,
    next_id: AtomicI64,
    max_attempts: u32,
    fetch_delay: Option<Duration>,
}

impl InMemoryOutbox {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            jobs: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            max_attempts: max_attempts.max(1),
            fetch_delay: None,
        }
    }

    /// Make every `fetch_pending` call take at least `delay`.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// Enqueue a job and return its id.
    pub async fn push(
        &self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        kind: OutboxJobKind,
    ) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let job = OutboxJob::new(id, entity_type, entity_id, kind);
        self.jobs.lock().await.insert(id, (job, JobStatus::Pending));
        id
    }

    pub async fn pending_count(&self) -> usize {
        self.count(JobStatus::Pending).await
    }

    pub async fn completed_count(&self) -> usize {
        self.count(JobStatus::Done).await
    }

    /// Jobs parked after running out of attempts.
    pub async fn failed_jobs(&self) -> Vec<OutboxJob> {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|(_, s)| *s == JobStatus::Failed)
            .map(|(j, _)| j.clone())
            .collect()
    }

    pub async fn job(&self, id: i64) -> Option<OutboxJob> {
        self.jobs.lock().await.get(&id).map(|(j, _)| j.clone())
    }

    async fn count(&self, status: JobStatus) -> usize {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|(_, s)| *s == status)
            .count()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxJob>, StoreError> {
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }

        let mut jobs = self.jobs.lock().await;
        let claimed: Vec<OutboxJob> = jobs
            .values_mut()
            .filter(|(_, s)| *s == JobStatus::Pending)
            .take(limit)
            .map(|(job, status)| {
                *status = JobStatus::Processing;
                job.clone()
            })
            .collect();

        Ok(claimed)
    }

    async fn complete(&self, job_id: i64) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&job_id) {
            Some((job, status)) => {
                *status = JobStatus::Done;
                job.last_error = None;
                Ok(())
            }
            None => Err(StoreError::query(format!("unknown outbox job {}", job_id))),
        }
    }

    async fn fail(&self, job_id: i64, error: &str) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&job_id) {
            Some((job, status)) => {
                job.attempts += 1;
                job.last_error = Some(error.to_string());
                *status = if job.attempts >= self.max_attempts {
                    JobStatus::Failed
                } else {
                    JobStatus::Pending
                };
                Ok(())
            }
            None => Err(StoreError::query(format!("unknown outbox job {}", job_id))),
        }
    }
}
