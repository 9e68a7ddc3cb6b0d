//! Outbox store trait definition.

use async_trait::async_trait;

use crate::errors::StoreError;
use search_sync_shared::OutboxJob;

/// Persisted queue of out-of-band reindex requests.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` pending jobs, oldest first.
    ///
    /// A claimed job is not returned again until it is failed or its claim
    /// expires.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxJob>, StoreError>;

    /// Mark a job as done.
    async fn complete(&self, job_id: i64) -> Result<(), StoreError>;

    /// Record a failed attempt. The job becomes pending again until it runs
    /// out of attempts.
    async fn fail(&self, job_id: i64, error: &str) -> Result<(), StoreError>;
}
