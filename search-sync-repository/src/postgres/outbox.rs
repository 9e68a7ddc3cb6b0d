//! Reindex outbox backed by a Postgres table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info, warn};

use super::validate_identifier;
use crate::errors::StoreError;
use crate::interfaces::OutboxStore;
use search_sync_shared::{OutboxJob, OutboxJobKind};

/// Default outbox table name.
pub const DEFAULT_OUTBOX_TABLE: &str = "search_reindex_outbox";

/// Claims older than this are considered abandoned and picked up again.
const CLAIM_TIMEOUT_SECS: i64 = 300;

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    entity_type: String,
    entity_id: String,
    kind: String,
    requested_at: DateTime<Utc>,
    attempts: i32,
    last_error: Option<String>,
}

impl TryFrom<OutboxRow> for OutboxJob {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let kind = OutboxJobKind::parse(&row.kind)
            .ok_or_else(|| StoreError::decode(format!("unknown outbox job kind {:?}", row.kind)))?;

        Ok(OutboxJob {
            id: row.id,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            kind,
            requested_at: row.requested_at,
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
        })
    }
}

/// Outbox of reindex requests written by the admin surface.
///
/// Rows move `pending -> processing -> done`, or back to `pending` on
/// failure until `max_attempts` is reached, after which they are parked as
/// `failed` for manual inspection.
#[derive(Clone)]
pub struct PostgresOutbox {
    pool: PgPool,
    table: String,
    max_attempts: u32,
}

impl PostgresOutbox {
    /// Create an outbox over `table`.
    pub fn new(pool: PgPool, table: impl Into<String>, max_attempts: u32) -> Result<Self, StoreError> {
        let table = table.into();
        validate_identifier(&table)?;

        Ok(Self {
            pool,
            table,
            max_attempts: max_attempts.max(1),
        })
    }

    /// Create the outbox table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'reindex',
                requested_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INT NOT NULL DEFAULT 0,
                last_error TEXT,
                claimed_at TIMESTAMPTZ,
                processed_at TIMESTAMPTZ
            )
            "#,
            self.table
        );
        sqlx::query(&sql).execute(&self.pool).await?;

        info!(table = %self.table, "Outbox schema ready");
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresOutbox {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxJob>, StoreError> {
        // Claim in a single statement; SKIP LOCKED lets several processes
        // drain the same table without handing out a job twice.
        let sql = format!(
            r#"
            UPDATE {table} SET status = 'processing', claimed_at = now()
            WHERE id IN (
                SELECT id FROM {table}
                WHERE status = 'pending'
                   OR (status = 'processing' AND claimed_at < now() - make_interval(secs => $2))
                ORDER BY id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, entity_type, entity_id, kind, requested_at, attempts, last_error
            "#,
            table = self.table
        );

        let rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(limit as i64)
            .bind(CLAIM_TIMEOUT_SECS as f64)
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            match OutboxJob::try_from(row) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!(job_id = id, error = %e, "Discarding undecodable outbox job");
                    self.fail(id, &e.to_string()).await?;
                }
            }
        }
        jobs.sort_by_key(|j| j.id);

        debug!(count = jobs.len(), "Claimed outbox jobs");
        Ok(jobs)
    }

    async fn complete(&self, job_id: i64) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET status = 'done', processed_at = now(), last_error = NULL WHERE id = $1",
            self.table
        );
        sqlx::query(&sql).bind(job_id).execute(&self.pool).await?;
        Ok(())
    }

    async fn fail(&self, job_id: i64, error: &str) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE {} SET
                attempts = attempts + 1,
                last_error = $2,
                claimed_at = NULL,
                status = CASE WHEN attempts + 1 >= $3 THEN 'failed' ELSE 'pending' END
            WHERE id = $1
            "#,
            self.table
        );
        sqlx::query(&sql)
            .bind(job_id)
            .bind(error)
            .bind(self.max_attempts as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
