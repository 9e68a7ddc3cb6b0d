//! Primary datastore reader backed by a Postgres table.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, instrument};

use super::validate_identifier;
use crate::errors::StoreError;
use crate::interfaces::PrimaryStoreReader;
use search_sync_shared::{Page, SourceRecord};

/// Row shape shared by the page and single-record queries.
#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    entity_id: String,
    version: i64,
    payload: serde_json::Value,
}

/// Reads records of one entity type from a Postgres table.
///
/// The table must have an `id` primary key and an `updated_at` timestamp;
/// the whole row is projected with `to_jsonb` as the event payload and
/// `updated_at` in epoch milliseconds is used as the source version.
#[derive(Clone)]
pub struct PostgresPrimaryStore {
    pool: PgPool,
    table: String,
    entity_type: String,
}

impl PostgresPrimaryStore {
    /// Create a reader over `table`, tagging records with `entity_type`.
    pub fn new(
        pool: PgPool,
        table: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let table = table.into();
        validate_identifier(&table)?;

        Ok(Self {
            pool,
            table,
            entity_type: entity_type.into(),
        })
    }

    fn record_from_row(&self, row: RecordRow) -> SourceRecord {
        SourceRecord {
            entity_type: self.entity_type.clone(),
            entity_id: row.entity_id,
            version: row.version.max(0) as u64,
            payload: row.payload,
        }
    }
}

#[async_trait]
impl PrimaryStoreReader for PostgresPrimaryStore {
    #[instrument(skip(self), fields(table = %self.table))]
    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page, StoreError> {
        // Keyset pagination on the text form of the id keeps the order stable
        // across pages regardless of the id column type.
        let sql = format!(
            r#"
            SELECT
                t.id::text AS entity_id,
                (EXTRACT(EPOCH FROM t.updated_at) * 1000)::bigint AS version,
                to_jsonb(t) AS payload
            FROM {} t
            WHERE $1::text IS NULL OR t.id::text > $1::text
            ORDER BY t.id::text
            LIMIT $2
            "#,
            self.table
        );

        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(cursor)
            .bind(page_size as i64)
            .fetch_all(&self.pool)
            .await?;

        let records: Vec<SourceRecord> = rows.into_iter().map(|r| self.record_from_row(r)).collect();
        let next_cursor = if records.len() == page_size {
            records.last().map(|r| r.entity_id.clone())
        } else {
            None
        };

        debug!(count = records.len(), has_more = next_cursor.is_some(), "Fetched page");
        Ok(Page {
            records,
            next_cursor,
        })
    }

    async fn fetch_record(&self, entity_id: &str) -> Result<Option<SourceRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT
                t.id::text AS entity_id,
                (EXTRACT(EPOCH FROM t.updated_at) * 1000)::bigint AS version,
                to_jsonb(t) AS payload
            FROM {} t
            WHERE t.id::text = $1
            "#,
            self.table
        );

        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| self.record_from_row(r)))
    }
}
