//! Postgres implementations of the primary datastore reader and the outbox.

mod outbox;
mod reader;

pub use outbox::{PostgresOutbox, DEFAULT_OUTBOX_TABLE};
pub use reader::PostgresPrimaryStore;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::errors::StoreError;

/// Open a connection pool to the primary datastore.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| StoreError::connection(e.to_string()))?;

    info!(max_connections = max_connections, "Connected to primary datastore");
    Ok(pool)
}

/// Validate a (optionally schema-qualified) SQL identifier before it is
/// interpolated into a query.
pub(crate) fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .next()
                    .map(|c| c.is_ascii_alphabetic() || c == '_')
                    .unwrap_or(false)
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidConfig(format!(
            "invalid SQL identifier: {:?}",
            name
        )))
    }
}
