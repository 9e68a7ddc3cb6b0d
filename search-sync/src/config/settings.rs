//! Settings read from the environment.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use search_sync_repository::postgres::DEFAULT_OUTBOX_TABLE;

use crate::SyncError;

/// Default OpenSearch URL.
const DEFAULT_OPENSEARCH_URL: &str = "http://localhost:9200";

/// Default search index name.
const DEFAULT_SEARCH_INDEX: &str = "listings";

/// Default Kafka broker address.
const DEFAULT_KAFKA_BROKER: &str = "localhost:9092";

/// Default Kafka consumer group ID.
const DEFAULT_KAFKA_GROUP_ID: &str = "search-sync";

/// Default change event topic.
const DEFAULT_KAFKA_TOPIC: &str = "search.change-events";

const DEFAULT_SOURCE_TABLE: &str = "listings";
const DEFAULT_ENTITY_TYPE: &str = "listing";
const DEFAULT_CHECKPOINT_PATH: &str = ".search-sync/migration.json";

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_QUEUE_PROCESSOR_INTERVAL_MS: u64 = 5_000;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MIGRATION_PAGE_SIZE: usize = 500;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_HARD_EXIT_TIMEOUT_MS: u64 = 15_000;

/// Everything the service reads from its environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub opensearch_url: String,
    pub search_index: String,
    pub kafka_broker: String,
    pub kafka_group_id: String,
    pub kafka_topic: String,
    pub database_url: String,
    pub db_max_connections: u32,
    pub source_table: String,
    pub entity_type: String,
    pub outbox_table: String,
    pub queue_processor_interval: Duration,
    pub batch_size: usize,
    pub max_retry_attempts: u32,
    pub visibility_timeout: Duration,
    pub migration_page_size: usize,
    pub checkpoint_path: PathBuf,
    pub continue_without_search: bool,
    pub shutdown_timeout: Duration,
    /// Exit regardless of progress this long after a shutdown signal.
    /// Always longer than `shutdown_timeout`.
    pub hard_exit_timeout: Duration,
    pub run_migration_on_start: bool,
}

impl Settings {
    /// Read settings from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: Primary datastore connection string (required)
    /// - `OPENSEARCH_URL`: OpenSearch server URL (default: http://localhost:9200)
    /// - `SEARCH_INDEX`: Index name (default: listings)
    /// - `KAFKA_BROKER`: Kafka broker address (default: localhost:9092)
    /// - `KAFKA_GROUP_ID`: Consumer group ID (default: search-sync)
    /// - `KAFKA_TOPIC`: Change event topic (default: search.change-events)
    /// - `SOURCE_TABLE` / `ENTITY_TYPE`: Records to migrate (default: listings / listing)
    /// - `QUEUE_PROCESSOR_INTERVAL_MS`, `BATCH_SIZE`, `MAX_RETRY_ATTEMPTS`,
    ///   `VISIBILITY_TIMEOUT_MS`, `MIGRATION_PAGE_SIZE`, `SHUTDOWN_TIMEOUT_MS`
    /// - `HARD_EXIT_MS`: Exit bound after a shutdown signal, must exceed `SHUTDOWN_TIMEOUT_MS`
    /// - `CHECKPOINT_PATH`, `CONTINUE_WITHOUT_SEARCH`, `RUN_MIGRATION_ON_START`
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read settings through `lookup`, which returns the raw value of a variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| SyncError::config("DATABASE_URL must be set"))?;

        let shutdown_timeout = Duration::from_millis(parse(
            &lookup,
            "SHUTDOWN_TIMEOUT_MS",
            DEFAULT_SHUTDOWN_TIMEOUT_MS,
        )?);
        let hard_exit_timeout =
            Duration::from_millis(parse(&lookup, "HARD_EXIT_MS", DEFAULT_HARD_EXIT_TIMEOUT_MS)?);
        if hard_exit_timeout <= shutdown_timeout {
            return Err(SyncError::config(format!(
                "HARD_EXIT_MS ({}) must be greater than SHUTDOWN_TIMEOUT_MS ({})",
                hard_exit_timeout.as_millis(),
                shutdown_timeout.as_millis()
            )));
        }

        Ok(Self {
            opensearch_url: text("OPENSEARCH_URL", DEFAULT_OPENSEARCH_URL),
            search_index: text("SEARCH_INDEX", DEFAULT_SEARCH_INDEX),
            kafka_broker: text("KAFKA_BROKER", DEFAULT_KAFKA_BROKER),
            kafka_group_id: text("KAFKA_GROUP_ID", DEFAULT_KAFKA_GROUP_ID),
            kafka_topic: text("KAFKA_TOPIC", DEFAULT_KAFKA_TOPIC),
            database_url,
            db_max_connections: parse(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
            source_table: text("SOURCE_TABLE", DEFAULT_SOURCE_TABLE),
            entity_type: text("ENTITY_TYPE", DEFAULT_ENTITY_TYPE),
            outbox_table: text("OUTBOX_TABLE", DEFAULT_OUTBOX_TABLE),
            queue_processor_interval: Duration::from_millis(parse(
                &lookup,
                "QUEUE_PROCESSOR_INTERVAL_MS",
                DEFAULT_QUEUE_PROCESSOR_INTERVAL_MS,
            )?),
            batch_size: positive(parse(&lookup, "BATCH_SIZE", DEFAULT_BATCH_SIZE)?, "BATCH_SIZE")?,
            max_retry_attempts: parse(&lookup, "MAX_RETRY_ATTEMPTS", DEFAULT_MAX_RETRY_ATTEMPTS)?,
            visibility_timeout: Duration::from_millis(parse(
                &lookup,
                "VISIBILITY_TIMEOUT_MS",
                DEFAULT_VISIBILITY_TIMEOUT_MS,
            )?),
            migration_page_size: positive(
                parse(&lookup, "MIGRATION_PAGE_SIZE", DEFAULT_MIGRATION_PAGE_SIZE)?,
                "MIGRATION_PAGE_SIZE",
            )?,
            checkpoint_path: PathBuf::from(text("CHECKPOINT_PATH", DEFAULT_CHECKPOINT_PATH)),
            continue_without_search: flag(&lookup, "CONTINUE_WITHOUT_SEARCH", true)?,
            shutdown_timeout,
            hard_exit_timeout,
            run_migration_on_start: flag(&lookup, "RUN_MIGRATION_ON_START", false)?,
        })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, SyncError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SyncError::config(format!("{} has an invalid value: {:?}", key, raw))),
    }
}

fn positive(value: usize, key: &str) -> Result<usize, SyncError> {
    if value == 0 {
        return Err(SyncError::config(format!("{} must be greater than zero", key)));
    }
    Ok(value)
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool, SyncError> {
    match lookup(key).as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(SyncError::config(format!("{} must be a boolean, got {:?}", key, v))),
        },
    }
}
