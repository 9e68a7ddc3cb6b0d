//! Dependency initialization and wiring for the sync service.

use std::sync::Arc;

use search_sync_pipeline::indexer::Indexer;
use search_sync_pipeline::orchestrator::{FileCheckpointStore, Orchestrator, OrchestratorConfig};
use search_sync_pipeline::queue::{ChangeEventQueue, KafkaBroker, KafkaBrokerConfig, QueueConfig};
use search_sync_pipeline::queue_processor::{QueueProcessor, QueueProcessorConfig};
use search_sync_repository::{
    postgres, OpenSearchClient, PostgresOutbox, PostgresPrimaryStore, SearchIndexConfig,
};
use tracing::info;

use super::Settings;
use crate::SyncError;

/// Container for all initialized dependencies.
///
/// Built once at startup and handed to whoever needs a component; nothing is
/// looked up globally.
pub struct Dependencies {
    pub orchestrator: Arc<Orchestrator>,
    pub queue_processor: QueueProcessor,
}

impl Dependencies {
    /// Construct every component from `settings`.
    ///
    /// Only the database pool connects eagerly. The search engine and the
    /// broker are probed later by `Orchestrator::initialize`, which applies
    /// the degraded-startup policy.
    pub async fn new(settings: &Settings) -> Result<Self, SyncError> {
        info!(
            opensearch_url = %settings.opensearch_url,
            index = %settings.search_index,
            kafka_broker = %settings.kafka_broker,
            kafka_topic = %settings.kafka_topic,
            source_table = %settings.source_table,
            "Initializing dependencies"
        );

        let search_client = OpenSearchClient::new(
            &settings.opensearch_url,
            SearchIndexConfig::new(settings.search_index.clone()),
        )
        .await?;
        let indexer = Arc::new(Indexer::new(Arc::new(search_client)));

        let pool = postgres::connect(&settings.database_url, settings.db_max_connections).await?;
        let reader = Arc::new(PostgresPrimaryStore::new(
            pool.clone(),
            settings.source_table.clone(),
            settings.entity_type.clone(),
        )?);
        let outbox = PostgresOutbox::new(pool, settings.outbox_table.clone(), settings.max_retry_attempts)?;
        outbox.ensure_schema().await?;

        let broker = KafkaBroker::new(&KafkaBrokerConfig {
            brokers: settings.kafka_broker.clone(),
            group_id: settings.kafka_group_id.clone(),
            topic: settings.kafka_topic.clone(),
            visibility_timeout: settings.visibility_timeout,
        })?;
        info!("Kafka broker created");

        let queue = Arc::new(ChangeEventQueue::new(
            Arc::new(broker),
            QueueConfig {
                max_attempts: settings.max_retry_attempts,
                visibility_timeout: settings.visibility_timeout,
                receive_batch: settings.batch_size,
                ..QueueConfig::default()
            },
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            queue,
            indexer.clone(),
            reader.clone(),
            Arc::new(FileCheckpointStore::new(settings.checkpoint_path.clone())),
            OrchestratorConfig {
                batch_size: settings.batch_size,
                migration_page_size: settings.migration_page_size,
                continue_without_search: settings.continue_without_search,
                shutdown_timeout: settings.shutdown_timeout,
                ..OrchestratorConfig::default()
            },
        ));

        let queue_processor = QueueProcessor::new(
            Arc::new(outbox),
            reader,
            indexer,
            QueueProcessorConfig {
                page_size: settings.batch_size,
            },
        );

        Ok(Self {
            orchestrator,
            queue_processor,
        })
    }
}
