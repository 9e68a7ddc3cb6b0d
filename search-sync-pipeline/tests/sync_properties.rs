//! End-to-end properties of the sync pipeline against in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use search_sync_pipeline::indexer::{ApplyOutcome, Indexer, ItemOutcome, SkipReason};
use search_sync_pipeline::orchestrator::{InMemoryCheckpointStore, Orchestrator, OrchestratorConfig};
use search_sync_pipeline::queue::{ChangeEventQueue, InMemoryBroker, QueueBroker, QueueConfig};
use search_sync_pipeline::retry::Backoff;
use search_sync_repository::{InMemoryPrimaryStore, InMemorySearchEngine, SearchEngineClient};
use search_sync_shared::{ChangeEvent, DocumentKey, OrchestratorState};
use serde_json::json;

fn listing(id: &str) -> DocumentKey {
    DocumentKey::new("listing", id)
}

#[tokio::test]
async fn idempotent_reapplication() {
    let engine = Arc::new(InMemorySearchEngine::new());
    let indexer = Indexer::new(engine.clone());
    let event = ChangeEvent::upsert("listing", "L1", json!({"title": "Chair", "price": 40}), 7);

    assert_eq!(indexer.apply_event(event.clone()).await.unwrap(), ApplyOutcome::Applied);
    let before = engine.get_document(&listing("L1")).await.unwrap();

    let again = indexer.apply_event(event).await.unwrap();

    assert!(matches!(again, ApplyOutcome::Skipped(SkipReason::Stale { current_version: 7 })));
    assert_eq!(engine.get_document(&listing("L1")).await.unwrap(), before);
    assert_eq!(engine.mutation_count(), 1);
}

#[tokio::test]
async fn out_of_order_delivery_keeps_newest() {
    let engine = Arc::new(InMemorySearchEngine::new());
    let indexer = Indexer::new(engine.clone());

    indexer
        .apply_event(ChangeEvent::upsert("listing", "L1", json!({"title": "Newer"}), 5))
        .await
        .unwrap();
    let outcome = indexer
        .apply_event(ChangeEvent::upsert("listing", "L1", json!({"title": "Older"}), 3))
        .await
        .unwrap();

    assert!(matches!(outcome, ApplyOutcome::Skipped(_)));
    let doc = engine.get_document(&listing("L1")).await.unwrap().unwrap();
    assert_eq!(doc.title, "Newer");
}

#[tokio::test]
async fn delete_wins_version_tie_in_either_order() {
    for delete_first in [false, true] {
        let engine = Arc::new(InMemorySearchEngine::new());
        let indexer = Indexer::new(engine.clone());
        let upsert = ChangeEvent::upsert("listing", "L1", json!({"title": "Chair"}), 10);
        let delete = ChangeEvent::delete("listing", "L1", 10);

        let (first, second) = if delete_first { (delete, upsert) } else { (upsert, delete) };
        indexer.apply_event(first).await.unwrap();
        indexer.apply_event(second).await.unwrap();

        assert!(
            engine.get_document(&listing("L1")).await.unwrap().is_none(),
            "delete_first={}",
            delete_first
        );
    }
}

#[tokio::test]
async fn batch_collapses_to_one_mutation() {
    let engine = Arc::new(InMemorySearchEngine::new());
    let indexer = Indexer::new(engine.clone());
    let events: Vec<ChangeEvent> = (1..=3)
        .map(|v| ChangeEvent::upsert("listing", "L1", json!({"title": format!("v{}", v)}), v))
        .collect();
    let winner = events[2].event_id;

    let report = indexer.apply_batch(events).await.unwrap();

    assert_eq!(engine.mutation_count(), 1);
    assert_eq!(report.applied_count(), 1);
    assert_eq!(report.skipped_count(), 2);
    assert!(matches!(report.outcome_of(winner), Some(ItemOutcome::Applied)));
    let doc = engine.get_document(&listing("L1")).await.unwrap().unwrap();
    assert_eq!(doc.title, "v3");
    assert_eq!(doc.source_version, 3);
}

struct Pipeline {
    broker: Arc<InMemoryBroker>,
    engine: Arc<InMemorySearchEngine>,
    store: Arc<InMemoryPrimaryStore>,
    queue: Arc<ChangeEventQueue>,
    orchestrator: Orchestrator,
}

fn pipeline(checkpoints: Arc<InMemoryCheckpointStore>) -> Pipeline {
    let broker = Arc::new(InMemoryBroker::new());
    let engine = Arc::new(InMemorySearchEngine::new());
    let store = Arc::new(InMemoryPrimaryStore::new("listing"));
    let queue = Arc::new(ChangeEventQueue::new(
        broker.clone(),
        QueueConfig {
            poll_interval: Duration::from_millis(10),
            backoff: Backoff::constant(Duration::from_millis(5)),
            ..QueueConfig::default()
        },
    ));
    let orchestrator = Orchestrator::new(
        queue.clone(),
        Arc::new(Indexer::new(engine.clone())),
        store.clone(),
        checkpoints,
        OrchestratorConfig {
            batch_linger: Duration::from_millis(20),
            migration_page_size: 4,
            startup_backoff: Backoff::constant(Duration::from_millis(5)),
            startup_attempts: 2,
            redelivery_backoff: Backoff::constant(Duration::from_millis(5)),
            ..OrchestratorConfig::default()
        },
    );
    Pipeline {
        broker,
        engine,
        store,
        queue,
        orchestrator,
    }
}

async fn drained(broker: &InMemoryBroker) {
    while !broker.is_empty().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn migration_resumes_to_same_state_as_uninterrupted_run() {
    let seed = |store: Arc<InMemoryPrimaryStore>| async move {
        for i in 0..10 {
            store
                .insert(format!("L{:02}", i), i + 1, json!({"title": format!("Item {}", i)}))
                .await;
        }
    };

    let reference = pipeline(Arc::new(InMemoryCheckpointStore::new()));
    seed(reference.store.clone()).await;
    reference.orchestrator.initialize().await.unwrap();
    reference.orchestrator.initial_data_migration().await.unwrap();

    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let interrupted = pipeline(checkpoints.clone());
    seed(interrupted.store.clone()).await;
    interrupted.orchestrator.initialize().await.unwrap();
    interrupted.store.fail_after_pages(1);
    assert!(interrupted.orchestrator.initial_data_migration().await.is_err());

    interrupted.store.heal();
    let report = interrupted.orchestrator.initial_data_migration().await.unwrap();

    assert!(report.resumed);
    assert_eq!(report.total_migrated, 10);
    assert_eq!(interrupted.engine.documents().await, reference.engine.documents().await);
    // Pages of the first attempt are not written again.
    assert_eq!(interrupted.engine.mutation_count(), 10);
}

#[tokio::test(start_paused = true)]
async fn queued_upsert_then_delete_reaches_index() {
    let p = pipeline(Arc::new(InMemoryCheckpointStore::new()));
    p.orchestrator.initialize().await.unwrap();
    p.orchestrator.start_tailing().await.unwrap();

    p.queue
        .publish(ChangeEvent::upsert("listing", "L1", json!({"title": "Chair"}), 1))
        .await
        .unwrap();
    drained(&p.broker).await;

    let doc = p.engine.get_document(&listing("L1")).await.unwrap().unwrap();
    assert_eq!(doc.title, "Chair");

    p.queue
        .publish(ChangeEvent::delete("listing", "L1", 2))
        .await
        .unwrap();
    drained(&p.broker).await;

    assert!(p.engine.get_document(&listing("L1")).await.unwrap().is_none());
    assert!(p.broker.dead_letters().await.is_empty());

    p.orchestrator.shutdown().await.unwrap();
    assert_eq!(p.orchestrator.state(), OrchestratorState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn failing_item_is_redelivered_without_blocking_siblings() {
    let p = pipeline(Arc::new(InMemoryCheckpointStore::new()));
    p.orchestrator.initialize().await.unwrap();
    p.engine.fail_key(listing("L2")).await;
    p.orchestrator.start_tailing().await.unwrap();

    for id in ["L1", "L2", "L3"] {
        p.queue
            .publish(ChangeEvent::upsert("listing", id, json!({"title": id}), 1))
            .await
            .unwrap();
    }
    while p.engine.live_count().await < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(p.engine.get_document(&listing("L2")).await.unwrap().is_none());

    p.engine.clear_failures().await;
    drained(&p.broker).await;

    assert_eq!(p.engine.live_count().await, 3);
    p.orchestrator.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unmappable_event_is_dead_lettered() {
    let p = pipeline(Arc::new(InMemoryCheckpointStore::new()));
    p.orchestrator.initialize().await.unwrap();
    p.orchestrator.start_tailing().await.unwrap();

    p.queue
        .publish(ChangeEvent::upsert("listing", "L1", json!(["not", "an", "object"]), 1))
        .await
        .unwrap();
    p.queue
        .publish(ChangeEvent::upsert("listing", "L2", json!({"title": "Lamp"}), 1))
        .await
        .unwrap();
    drained(&p.broker).await;

    let dead = p.broker.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event.entity_id, "L1");
    assert_eq!(p.engine.live_count().await, 1);
    p.orchestrator.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn search_outage_holds_events_without_spending_attempts() {
    let p = pipeline(Arc::new(InMemoryCheckpointStore::new()));
    p.orchestrator.initialize().await.unwrap();
    p.orchestrator.start_tailing().await.unwrap();

    p.engine.set_unreachable(true);
    p.queue
        .publish(ChangeEvent::upsert("listing", "L1", json!({"title": "Chair"}), 1))
        .await
        .unwrap();
    // Far longer than the redelivery schedule allows for five attempts.
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(p.broker.len().await, 1);
    assert!(p.broker.dead_letters().await.is_empty());
    assert!(!p.orchestrator.sync_state().is_connected_to_search_engine);

    p.engine.set_unreachable(false);
    drained(&p.broker).await;

    assert_eq!(p.engine.live_count().await, 1);
    assert!(p.broker.dead_letters().await.is_empty());
    assert!(p.orchestrator.sync_state().is_connected_to_search_engine);
    p.orchestrator.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unmappable_redelivered_event_still_gets_one_retry() {
    let p = pipeline(Arc::new(InMemoryCheckpointStore::new()));
    p.orchestrator.initialize().await.unwrap();
    p.orchestrator.start_tailing().await.unwrap();

    let mut event = ChangeEvent::upsert("listing", "L1", json!([1]), 1);
    event.attempt_count = 2;
    p.broker.send(&event).await.unwrap();

    while p.broker.dead_letters().await.is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let dead = p.broker.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event.attempt_count, 3);
    drained(&p.broker).await;
    p.orchestrator.shutdown().await.unwrap();
}
