//! Conversation lock behavior across concurrent callers

use std::sync::Arc;
use std::time::Duration;

use chatbot_storage::document::{Capabilities, DocumentEngine, MemoryEngine};
use chatbot_storage::error::CONFLICT_CODE;
use chatbot_storage::prelude::*;
use serde_json::json;

fn cold_storage_on(engine: Arc<MemoryEngine>, dialect: Dialect) -> Arc<StateStorage> {
    let storage = StateStorage::new(
        engine as Arc<dyn DocumentEngine>,
        dialect,
        Arc::new(HealthMonitor::noop()),
        StateConfig::default(),
    )
    .unwrap();
    Arc::new(storage)
}

async fn storage_on(engine: Arc<MemoryEngine>, dialect: Dialect) -> Arc<StateStorage> {
    let storage = cold_storage_on(engine, dialect);
    storage.pre_heat().await.unwrap();
    storage
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_one_concurrent_caller_gets_the_lock() {
    let storage = storage_on(Arc::new(MemoryEngine::new()), Dialect::Standard).await;

    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                storage
                    .get_or_create_and_lock("u1", "p1", json!({}), Some(60_000))
                    .await
            })
        })
        .collect();

    let mut winners = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert_eq!(e.code(), Some(CONFLICT_CODE), "unexpected error: {}", e),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn lock_is_released_by_time_or_by_saving() {
    let storage = storage_on(Arc::new(MemoryEngine::new()), Dialect::Standard).await;

    let first = storage
        .get_or_create_and_lock("u1", "p1", json!({}), Some(100))
        .await
        .unwrap();
    assert_eq!(first.state, json!({}));

    let err = storage
        .get_or_create_and_lock("u1", "p1", json!({}), Some(100))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err.code(), Some(CONFLICT_CODE));

    tokio::time::sleep(Duration::from_millis(120)).await;
    let mut third = storage
        .get_or_create_and_lock("u1", "p1", json!({ "ignored": true }), Some(100))
        .await
        .unwrap();
    assert_eq!(third.state, json!({}));

    third.state = json!({ "step": 2 });
    third.touch(chrono::Utc::now().timestamp_millis());
    storage.save_state(third).await.unwrap();

    let fourth = storage
        .get_or_create_and_lock("u1", "p1", json!({}), Some(60_000))
        .await
        .unwrap();
    assert_eq!(fourth.state, json!({ "step": 2 }));
    assert!(fourth.last_interaction.is_some());
}

#[tokio::test]
async fn fresh_lock_holds_for_the_whole_timeout() {
    let storage = storage_on(Arc::new(MemoryEngine::new()), Dialect::Standard).await;
    storage
        .get_or_create_and_lock("u1", "p1", json!({}), None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(storage
        .get_or_create_and_lock("u1", "p1", json!({}), Some(60_000))
        .await
        .unwrap_err()
        .is_conflict());
    storage
        .get_or_create_and_lock("u1", "p1", json!({}), Some(10))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn degraded_backend_converges_to_one_record() {
    let engine = Arc::new(MemoryEngine::with_capabilities(Capabilities::restricted()));
    let storage = storage_on(Arc::clone(&engine), Dialect::Restricted).await;
    assert!(storage.collection().unique_unavailable());

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                storage
                    .get_or_create_and_lock("u1", "p1", json!({}), Some(60_000))
                    .await
            })
        })
        .collect();
    for attempt in attempts {
        if let Err(e) = attempt.await.unwrap() {
            assert!(e.is_conflict(), "unexpected error: {}", e);
        }
    }

    // the cleanup is not atomic: racing callers may all lose, never more than one record survives
    let collection = storage.collection().handle(Access::Read).await.unwrap();
    let survivors = collection
        .count(&Filter::eq("senderId", "u1").and(Filter::eq("pageId", "p1")))
        .await
        .unwrap();
    assert!(survivors <= 1, "{} records survived", survivors);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn degraded_backend_keeps_the_lock_exclusive_from_first_access() {
    for _ in 0..16 {
        let engine = Arc::new(MemoryEngine::with_capabilities(Capabilities::restricted()));
        let storage = cold_storage_on(engine, Dialect::Restricted);

        let attempts: Vec<_> = (0..4)
            .map(|_| {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move {
                    storage
                        .get_or_create_and_lock("u1", "p1", json!({}), Some(60_000))
                        .await
                })
            })
            .collect();

        let mut winners = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(e.is_conflict(), "unexpected error: {}", e),
            }
        }
        assert!(winners <= 1, "{} lockers won", winners);

        let collection = storage.collection().handle(Access::Read).await.unwrap();
        let records = collection
            .count(&Filter::eq("senderId", "u1").and(Filter::eq("pageId", "p1")))
            .await
            .unwrap();
        assert!(records <= 1, "{} records survived", records);
    }
}
