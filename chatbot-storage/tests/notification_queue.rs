//! Task queue claiming and deduplication

use std::collections::HashSet;
use std::sync::Arc;

use chatbot_storage::document::{Capabilities, DocumentEngine, MemoryEngine};
use chatbot_storage::prelude::*;

fn storage_on(engine: Arc<MemoryEngine>, dialect: Dialect) -> NotificationsStorage {
    NotificationsStorage::new(
        engine as Arc<dyn DocumentEngine>,
        dialect,
        Arc::new(HealthMonitor::noop()),
        "test-",
    )
    .unwrap()
}

fn tasks(count: usize, enqueue: i64) -> Vec<Task> {
    (0..count)
        .map(|i| Task::new("campaign", format!("sender-{}", i), "page", enqueue + i as i64))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_poppers_split_the_queue() {
    let storage = Arc::new(storage_on(Arc::new(MemoryEngine::new()), Dialect::Standard));
    storage.pre_heat().await.unwrap();
    storage.push_tasks(tasks(40, 1_000)).await.unwrap();

    let poppers: Vec<_> = (0..2)
        .map(|_| {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move { storage.pop_tasks(40, Some(10_000)).await })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for popper in poppers {
        for task in popper.await.unwrap().unwrap() {
            total += 1;
            seen.insert(task.id.unwrap());
        }
    }
    assert_eq!(total, 40);
    assert_eq!(seen.len(), 40);
    assert!(storage.pop_tasks(40, Some(10_000)).await.unwrap().is_empty());
}

#[tokio::test]
async fn pushing_the_same_task_twice_keeps_one_record() {
    for (engine, dialect) in [
        (MemoryEngine::new(), Dialect::Standard),
        (MemoryEngine::with_capabilities(Capabilities::restricted()), Dialect::Restricted),
    ] {
        let storage = storage_on(Arc::new(engine), dialect);
        storage.pre_heat().await.unwrap();

        let first = storage.push_tasks(tasks(3, 500)).await.unwrap();
        let second = storage.push_tasks(tasks(3, 500)).await.unwrap();
        for (a, b) in first.iter().zip(&second) {
            assert!(a.id.is_some());
            assert_eq!(a.id, b.id, "{:?}", dialect);
        }

        let collection = storage.tasks_collection().handle(Access::Read).await.unwrap();
        assert_eq!(collection.count(&Filter::All).await.unwrap(), 3);
    }
}

#[tokio::test]
async fn claimed_tasks_are_not_due_again_until_pushed() {
    let storage = storage_on(Arc::new(MemoryEngine::new()), Dialect::Standard);
    storage.push_tasks(tasks(2, 100)).await.unwrap();

    let popped = storage.pop_tasks(10, Some(1_000)).await.unwrap();
    assert_eq!(popped.len(), 2);
    assert!(popped.iter().all(|t| t.enqueue == MAX_TS));
    assert!(storage.pop_tasks(10, Some(MAX_TS - 1)).await.unwrap().is_empty());

    let mut sent = popped[0].clone();
    sent.sent = Some(900);
    let mut data = Document::new();
    data.insert("sent".into(), serde_json::json!(900));
    storage
        .update_task(sent.id.as_deref().unwrap(), data)
        .await
        .unwrap();

    let updated = storage
        .update_tasks_by_watermark(&sent.sender_id, "page", 1_000, WatermarkEvent::Delivery, Some(1_100))
        .await
        .unwrap();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].delivery, Some(1_100));
}
