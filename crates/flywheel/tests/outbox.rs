//! Outbox end-to-end scenarios over the in-memory backend.

mod support;

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use flywheel::event::NoopDispatcher;
use flywheel::event::EventRouter;
use flywheel::outbox::AutocommitOutbox;
use flywheel::{
    CorrelationContext, MemoryQueue, MemoryStore, OutboxProcessor, OutboxStatus, OutboxStore,
    QueuePublisher, CORRELATION_ID_KEY, EVENT_ID_KEY, SEQUENCE_KEY,
};

use support::{fast_outbox_config, FlakyPublisher, UserEarned};

fn router(config: &flywheel::OutboxConfig) -> EventRouter {
    EventRouter::new(std::sync::Arc::new(NoopDispatcher), config.clone())
}

async fn write_event(
    store: &MemoryStore,
    config: &flywheel::OutboxConfig,
    ctx: &mut CorrelationContext,
    event: &UserEarned,
) -> Uuid {
    let mut writer = AutocommitOutbox::new(store);
    router(config)
        .publish(event, &mut writer, ctx, 1)
        .await
        .expect("publish")
        .expect("integration event id")
}

#[tokio::test]
async fn happy_path_publishes_one_wrapped_job() {
    let store = MemoryStore::new();
    let queue = std::sync::Arc::new(MemoryQueue::new());
    let config = fast_outbox_config();
    let correlation = Uuid::from_u128(0xC1);
    let mut ctx = CorrelationContext::init(Some(correlation));

    let event_id = write_event(&store, &config, &mut ctx, &UserEarned::new(7, 5)).await;

    // Exactly one pending row with sequence 1.
    let rows = store.outbox_snapshot();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, OutboxStatus::Pending);
    assert_eq!(rows[0].sequence, 1);
    assert_eq!(rows[0].correlation_id, correlation);
    assert_eq!(rows[0].event_id, event_id);

    // One processor tick.
    let publisher = QueuePublisher::new(std::sync::Arc::clone(&queue), config.clone());
    let processor =
        OutboxProcessor::with_worker_id(store.clone(), publisher, config.clone(), "w1".into());
    let report = processor.process_batch().await.unwrap();
    assert_eq!((report.completed, report.failed, report.dlq), (1, 0, 0));

    // The queue received one job with the wrapped payload.
    let jobs = queue.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].group, "flywheel-outbox");
    assert_eq!(jobs[0].name, "flywheel_integration_points.user_earned");
    let payload = jobs[0].payload.as_object().unwrap();
    assert_eq!(payload.get("user_id"), Some(&json!(7)));
    assert_eq!(payload.get("amount"), Some(&json!(5)));
    assert_eq!(
        payload.get(CORRELATION_ID_KEY),
        Some(&json!(correlation.to_string()))
    );
    assert_eq!(payload.get(SEQUENCE_KEY), Some(&json!(1)));
    assert_eq!(
        payload.get(EVENT_ID_KEY),
        Some(&json!(event_id.to_string()))
    );

    // The row is completed.
    let row = store.find_by_event_id(event_id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Completed);
    assert!(row.processed_at.is_some());
}

#[tokio::test]
async fn crashed_worker_lease_is_reclaimed_by_the_next_worker() {
    let store = MemoryStore::new();
    let config = fast_outbox_config();
    let mut ctx = CorrelationContext::new();

    let event_id = write_event(&store, &config, &mut ctx, &UserEarned::new(1, 1)).await;

    // worker-A claims with an already-expired lease (the crash).
    let claimed = store
        .fetch_pending(1, "worker-A", Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    // The sweep releases the stale claim; a second sweep is a no-op.
    let released = store
        .release_stale_locks(Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(released, 1);
    let released_again = store
        .release_stale_locks(Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(released_again, 0);

    // worker-B acquires the row and completes it.
    let claimed = store
        .fetch_pending(10, "worker-B", Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].locked_by.as_deref(), Some("worker-B"));

    store.mark_completed(event_id).await.unwrap();
    let row = store.find_by_event_id(event_id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Completed);
}

#[tokio::test]
async fn exhausted_retries_move_the_entry_to_the_dlq() {
    let store = MemoryStore::new();
    let config = fast_outbox_config();
    let mut ctx = CorrelationContext::new();

    let event_id = write_event(&store, &config, &mut ctx, &UserEarned::new(2, 2)).await;

    let publisher = FlakyPublisher::always_failing();
    let processor =
        OutboxProcessor::with_worker_id(store.clone(), publisher, config.clone(), "w1".into());

    // Attempts 1 through 4 fail and reschedule (zero backoff in tests).
    for attempt in 1..=4u32 {
        let report = processor.process_batch().await.unwrap();
        assert_eq!(report.failed, 1, "attempt {attempt} should retry");
        let row = store.find_by_event_id(event_id).await.unwrap().unwrap();
        assert_eq!(row.attempts, attempt);
        assert!(row.attempts <= row.max_attempts);
        assert_eq!(row.status, OutboxStatus::Pending);
    }

    // The fifth attempt exhausts the budget.
    let report = processor.process_batch().await.unwrap();
    assert_eq!(report.dlq, 1);

    let row = store.find_by_event_id(event_id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Dlq);
    assert_eq!(row.attempts, 5);

    let dlq = store.dlq_entries(10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].event_id, event_id);
    assert_eq!(dlq[0].attempts, 5);
    assert!(dlq[0].final_error.contains("transport unavailable"));

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.dlq, 1);
    assert_eq!(stats.unresolved_dlq, 1);
}

#[tokio::test]
async fn redriven_dlq_entry_publishes_on_the_next_tick() {
    let store = MemoryStore::new();
    let config = fast_outbox_config();
    let mut ctx = CorrelationContext::new();
    let event_id = write_event(&store, &config, &mut ctx, &UserEarned::new(3, 3)).await;

    let failing =
        OutboxProcessor::with_worker_id(store.clone(), FlakyPublisher::always_failing(), config.clone(), "w1".into());
    for _ in 0..5 {
        failing.process_batch().await.unwrap();
    }
    let dlq = store.dlq_entries(10).await.unwrap();
    assert_eq!(dlq.len(), 1);

    assert!(store.redrive_dlq(dlq[0].id).await.unwrap());
    let row = store.find_by_event_id(event_id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Pending);
    assert_eq!(row.attempts, 0);

    let succeeding = OutboxProcessor::with_worker_id(
        store.clone(),
        FlakyPublisher::failing(0),
        config.clone(),
        "w2".into(),
    );
    let report = succeeding.process_batch().await.unwrap();
    assert_eq!(report.completed, 1);

    // The DLQ row stays, resolved.
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.unresolved_dlq, 0);
    assert!(!store.redrive_dlq(dlq[0].id).await.unwrap());
}

#[tokio::test]
async fn unique_event_supersedes_its_pending_predecessor() {
    let store = MemoryStore::new();
    let queue = std::sync::Arc::new(MemoryQueue::new());
    let config = fast_outbox_config();
    let mut ctx = CorrelationContext::new();

    let first = write_event(&store, &config, &mut ctx, &UserEarned::new(4, 4).unique()).await;
    let second = write_event(&store, &config, &mut ctx, &UserEarned::new(4, 9).unique()).await;

    let first_row = store.find_by_event_id(first).await.unwrap().unwrap();
    let second_row = store.find_by_event_id(second).await.unwrap().unwrap();
    assert_eq!(first_row.status, OutboxStatus::Cancelled);
    assert_eq!(second_row.status, OutboxStatus::Pending);

    let publisher = QueuePublisher::new(std::sync::Arc::clone(&queue), config.clone());
    let processor =
        OutboxProcessor::with_worker_id(store.clone(), publisher, config.clone(), "w1".into());
    let report = processor.process_batch().await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(queue.len().await, 1);
    let jobs = queue.jobs().await;
    assert_eq!(jobs[0].payload.get("amount"), Some(&json!(9)));
}

#[tokio::test]
async fn mark_failed_alone_never_dead_letters() {
    let store = MemoryStore::new();
    let config = fast_outbox_config();
    let mut ctx = CorrelationContext::new();
    let event_id = write_event(&store, &config, &mut ctx, &UserEarned::new(5, 5)).await;

    store
        .fetch_pending(1, "w1", Duration::from_secs(300))
        .await
        .unwrap();
    store
        .mark_failed(event_id, "w1", "boom", Duration::ZERO)
        .await
        .unwrap();

    let row = store.find_by_event_id(event_id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Pending);
    assert!(store.dlq_entries(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn delayed_events_are_not_claimable_before_schedule() {
    let store = MemoryStore::new();
    let config = fast_outbox_config();
    let mut ctx = CorrelationContext::new();

    let mut event = UserEarned::new(6, 6);
    event.delay = 3600;
    write_event(&store, &config, &mut ctx, &event).await;

    let claimed = store
        .fetch_pending(10, "w1", Duration::from_secs(300))
        .await
        .unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn purge_only_touches_old_completed_entries() {
    let store = MemoryStore::new();
    let config = fast_outbox_config();
    let mut ctx = CorrelationContext::new();
    let event_id = write_event(&store, &config, &mut ctx, &UserEarned::new(7, 7)).await;
    store.mark_completed(event_id).await.unwrap();

    // Freshly completed: a 1-day cutoff keeps it.
    assert_eq!(store.purge_completed(1).await.unwrap(), 0);
    // A zero-day cutoff removes anything already processed.
    assert_eq!(store.purge_completed(0).await.unwrap(), 1);
    assert!(store.outbox_snapshot().is_empty());
}
