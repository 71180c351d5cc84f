//! End-to-end orchestrator flows against the in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use cardstack_common::{EntityId, EntityType, UserId};
use cardstack_store::{
    EventSink, LocalStore, MemoryEventSink, MemoryLocalStore, MemoryRemoteStore, StaticAuth,
    SyncEvent, VersionedRecord,
};
use cardstack_sync::{
    NetworkMonitor, OperationQueue, Priority, ResolutionStrategy, RetryConfig, SyncConfig,
    SyncOperation, SyncOrchestrator, SyncStatus,
};

struct Harness {
    orchestrator: Arc<SyncOrchestrator<MemoryLocalStore, MemoryRemoteStore>>,
    local: Arc<MemoryLocalStore>,
    remote: Arc<MemoryRemoteStore>,
    events: Arc<MemoryEventSink>,
    monitor: Arc<NetworkMonitor>,
    owner: UserId,
}

fn harness(config: SyncConfig) -> Harness {
    let local = Arc::new(MemoryLocalStore::new());
    let remote = Arc::new(MemoryRemoteStore::new());
    let events = Arc::new(MemoryEventSink::new());
    let monitor = Arc::new(NetworkMonitor::default());
    let owner = UserId::new("user-1").unwrap();
    let orchestrator = Arc::new(SyncOrchestrator::new(
        Arc::clone(&local),
        Arc::clone(&remote),
        Arc::new(StaticAuth::signed_in(owner.clone())),
        events.clone() as Arc<dyn EventSink>,
        Arc::clone(&monitor),
        config,
    ));
    Harness {
        orchestrator,
        local,
        remote,
        events,
        monitor,
        owner,
    }
}

fn default_harness() -> Harness {
    harness(
        SyncConfig::default()
            .with_stabilization_window(Duration::from_millis(50))
            .with_retry(
                RetryConfig::new(3)
                    .with_initial_delay(Duration::from_secs(30))
                    .with_jitter(false),
            ),
    )
}

async fn create_card(h: &Harness, payload: serde_json::Value) -> EntityId {
    let id = EntityId::generate();
    let record = VersionedRecord::new(
        id,
        h.owner.clone(),
        EntityType::Card,
        payload,
        Utc::now(),
    );
    h.local.put(record).await.unwrap();
    h.orchestrator
        .enqueue(SyncOperation::create(EntityType::Card, id, json!({})));
    id
}

#[tokio::test]
async fn offline_edits_catch_up_when_connectivity_returns() {
    let h = default_harness();
    h.monitor.report_offline();

    // Edits while offline are queued, never lost.
    let a = create_card(&h, json!({"title": "written offline"})).await;
    let b = create_card(&h, json!({"title": "also offline"})).await;

    // A sync attempt while offline fails fast and leaves the queue intact.
    let result = h.orchestrator.sync_up().await;
    assert_eq!(result.status, SyncStatus::Failed);
    assert_eq!(h.orchestrator.queue().len(), 2);

    // Connectivity returns; the debounced watcher runs one catch-up.
    h.orchestrator.spawn_connectivity_watcher();
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.monitor.report_online();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(h.orchestrator.queue().is_empty());
    assert!(h.remote.record(EntityType::Card, &a).is_some());
    assert!(h.remote.record(EntityType::Card, &b).is_some());
    h.orchestrator.shutdown();
}

#[tokio::test]
async fn bidirectional_sync_resolves_concurrent_edit_by_timestamp() {
    let h = default_harness();
    let id = EntityId::generate();
    let t0 = Utc::now() - chrono::Duration::hours(1);

    // The same card was edited on this device at T+10 and elsewhere at T+20.
    let mut local = VersionedRecord::new(
        id,
        h.owner.clone(),
        EntityType::Card,
        json!({"title": "edited here"}),
        t0 + chrono::Duration::minutes(10),
    );
    local.sync_version = 2;
    h.local.put(local).await.unwrap();

    let mut remote = VersionedRecord::new(
        id,
        h.owner.clone(),
        EntityType::Card,
        json!({"title": "edited elsewhere"}),
        t0 + chrono::Duration::minutes(20),
    );
    remote.sync_version = 3;
    remote.pending_sync = false;
    h.remote.seed(remote);

    let result = h.orchestrator.sync_both(EntityType::Card).await;
    assert_eq!(result.status, SyncStatus::Completed);
    assert_eq!(result.conflict_count, 1);
    assert_eq!(result.resolved_count, 1);

    // The later edit won, stamped past both versions, and the merged record
    // was re-pushed to the remote during the same pass.
    let resolved = h.local.get(EntityType::Card, &id).await.unwrap().unwrap();
    assert_eq!(resolved.payload, json!({"title": "edited elsewhere"}));
    assert_eq!(resolved.sync_version, 4);
    assert!(!resolved.pending_sync);
    let remote_now = h.remote.record(EntityType::Card, &id).unwrap();
    assert_eq!(remote_now.sync_version, 4);

    assert_eq!(
        h.events
            .count_matching(|e| matches!(e, SyncEvent::ConflictResolved { .. })),
        1
    );
}

#[tokio::test]
async fn push_only_pass_keeps_concurrent_remote_edit() {
    // Both replicas advanced to the same version from a common ancestor, so
    // the remote upsert is a version-gated no-op. A push-only pass must
    // surface the pair as a conflict and converge, never report a clean
    // success that drops one side.
    let h = default_harness();
    let id = EntityId::generate();
    let t0 = Utc::now() - chrono::Duration::hours(1);

    let mut local = VersionedRecord::new(
        id,
        h.owner.clone(),
        EntityType::Card,
        json!({"title": "X (local edit)"}),
        t0 + chrono::Duration::minutes(10),
    );
    local.sync_version = 3;
    h.local.put(local).await.unwrap();

    let mut remote = VersionedRecord::new(
        id,
        h.owner.clone(),
        EntityType::Card,
        json!({"title": "Y (remote edit)"}),
        t0 + chrono::Duration::minutes(20),
    );
    remote.sync_version = 3;
    remote.pending_sync = false;
    h.remote.seed(remote);

    h.orchestrator.enqueue(SyncOperation::update(
        EntityType::Card,
        id,
        json!({"title": "X (local edit)"}),
        None,
    ));
    let result = h.orchestrator.sync_up().await;

    assert_eq!(result.status, SyncStatus::Completed);
    assert_eq!(result.conflict_count, 1);
    assert!(
        h.events
            .count_matching(|e| matches!(e, SyncEvent::ConflictDetected { .. }))
            >= 1
    );

    // Both replicas hold the resolved record at a version above the race.
    let local_now = h.local.get(EntityType::Card, &id).await.unwrap().unwrap();
    let remote_now = h.remote.record(EntityType::Card, &id).unwrap();
    assert_eq!(local_now.payload, remote_now.payload);
    assert_eq!(local_now.payload, json!({"title": "Y (remote edit)"}));
    assert_eq!(local_now.sync_version, 4);
    assert_eq!(remote_now.sync_version, 4);
    assert!(h.orchestrator.queue().is_empty());
}

#[tokio::test]
async fn field_merge_keeps_each_field_from_one_side() {
    let config = SyncConfig::default()
        .with_default_strategy(ResolutionStrategy::MergeFields)
        .with_stabilization_window(Duration::from_millis(50));
    let h = harness(config);
    let id = EntityId::generate();
    let t0 = Utc::now() - chrono::Duration::hours(1);

    let local_payload = json!({"title": "mine", "body": "shared", "tags": ["a"]});
    let remote_payload = json!({"title": "theirs", "body": "shared", "starred": true});

    let mut local = VersionedRecord::new(
        id,
        h.owner.clone(),
        EntityType::Card,
        local_payload.clone(),
        t0 + chrono::Duration::minutes(30),
    );
    local.sync_version = 2;
    h.local.put(local).await.unwrap();

    let mut remote = VersionedRecord::new(
        id,
        h.owner.clone(),
        EntityType::Card,
        remote_payload.clone(),
        t0 + chrono::Duration::minutes(20),
    );
    remote.sync_version = 3;
    remote.pending_sync = false;
    h.remote.seed(remote);

    let result = h.orchestrator.sync_both(EntityType::Card).await;
    assert_eq!(result.resolved_count, 1);

    // Every field of the merged payload matches at least one input side.
    let merged = h.local.get(EntityType::Card, &id).await.unwrap().unwrap();
    let obj = merged.payload.as_object().unwrap();
    for (key, value) in obj {
        let from_local = local_payload.get(key) == Some(value);
        let from_remote = remote_payload.get(key) == Some(value);
        assert!(from_local || from_remote, "field {key} matches neither side");
    }
    // Local was later, so its conflicting title wins.
    assert_eq!(merged.payload["title"], json!("mine"));
}

#[tokio::test]
async fn partial_push_failure_reports_and_requeues() {
    let h = default_harness();
    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(create_card(&h, json!({"n": i})).await);
    }
    h.remote.fail_entity(ids[2], 5);
    h.remote.fail_entity(ids[7], 5);

    let result = h.orchestrator.sync_up().await;
    assert_eq!(result.status, SyncStatus::Completed);
    assert_eq!(result.success_count, 8);
    assert_eq!(result.error_count, 2);
    assert!(result.errors.iter().all(|e| e.retryable));

    // The two failures are waiting for their backoff, not lost.
    assert_eq!(h.orchestrator.queue().len(), 2);
    let stats = h.orchestrator.stats();
    assert_eq!(stats.records_pushed, 8);
}

#[tokio::test]
async fn delete_propagates_as_tombstone() {
    let h = default_harness();
    let id = EntityId::generate();
    let mut record = VersionedRecord::new(
        id,
        h.owner.clone(),
        EntityType::Card,
        json!({"title": "short-lived"}),
        Utc::now(),
    );
    h.local.put(record.clone()).await.unwrap();
    h.orchestrator
        .enqueue(SyncOperation::create(EntityType::Card, id, json!({})));
    h.orchestrator.sync_up().await;

    record = h.local.get(EntityType::Card, &id).await.unwrap().unwrap();
    record.apply_local_delete(Utc::now());
    h.local.put(record).await.unwrap();
    h.orchestrator
        .enqueue(SyncOperation::delete(EntityType::Card, id));

    let result = h.orchestrator.sync_up().await;
    assert_eq!(result.status, SyncStatus::Completed);

    let remote = h.remote.record(EntityType::Card, &id).unwrap();
    assert!(remote.is_deleted);
    let local = h.local.get(EntityType::Card, &id).await.unwrap().unwrap();
    assert!(local.is_deleted);
    assert!(!local.pending_sync);
}

#[tokio::test]
async fn remote_delete_pulls_down_as_tombstone() {
    let h = default_harness();
    let id = EntityId::generate();

    let mut shared = VersionedRecord::new(
        id,
        h.owner.clone(),
        EntityType::Card,
        json!({"title": "doomed"}),
        Utc::now() - chrono::Duration::hours(1),
    );
    shared.sync_version = 2;
    shared.pending_sync = false;
    h.local.put(shared.clone()).await.unwrap();

    shared.apply_local_delete(Utc::now());
    shared.pending_sync = false;
    h.remote.seed(shared);

    let result = h.orchestrator.sync_down(EntityType::Card).await;
    assert_eq!(result.status, SyncStatus::Completed);

    let local = h.local.get(EntityType::Card, &id).await.unwrap().unwrap();
    assert!(local.is_deleted);
}

#[tokio::test]
async fn second_identical_pull_is_a_no_op() {
    let h = default_harness();
    let mut record = VersionedRecord::new(
        EntityId::generate(),
        h.owner.clone(),
        EntityType::Card,
        json!({"title": "stable"}),
        Utc::now(),
    );
    record.sync_version = 2;
    record.pending_sync = false;
    h.remote.seed(record);

    let first = h.orchestrator.sync_down(EntityType::Card).await;
    assert_eq!(first.success_count, 1);

    // Pulling the same snapshot again changes nothing.
    let second = h.orchestrator.sync_incremental(Utc::now() - chrono::Duration::days(1)).await;
    assert_eq!(second.status, SyncStatus::Completed);
    assert_eq!(second.conflict_count, 0);
    assert_eq!(second.success_count, 0);
}

#[tokio::test]
async fn queue_snapshot_survives_restart() {
    let h = default_harness();
    h.monitor.report_offline();
    create_card(&h, json!({"title": "pending"})).await;
    create_card(&h, json!({"title": "also pending"})).await;

    // The embedding app persists the queue before shutdown.
    let snapshot = h.orchestrator.queue().snapshot();
    assert_eq!(snapshot.len(), 2);

    // Fresh process: restore the snapshot into a new queue and push.
    let restored = OperationQueue::new(100, RetryConfig::default());
    restored.restore(snapshot);
    assert_eq!(restored.len(), 2);
    let batch = restored.dequeue_batch(10);
    assert_eq!(batch.len(), 2);
}

#[tokio::test]
async fn eviction_is_reported_not_silent() {
    let h = harness(
        SyncConfig::default()
            .with_stabilization_window(Duration::from_millis(50))
            .with_queue_capacity(2),
    );
    h.monitor.report_offline();

    for i in 0..2 {
        h.orchestrator.enqueue(
            SyncOperation::create(EntityType::Card, EntityId::generate(), json!({"n": i}))
                .with_priority(Priority::Low),
        );
    }
    h.orchestrator.enqueue(SyncOperation::create(
        EntityType::Card,
        EntityId::generate(),
        json!({"n": 2}),
    ));

    assert_eq!(
        h.events
            .count_matching(|e| matches!(e, SyncEvent::OperationEvicted { .. })),
        1
    );
    assert_eq!(h.orchestrator.stats().operations_evicted, 1);
}

#[tokio::test]
async fn smart_sync_touches_only_requested_types() {
    let h = default_harness();
    let mut folder = VersionedRecord::new(
        EntityId::generate(),
        h.owner.clone(),
        EntityType::Folder,
        json!({"name": "inbox"}),
        Utc::now(),
    );
    folder.pending_sync = false;
    h.remote.seed(folder);

    let result = h
        .orchestrator
        .sync_smart(&[EntityType::Folder, EntityType::Tag])
        .await;
    assert_eq!(result.status, SyncStatus::Completed);
    assert_eq!(result.success_count, 1);

    assert!(h.orchestrator.watermark(EntityType::Folder).await.is_some());
    assert!(h.orchestrator.watermark(EntityType::Card).await.is_none());
}
