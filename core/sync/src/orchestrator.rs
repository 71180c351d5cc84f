//! Orchestrator façade over the queue, monitor, engine and collaborators.
//!
//! Applications construct one orchestrator with their injected collaborators
//! and call the `sync_*` entry points. Each entry point is a complete pass:
//! auth preflight, connectivity check, scoped execution, lifecycle events,
//! and statistics accounting.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use cardstack_common::{EntityType, UserId};
use cardstack_store::{AuthProvider, EventSink, LocalStore, RemoteStore, SyncEvent};

use crate::batch::BatchSyncEngine;
use crate::config::SyncConfig;
use crate::network::NetworkMonitor;
use crate::progress::{SyncProgress, SyncResult, SyncStats, SyncStatus};
use crate::queue::{OperationQueue, SyncOperation};

/// What a running pass holds exclusive. Pull passes are scoped per entity
/// type; anything draining the queue holds the single push scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Scope {
    Entity(EntityType),
    Push,
}

/// Releases acquired scopes on drop, so early returns cannot leak them.
struct ScopeGuard<'a> {
    active: &'a Mutex<HashSet<Scope>>,
    scopes: Vec<Scope>,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            for scope in &self.scopes {
                active.remove(scope);
            }
        }
    }
}

/// The engine façade: owns the queue, the batch engine, the per-type
/// watermarks and the connectivity watcher.
pub struct SyncOrchestrator<L, R> {
    engine: BatchSyncEngine<L, R>,
    queue: Arc<OperationQueue>,
    auth: Arc<dyn AuthProvider>,
    events: Arc<dyn EventSink>,
    monitor: Arc<NetworkMonitor>,
    config: SyncConfig,
    active: Mutex<HashSet<Scope>>,
    watermarks: RwLock<HashMap<EntityType, DateTime<Utc>>>,
    stats: Mutex<SyncStats>,
    connectivity_task: Mutex<Option<JoinHandle<()>>>,
}

impl<L, R> SyncOrchestrator<L, R>
where
    L: LocalStore + 'static,
    R: RemoteStore + 'static,
{
    /// Wire an orchestrator over the injected collaborators.
    pub fn new(
        local: Arc<L>,
        remote: Arc<R>,
        auth: Arc<dyn AuthProvider>,
        events: Arc<dyn EventSink>,
        monitor: Arc<NetworkMonitor>,
        config: SyncConfig,
    ) -> Self {
        let queue = Arc::new(OperationQueue::new(
            config.queue_capacity,
            config.retry.clone(),
        ));
        let engine = BatchSyncEngine::new(
            local,
            remote,
            Arc::clone(&queue),
            Arc::clone(&events),
            Arc::clone(&monitor),
            config.clone(),
        );
        Self {
            engine,
            queue,
            auth,
            events,
            monitor,
            config,
            active: Mutex::new(HashSet::new()),
            watermarks: RwLock::new(HashMap::new()),
            stats: Mutex::new(SyncStats::default()),
            connectivity_task: Mutex::new(None),
        }
    }

    /// Queue a local mutation for eventual push. Works offline; eviction of
    /// an old low-priority operation is reported through the event sink.
    pub fn enqueue(&self, op: SyncOperation) -> Uuid {
        let outcome = self.queue.enqueue(op);
        if let Some(evicted) = outcome.evicted {
            self.events.publish(SyncEvent::OperationEvicted {
                operation_id: evicted.id,
                entity_id: evicted.entity_id,
            });
            if let Ok(mut stats) = self.stats.lock() {
                stats.operations_evicted += 1;
            }
        }
        outcome.id
    }

    /// The shared operation queue, for snapshot/restore persistence.
    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Cumulative statistics since construction.
    pub fn stats(&self) -> SyncStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Last successful pull watermark for an entity type.
    pub async fn watermark(&self, entity_type: EntityType) -> Option<DateTime<Utc>> {
        self.watermarks.read().await.get(&entity_type).copied()
    }

    /// Subscribe to live pass progress.
    pub fn subscribe_progress(&self) -> watch::Receiver<SyncProgress> {
        self.engine.subscribe_progress()
    }

    /// Request cancellation of the running pass. In-flight batches finish.
    pub fn cancel(&self) {
        self.engine.cancel();
    }

    /// Backpressure: hold off new push batches until [`resume`].
    ///
    /// [`resume`]: SyncOrchestrator::resume
    pub fn pause(&self) {
        self.engine.pause();
    }

    /// Release a [`pause`] hold.
    ///
    /// [`pause`]: SyncOrchestrator::pause
    pub fn resume(&self) {
        self.engine.resume();
    }

    /// Stop the connectivity watcher and cancel any running pass.
    pub fn shutdown(&self) {
        self.engine.cancel();
        if let Ok(mut task) = self.connectivity_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }

    /// Push everything pending in the queue.
    pub async fn sync_up(&self) -> SyncResult {
        let Some(_guard) = self.try_acquire(&[Scope::Push]) else {
            return SyncResult::already_syncing();
        };
        let owner = match self.preflight() {
            Ok(owner) => owner,
            Err(result) => {
                // A push-only pass has no pull events, so the preflight
                // failure is reported here.
                let message = result
                    .errors
                    .first()
                    .map(|e| e.error.clone())
                    .unwrap_or_default();
                self.events.publish(SyncEvent::PushFailed { message });
                return result;
            }
        };
        self.engine.begin_pass();

        let mut result = SyncResult::begin();
        let pushed = self.run_push(&owner, &mut result).await;
        let result = self.finish_pass(result, 0, pushed);
        self.engine
            .end_pass(result.status == SyncStatus::Failed);
        result
    }

    /// Pull the remote delta for one entity type and reconcile it.
    pub async fn sync_down(&self, entity_type: EntityType) -> SyncResult {
        let Some(_guard) = self.try_acquire(&[Scope::Entity(entity_type)]) else {
            return SyncResult::already_syncing();
        };
        let owner = match self.preflight() {
            Ok(owner) => owner,
            Err(result) => return result,
        };
        self.engine.begin_pass();

        let since = self.watermark(entity_type).await;
        let (result, pulled) = self.pull_scoped(entity_type, &owner, since).await;
        let result = self.finish_pass(result, pulled, 0);
        self.engine
            .end_pass(result.status == SyncStatus::Failed);
        result
    }

    /// Pull then push for one entity type.
    pub async fn sync_both(&self, entity_type: EntityType) -> SyncResult {
        let Some(_guard) = self.try_acquire(&[Scope::Entity(entity_type), Scope::Push]) else {
            return SyncResult::already_syncing();
        };
        let owner = match self.preflight() {
            Ok(owner) => owner,
            Err(result) => return result,
        };
        self.engine.begin_pass();

        let since = self.watermark(entity_type).await;
        let (mut result, pulled) = self.pull_scoped(entity_type, &owner, since).await;
        let mut pushed = 0;
        if result.status != SyncStatus::Failed {
            pushed = self.run_push(&owner, &mut result).await;
        }
        let result = self.finish_pass(result, pulled, pushed);
        self.engine
            .end_pass(result.status == SyncStatus::Failed);
        result
    }

    /// Pull every entity type from an explicit point in time, then push.
    /// Watermarks are still advanced on success.
    pub async fn sync_incremental(&self, since: DateTime<Utc>) -> SyncResult {
        self.sync_types(&EntityType::ALL, Some(since)).await
    }

    /// Full bidirectional sync of every entity type.
    pub async fn sync_all(&self) -> SyncResult {
        self.sync_types(&EntityType::ALL, None).await
    }

    /// Bidirectional sync limited to the given entity types.
    pub async fn sync_smart(&self, entity_types: &[EntityType]) -> SyncResult {
        self.sync_types(entity_types, None).await
    }

    /// Enqueue a set of operations and push them immediately.
    pub async fn sync_batch(&self, operations: Vec<SyncOperation>) -> SyncResult {
        for op in operations {
            self.enqueue(op);
        }
        self.sync_up().await
    }

    /// Start the connectivity watcher: on a debounced offline→online edge it
    /// runs exactly one catch-up sync.
    pub fn spawn_connectivity_watcher(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut rx = self.monitor.subscribe();
        let events = Arc::clone(&self.events);
        let window = self.config.stabilization_window;

        let handle = tokio::spawn(async move {
            let mut was_online = rx.borrow().online;
            loop {
                if rx.changed().await.is_err() {
                    return;
                }
                let online = rx.borrow().online;
                if online == was_online {
                    continue;
                }
                was_online = online;
                if !online {
                    events.publish(SyncEvent::NetworkOffline);
                    continue;
                }
                events.publish(SyncEvent::NetworkOnline);

                // Debounce: connectivity must hold for the whole window. A
                // drop during the window aborts the catch-up; flapping never
                // schedules more than one.
                let mut stable = true;
                loop {
                    tokio::select! {
                        _ = sleep(window) => break,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            let still_online = rx.borrow().online;
                            if !still_online {
                                was_online = false;
                                events.publish(SyncEvent::NetworkOffline);
                                stable = false;
                                break;
                            }
                        }
                    }
                }
                if !stable {
                    continue;
                }

                let Some(orchestrator) = weak.upgrade() else {
                    return;
                };
                info!("Connectivity stabilized, running catch-up sync");
                let result = orchestrator.sync_all().await;
                if result.status == SyncStatus::Failed {
                    warn!(errors = result.error_count, "Catch-up sync failed");
                }
            }
        });

        if let Ok(mut task) = self.connectivity_task.lock() {
            if let Some(previous) = task.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Shared body of `sync_all` / `sync_smart` / `sync_incremental`: pull
    /// the listed types concurrently, then one push.
    async fn sync_types(
        &self,
        entity_types: &[EntityType],
        since_override: Option<DateTime<Utc>>,
    ) -> SyncResult {
        let Some(_guard) = self.try_acquire(&[Scope::Push]) else {
            return SyncResult::already_syncing();
        };
        let owner = match self.preflight() {
            Ok(owner) => owner,
            Err(result) => return result,
        };
        self.engine.begin_pass();

        let owner_ref = &owner;
        let pulls = entity_types.iter().map(|&entity_type| async move {
            let Some(_guard) = self.try_acquire(&[Scope::Entity(entity_type)]) else {
                return (SyncResult::already_syncing(), 0);
            };
            let since = match since_override {
                Some(t) => Some(t),
                None => self.watermark(entity_type).await,
            };
            self.pull_scoped(entity_type, owner_ref, since).await
        });
        let outcomes = futures::future::join_all(pulls).await;

        let mut combined = SyncResult::begin();
        let mut pulled_total = 0;
        for (result, pulled) in outcomes {
            // A type busy in another pass is skipped, not a failure.
            if result.status == SyncStatus::AlreadySyncing {
                continue;
            }
            pulled_total += pulled;
            combined.absorb(result);
        }

        let mut pushed = 0;
        if combined.status != SyncStatus::Failed {
            pushed = self.run_push(&owner, &mut combined).await;
        }
        let result = self.finish_pass(combined, pulled_total, pushed);
        self.engine
            .end_pass(result.status == SyncStatus::Failed);
        result
    }

    /// One scoped pull pass with lifecycle events. Returns the result and
    /// the number of records applied.
    async fn pull_scoped(
        &self,
        entity_type: EntityType,
        owner: &UserId,
        since: Option<DateTime<Utc>>,
    ) -> (SyncResult, u64) {
        self.events
            .publish(SyncEvent::SyncStarted { entity_type });
        let started = Utc::now();
        let mut result = SyncResult::begin();

        match self
            .engine
            .pull_and_reconcile(entity_type, owner, since, &mut result)
            .await
        {
            Ok(applied) => {
                // Advance the watermark to the pass start so records changing
                // mid-pull are picked up next time.
                self.watermarks
                    .write()
                    .await
                    .insert(entity_type, started);
                self.events.publish(SyncEvent::SyncCompleted {
                    entity_type,
                    success_count: result.success_count,
                    error_count: result.error_count,
                    conflict_count: result.conflict_count,
                });
                (result, applied as u64)
            }
            Err(err) => {
                warn!(entity_type = %entity_type, error = %err, "Pull pass failed");
                self.events.publish(SyncEvent::SyncFailed {
                    entity_type,
                    message: err.to_string(),
                });
                let mut failed = SyncResult::failed(err.to_string());
                failed.absorb(result);
                (failed, 0)
            }
        }
    }

    /// Push phase shared by every entry point that drains the queue, with
    /// its own lifecycle events.
    async fn run_push(&self, owner: &UserId, result: &mut SyncResult) -> u64 {
        self.events.publish(SyncEvent::PushStarted);
        let successes_before = result.success_count;
        let errors_before = result.error_count;
        match self.engine.push_pending(owner, result).await {
            Ok(pushed) => {
                self.events.publish(SyncEvent::PushCompleted {
                    success_count: result.success_count - successes_before,
                    error_count: result.error_count - errors_before,
                });
                pushed as u64
            }
            Err(err) => {
                warn!(error = %err, "Push phase failed");
                self.events.publish(SyncEvent::PushFailed {
                    message: err.to_string(),
                });
                result.status = SyncStatus::Failed;
                0
            }
        }
    }

    /// Auth and connectivity preflight. Both failures are pass-level; an
    /// absent session is never retried.
    fn preflight(&self) -> std::result::Result<UserId, SyncResult> {
        let Some(owner) = self.auth.current_user_id() else {
            return Err(self.finish_pass(
                SyncResult::failed("authentication required: no active session"),
                0,
                0,
            ));
        };
        if !self.monitor.current_quality().online {
            return Err(self.finish_pass(SyncResult::failed("network offline"), 0, 0));
        }
        Ok(owner)
    }

    fn try_acquire(&self, scopes: &[Scope]) -> Option<ScopeGuard<'_>> {
        let mut active = self.active.lock().ok()?;
        if scopes.iter().any(|s| active.contains(s)) {
            return None;
        }
        for scope in scopes {
            active.insert(*scope);
        }
        Some(ScopeGuard {
            active: &self.active,
            scopes: scopes.to_vec(),
        })
    }

    /// Stamp the terminal status and fold the pass into the statistics.
    fn finish_pass(&self, result: SyncResult, pulled: u64, pushed: u64) -> SyncResult {
        let status = if result.status == SyncStatus::Failed {
            SyncStatus::Failed
        } else if self.engine.is_cancelled() {
            SyncStatus::Cancelled
        } else {
            result.status
        };
        let result = result.finish(status);
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(&result, pulled, pushed);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Priority;
    use cardstack_common::EntityId;
    use cardstack_store::{
        MemoryEventSink, MemoryLocalStore, MemoryRemoteStore, StaticAuth, VersionedRecord,
    };
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        orchestrator: Arc<SyncOrchestrator<MemoryLocalStore, MemoryRemoteStore>>,
        local: Arc<MemoryLocalStore>,
        remote: Arc<MemoryRemoteStore>,
        events: Arc<MemoryEventSink>,
        monitor: Arc<NetworkMonitor>,
    }

    fn fixture_with(auth: StaticAuth, config: SyncConfig) -> Fixture {
        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let events = Arc::new(MemoryEventSink::new());
        let monitor = Arc::new(NetworkMonitor::default());
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::clone(&local),
            Arc::clone(&remote),
            Arc::new(auth),
            events.clone() as Arc<dyn EventSink>,
            Arc::clone(&monitor),
            config,
        ));
        Fixture {
            orchestrator,
            local,
            remote,
            events,
            monitor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            StaticAuth::signed_in(UserId::new("u1").unwrap()),
            SyncConfig::default().with_stabilization_window(Duration::from_millis(50)),
        )
    }

    fn seeded_record(owner: &UserId, payload: serde_json::Value) -> VersionedRecord {
        let mut rec = VersionedRecord::new(
            EntityId::generate(),
            owner.clone(),
            EntityType::Card,
            payload,
            Utc::now(),
        );
        rec.pending_sync = false;
        rec
    }

    #[tokio::test]
    async fn missing_session_fails_without_retry() {
        let f = fixture_with(StaticAuth::signed_out(), SyncConfig::default());
        let result = f.orchestrator.sync_all().await;
        assert_eq!(result.status, SyncStatus::Failed);
        assert!(result.errors[0].error.contains("authentication required"));
    }

    #[tokio::test]
    async fn offline_fails_immediately() {
        let f = fixture();
        f.monitor.report_offline();
        let result = f.orchestrator.sync_up().await;
        assert_eq!(result.status, SyncStatus::Failed);
        assert!(result.errors[0].error.contains("offline"));
        // Even a preflight failure is visible to observers.
        assert_eq!(
            f.events
                .count_matching(|e| matches!(e, SyncEvent::PushFailed { .. })),
            1
        );
    }

    #[tokio::test]
    async fn push_only_pass_emits_lifecycle_events() {
        let f = fixture();
        let owner = UserId::new("u1").unwrap();
        let id = EntityId::generate();
        f.local
            .put(VersionedRecord::new(
                id,
                owner.clone(),
                EntityType::Card,
                json!({"title": "t"}),
                Utc::now(),
            ))
            .await
            .unwrap();
        f.orchestrator
            .enqueue(SyncOperation::create(EntityType::Card, id, json!({})));

        let result = f.orchestrator.sync_up().await;
        assert_eq!(result.status, SyncStatus::Completed);
        assert_eq!(
            f.events
                .count_matching(|e| matches!(e, SyncEvent::PushStarted)),
            1
        );
        assert!(f.events.events().iter().any(|e| matches!(
            e,
            SyncEvent::PushCompleted {
                success_count: 1,
                error_count: 0
            }
        )));
    }

    #[tokio::test]
    async fn concurrent_pass_for_same_type_is_rejected() {
        let f = fixture();
        let _held = f
            .orchestrator
            .try_acquire(&[Scope::Entity(EntityType::Card)])
            .unwrap();

        let result = f.orchestrator.sync_down(EntityType::Card).await;
        assert_eq!(result.status, SyncStatus::AlreadySyncing);

        // A different type is unaffected.
        let result = f.orchestrator.sync_down(EntityType::Folder).await;
        assert_eq!(result.status, SyncStatus::Completed);
    }

    #[tokio::test]
    async fn scope_released_after_pass() {
        let f = fixture();
        assert_eq!(
            f.orchestrator.sync_down(EntityType::Card).await.status,
            SyncStatus::Completed
        );
        assert_eq!(
            f.orchestrator.sync_down(EntityType::Card).await.status,
            SyncStatus::Completed
        );
    }

    #[tokio::test]
    async fn watermark_advances_on_successful_pull() {
        let f = fixture();
        let owner = UserId::new("u1").unwrap();
        f.remote.seed(seeded_record(&owner, json!({"title": "a"})));

        assert!(f.orchestrator.watermark(EntityType::Card).await.is_none());
        let before = Utc::now();
        let result = f.orchestrator.sync_down(EntityType::Card).await;
        assert_eq!(result.status, SyncStatus::Completed);

        let watermark = f.orchestrator.watermark(EntityType::Card).await.unwrap();
        assert!(watermark >= before);
    }

    #[tokio::test]
    async fn sync_batch_enqueues_and_pushes() {
        let f = fixture();
        let owner = UserId::new("u1").unwrap();
        let id = EntityId::generate();
        f.local
            .put(VersionedRecord::new(
                id,
                owner.clone(),
                EntityType::Card,
                json!({"title": "queued"}),
                Utc::now(),
            ))
            .await
            .unwrap();

        let ops = vec![SyncOperation::create(EntityType::Card, id, json!({}))
            .with_priority(Priority::High)];
        let result = f.orchestrator.sync_batch(ops).await;

        assert_eq!(result.status, SyncStatus::Completed);
        assert_eq!(result.success_count, 1);
        assert!(f.remote.record(EntityType::Card, &id).is_some());

        let stats = f.orchestrator.stats();
        assert_eq!(stats.records_pushed, 1);
        assert_eq!(stats.cycles_completed, 1);
    }

    #[tokio::test]
    async fn cancel_mid_pass_reports_cancelled() {
        let f = fixture_with(
            StaticAuth::signed_in(UserId::new("u1").unwrap()),
            SyncConfig::default()
                .with_batch_size(1)
                .with_max_concurrent_batches(1),
        );
        let owner = UserId::new("u1").unwrap();
        for i in 0..4 {
            let id = EntityId::generate();
            f.local
                .put(VersionedRecord::new(
                    id,
                    owner.clone(),
                    EntityType::Card,
                    json!({"n": i}),
                    Utc::now(),
                ))
                .await
                .unwrap();
            f.orchestrator
                .enqueue(SyncOperation::create(EntityType::Card, id, json!({})));
        }
        // Each remote call takes long enough for the cancel to land between
        // batches.
        f.remote.set_latency(Duration::from_millis(100));

        let orchestrator = Arc::clone(&f.orchestrator);
        let pass = tokio::spawn(async move { orchestrator.sync_up().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.orchestrator.cancel();

        let result = pass.await.unwrap();
        assert_eq!(result.status, SyncStatus::Cancelled);
        // Unpushed operations stay queued for the next pass.
        assert!(!f.orchestrator.queue().is_empty());
    }

    #[tokio::test]
    async fn flapping_connectivity_schedules_one_catch_up() {
        let f = fixture();
        f.monitor.report_offline();
        f.orchestrator.spawn_connectivity_watcher();
        // Give the watcher a beat to observe the offline baseline.
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Flap: up, down within the stabilization window, then up for good.
        f.monitor.report_online();
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.monitor.report_offline();
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.monitor.report_online();

        tokio::time::sleep(Duration::from_millis(200)).await;

        // Exactly one catch-up ran: one SyncStarted per entity type.
        let started = f
            .events
            .count_matching(|e| matches!(e, SyncEvent::SyncStarted { .. }));
        assert_eq!(started, EntityType::ALL.len());
        f.orchestrator.shutdown();
    }

    #[tokio::test]
    async fn shutdown_stops_watcher() {
        let f = fixture();
        f.orchestrator.spawn_connectivity_watcher();
        f.orchestrator.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;

        f.monitor.report_offline();
        f.monitor.report_online();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            f.events
                .count_matching(|e| matches!(e, SyncEvent::SyncStarted { .. })),
            0
        );
    }
}
