//! Batched push/pull reconciliation with bounded concurrency.
//!
//! One engine instance serves all sync passes. A pass moves through
//! pull → detect → resolve → push; each phase is visible through the
//! progress channel. Item failures never abort a pass; they are recorded
//! and, when retryable, requeued with backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use cardstack_common::{EntityType, Error, Result, UserId};
use cardstack_store::{
    EventSink, LocalStore, RemoteStore, SyncEvent, VersionedRecord, WriteBatch,
};

use crate::config::SyncConfig;
use crate::detector::ConflictDetector;
use crate::network::{BatchPlan, NetworkMonitor};
use crate::progress::{SyncErrorDetail, SyncPhase, SyncProgress, SyncResult};
use crate::queue::{OperationKind, OperationQueue, Priority, RequeueOutcome, SyncOperation};
use crate::resolver::{ConflictResolver, Resolution};
use crate::retry::RetryExecutor;

/// What happened to one pushed operation on the remote side.
enum PushOutcome {
    /// The remote accepted the write. Carries the confirmed record to write
    /// locally, or `None` when there is nothing to write (remote delete of a
    /// record never seen locally).
    Applied(Option<VersionedRecord>),
    /// The remote kept a different record at an equal or newer version: the
    /// pushed edit raced a concurrent writer and the upsert was a no-op.
    Rejected {
        local: VersionedRecord,
        remote: VersionedRecord,
    },
}

/// Per-operation outcome handed back from a batch worker.
struct OpOutcome {
    op: SyncOperation,
    outcome: Result<PushOutcome>,
}

/// Drives reconciliation against the remote store.
///
/// The orchestrator owns one engine and calls [`pull_and_reconcile`] and
/// [`push_pending`] from its scoped sync passes.
///
/// [`pull_and_reconcile`]: BatchSyncEngine::pull_and_reconcile
/// [`push_pending`]: BatchSyncEngine::push_pending
pub struct BatchSyncEngine<L, R> {
    local: Arc<L>,
    remote: Arc<R>,
    queue: Arc<OperationQueue>,
    events: Arc<dyn EventSink>,
    monitor: Arc<NetworkMonitor>,
    config: SyncConfig,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    retry: RetryExecutor,
    cancelled: AtomicBool,
    paused: AtomicBool,
    progress: watch::Sender<SyncProgress>,
}

impl<L, R> BatchSyncEngine<L, R>
where
    L: LocalStore + 'static,
    R: RemoteStore + 'static,
{
    /// Create an engine over the injected collaborators.
    pub fn new(
        local: Arc<L>,
        remote: Arc<R>,
        queue: Arc<OperationQueue>,
        events: Arc<dyn EventSink>,
        monitor: Arc<NetworkMonitor>,
        config: SyncConfig,
    ) -> Self {
        let detector = ConflictDetector::new(config.detection.clone());
        let resolver = ConflictResolver::from_config(&config);
        let retry = RetryExecutor::new(config.retry.clone());
        let (progress, _) = watch::channel(SyncProgress::idle());
        Self {
            local,
            remote,
            queue,
            events,
            monitor,
            config,
            detector,
            resolver,
            retry,
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            progress,
        }
    }

    /// Subscribe to live phase and item progress.
    pub fn subscribe_progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    /// Stop starting new batches. In-flight batches finish.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether a cancel request is pending.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Backpressure hook: hold off starting new batches.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Release the backpressure hold.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Clear the cancel flag at the start of a new pass.
    pub fn begin_pass(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.set_phase(SyncPhase::Idle, 0);
    }

    /// Mark the pass terminal phase.
    pub fn end_pass(&self, failed: bool) {
        let phase = if failed {
            SyncPhase::Failed
        } else {
            SyncPhase::Completed
        };
        self.set_phase(phase, 0);
    }

    fn set_phase(&self, phase: SyncPhase, total: usize) {
        self.progress.send_replace(SyncProgress {
            phase,
            processed: 0,
            total,
        });
    }

    fn bump_processed(&self) {
        self.progress.send_modify(|p| p.processed += 1);
    }

    /// Pull the remote delta for one entity type, detect and resolve
    /// conflicts, and apply everything in a single local transaction.
    ///
    /// Returns the number of records applied locally. Records whose remote
    /// version is not newer than the local copy are skipped, which makes
    /// re-applying an already-applied delta a no-op.
    pub async fn pull_and_reconcile(
        &self,
        entity_type: EntityType,
        owner: &UserId,
        since: Option<DateTime<Utc>>,
        result: &mut SyncResult,
    ) -> Result<usize> {
        self.set_phase(SyncPhase::PullingDelta, 0);

        let call_timeout = self.config.timeout;
        let remote_records = self
            .retry
            .execute(|| async move {
                with_timeout(
                    call_timeout,
                    self.remote.fetch_since(entity_type, owner, since),
                )
                .await
            })
            .await?;

        if remote_records.is_empty() {
            debug!(entity_type = %entity_type, "Remote delta empty");
            return Ok(0);
        }

        self.set_phase(SyncPhase::DetectingConflicts, remote_records.len());
        let mut local_records = Vec::new();
        for remote in &remote_records {
            if let Some(local) = self.local.get(entity_type, &remote.id).await? {
                local_records.push(local);
            }
        }
        let conflicts = self
            .detector
            .detect(entity_type, &local_records, &remote_records, since);
        let conflicted: std::collections::HashSet<_> =
            conflicts.iter().map(|c| c.entity_id).collect();

        let mut batch = WriteBatch::new();
        let mut applied = 0usize;

        for remote in &remote_records {
            if conflicted.contains(&remote.id) {
                continue;
            }
            let local = local_records.iter().find(|l| l.id == remote.id);
            let newer = local.map_or(true, |l| remote.sync_version > l.sync_version);
            if !newer {
                continue;
            }
            let mut incoming = remote.clone();
            incoming.pending_sync = false;
            if incoming.is_deleted {
                batch.soft_delete(entity_type, incoming.id, incoming.updated_at);
            } else {
                batch.put(incoming);
            }
            applied += 1;
            self.bump_processed();
        }

        self.set_phase(SyncPhase::Resolving, conflicts.len());
        for conflict in conflicts {
            self.events.publish(SyncEvent::ConflictDetected {
                entity_type,
                entity_id: conflict.entity_id,
            });
            match self.resolver.resolve(&conflict) {
                Resolution::Resolved { record, strategy } => {
                    self.events.publish(SyncEvent::ConflictResolved {
                        entity_type,
                        entity_id: record.id,
                        strategy: strategy.as_str().to_string(),
                    });
                    // The merged record must reach the remote too.
                    let repush = SyncOperation::update(
                        entity_type,
                        record.id,
                        record.payload.clone(),
                        Some(conflict.local.payload.clone()),
                    )
                    .with_priority(Priority::High);
                    self.enqueue_reporting(repush);
                    batch.put(record);
                    result.record_resolved_conflict();
                    applied += 1;
                }
                Resolution::Manual(conflict) => {
                    self.events.publish(SyncEvent::ConflictPending {
                        entity_type,
                        entity_id: conflict.entity_id,
                    });
                    // The local copy stays untouched until someone decides.
                    result.record_manual_conflict(conflict);
                }
            }
            self.bump_processed();
        }

        if !batch.is_empty() {
            self.local.transact(batch).await?;
        }
        for _ in 0..applied {
            result.record_success();
        }
        info!(
            entity_type = %entity_type,
            pulled = remote_records.len(),
            applied,
            "Applied remote delta"
        );
        Ok(applied)
    }

    /// Drain the operation queue in quality-adapted batches, up to
    /// `max_concurrent_batches` in flight at once.
    ///
    /// Every batch settles: one failing operation is requeued (or terminally
    /// failed) without aborting its siblings. Each batch's accepted results
    /// land in one local transaction, and the matching acknowledgements are
    /// issued only after that transaction commits.
    ///
    /// Returns the number of operations pushed successfully.
    pub async fn push_pending(&self, owner: &UserId, result: &mut SyncResult) -> Result<usize> {
        self.set_phase(SyncPhase::PushingPending, self.queue.len());
        let mut pushed = 0usize;

        loop {
            if self.is_cancelled() || self.paused.load(Ordering::SeqCst) {
                break;
            }
            let plan = BatchPlan::for_quality(&self.monitor.current_quality(), &self.config);
            if plan.batch_size == 0 {
                debug!("Offline, not starting push batches");
                break;
            }

            let mut workers: JoinSet<Vec<OpOutcome>> = JoinSet::new();
            for _ in 0..plan.concurrency {
                let ops = self.queue.dequeue_batch(plan.batch_size);
                if ops.is_empty() {
                    break;
                }
                let local = Arc::clone(&self.local);
                let remote = Arc::clone(&self.remote);
                let owner = owner.clone();
                let call_timeout = self.config.timeout;
                workers.spawn(async move {
                    let mut outcomes = Vec::with_capacity(ops.len());
                    for op in ops {
                        let outcome =
                            push_one(&*local, &*remote, &owner, call_timeout, &op).await;
                        outcomes.push(OpOutcome { op, outcome });
                    }
                    outcomes
                });
            }
            if workers.is_empty() {
                break;
            }

            // All-settled: every worker's outcomes are collected even when
            // a sibling batch failed wholesale.
            while let Some(joined) = workers.join_next().await {
                let outcomes = match joined {
                    Ok(outcomes) => outcomes,
                    Err(err) => {
                        warn!(error = %err, "Push batch worker panicked");
                        continue;
                    }
                };
                pushed += self.settle_batch(outcomes, result).await;
            }
        }

        info!(pushed, "Push phase finished");
        Ok(pushed)
    }

    /// Commit one settled batch: accepted writes in a single transaction,
    /// then acks; failures requeued or terminally failed.
    async fn settle_batch(&self, outcomes: Vec<OpOutcome>, result: &mut SyncResult) -> usize {
        let mut batch = WriteBatch::new();
        let mut accepted = Vec::new();
        let mut superseded = Vec::new();
        let mut failed = Vec::new();

        for OpOutcome { op, outcome } in outcomes {
            match outcome {
                Ok(PushOutcome::Applied(confirmed)) => {
                    if let Some(record) = confirmed {
                        batch.put(record);
                    }
                    accepted.push(op);
                }
                Ok(PushOutcome::Rejected { local, remote }) => {
                    self.reconcile_rejection(&op, local, remote, &mut batch, result);
                    superseded.push(op);
                }
                Err(err) => failed.push((op, err)),
            }
        }

        let mut pushed = 0usize;
        let commit = if batch.is_empty() {
            Ok(())
        } else {
            self.local.transact(batch).await
        };
        match commit {
            Ok(()) => {
                for op in accepted {
                    self.queue.ack(&op.id);
                    result.record_success();
                    self.bump_processed();
                    pushed += 1;
                }
                // Rejected operations are superseded by the repush their
                // resolution enqueued; they are acked, not counted as pushed.
                for op in superseded {
                    self.queue.ack(&op.id);
                    self.bump_processed();
                }
            }
            Err(err) => {
                // The remote accepted these but the local commit failed;
                // requeue so the idempotent upsert runs again.
                warn!(error = %err, "Local commit of push batch failed, requeuing");
                let message = err.to_string();
                let retryable = err.is_retryable();
                for op in accepted.into_iter().chain(superseded) {
                    self.handle_push_failure(op, message.clone(), retryable, result);
                }
            }
        }

        for (op, err) in failed {
            let message = err.to_string();
            let retryable = err.is_retryable();
            self.handle_push_failure(op, message, retryable, result);
        }
        pushed
    }

    /// A push the remote refused under its version rule means both replicas
    /// advanced from a common ancestor. Run the pair through detection and
    /// resolution instead of confirming the local edit away; the resolved
    /// record lands in the same local transaction and is enqueued for
    /// repush.
    fn reconcile_rejection(
        &self,
        op: &SyncOperation,
        local: VersionedRecord,
        remote: VersionedRecord,
        batch: &mut WriteBatch,
        result: &mut SyncResult,
    ) {
        let entity_type = op.entity_type;
        let Some(conflict) = self.detector.check_pair(&local, &remote, None) else {
            // Both sides hold the same content; nothing was lost.
            return;
        };
        self.events.publish(SyncEvent::ConflictDetected {
            entity_type,
            entity_id: conflict.entity_id,
        });
        match self.resolver.resolve(&conflict) {
            Resolution::Resolved { record, strategy } => {
                self.events.publish(SyncEvent::ConflictResolved {
                    entity_type,
                    entity_id: record.id,
                    strategy: strategy.as_str().to_string(),
                });
                let repush = SyncOperation::update(
                    entity_type,
                    record.id,
                    record.payload.clone(),
                    Some(conflict.local.payload.clone()),
                )
                .with_priority(Priority::High);
                self.enqueue_reporting(repush);
                batch.put(record);
                result.record_resolved_conflict();
            }
            Resolution::Manual(conflict) => {
                self.events.publish(SyncEvent::ConflictPending {
                    entity_type,
                    entity_id: conflict.entity_id,
                });
                // The local copy stays pending until someone decides, so
                // the next pull sees the pair again.
                result.record_manual_conflict(conflict);
            }
        }
    }

    fn handle_push_failure(
        &self,
        op: SyncOperation,
        message: String,
        retryable: bool,
        result: &mut SyncResult,
    ) {
        let detail = SyncErrorDetail {
            entity_type: Some(op.entity_type),
            entity_id: Some(op.entity_id),
            operation_id: Some(op.id),
            error: message.clone(),
            retryable,
        };

        if retryable {
            match self.queue.requeue(&op.id, message) {
                Some(RequeueOutcome::Requeued { delay, retry_count }) => {
                    debug!(
                        operation_id = %op.id,
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "Requeued failed operation"
                    );
                }
                Some(RequeueOutcome::Exhausted(dead)) => {
                    self.events.publish(SyncEvent::OperationFailed {
                        operation_id: dead.id,
                        entity_id: dead.entity_id,
                        message: dead.last_error.unwrap_or_default(),
                    });
                }
                None => {}
            }
        } else {
            self.queue.fail(&op.id, detail.error.clone());
            self.events.publish(SyncEvent::OperationFailed {
                operation_id: op.id,
                entity_id: op.entity_id,
                message: detail.error.clone(),
            });
        }
        result.record_error(detail);
        self.bump_processed();
    }

    /// Enqueue an operation, reporting any eviction through the event sink.
    pub fn enqueue_reporting(&self, op: SyncOperation) -> uuid::Uuid {
        let outcome = self.queue.enqueue(op);
        if let Some(evicted) = outcome.evicted {
            self.events.publish(SyncEvent::OperationEvicted {
                operation_id: evicted.id,
                entity_id: evicted.entity_id,
            });
        }
        outcome.id
    }
}

/// Apply one queued operation remotely and report what the remote did
/// with it.
async fn push_one<L, R>(
    local: &L,
    remote: &R,
    owner: &UserId,
    call_timeout: Duration,
    op: &SyncOperation,
) -> Result<PushOutcome>
where
    L: LocalStore,
    R: RemoteStore,
{
    match op.kind {
        OperationKind::Create | OperationKind::Update => {
            let outgoing = match local.get(op.entity_type, &op.entity_id).await? {
                Some(current) => current,
                // The local row is gone (e.g. evicted cache); push the
                // queued payload as-is.
                None => VersionedRecord::new(
                    op.entity_id,
                    owner.clone(),
                    op.entity_type,
                    op.payload.clone(),
                    op.enqueued_at,
                ),
            };
            let stored = with_timeout(
                call_timeout,
                remote.upsert(op.entity_type, outgoing.clone()),
            )
            .await?;
            // The upsert is a no-op when the stored version is equal or
            // newer. Confirming would clear `pending_sync` and silently
            // drop the local edit, so a divergent stored record comes back
            // as a rejection.
            let gated = stored.sync_version >= outgoing.sync_version
                && (stored.payload != outgoing.payload
                    || stored.is_deleted != outgoing.is_deleted);
            if gated {
                return Ok(PushOutcome::Rejected {
                    local: outgoing,
                    remote: stored,
                });
            }
            let mut confirmed = outgoing;
            confirmed.confirm_synced(stored.sync_version);
            Ok(PushOutcome::Applied(Some(confirmed)))
        }
        OperationKind::Delete => {
            let tombstone = local.get(op.entity_type, &op.entity_id).await?;
            let deleted_at = tombstone
                .as_ref()
                .map(|r| r.updated_at)
                .unwrap_or(op.enqueued_at);
            with_timeout(
                call_timeout,
                remote.soft_delete(op.entity_type, &op.entity_id, deleted_at),
            )
            .await?;
            Ok(PushOutcome::Applied(tombstone.map(|mut rec| {
                rec.is_deleted = true;
                rec.pending_sync = false;
                rec
            })))
        }
    }
}

/// Bound a remote call; elapsing counts as a retryable network failure.
async fn with_timeout<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Network("request timed out".to_string())),
    }
}
