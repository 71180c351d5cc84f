//! Offline operation queue: durable, ordered, priority-tiered.
//!
//! Local mutations made while disconnected are queued here and drained by
//! the batch sync engine once connectivity returns. The queue is the single
//! mutable structure shared across batch workers; workers only go through
//! `enqueue`/`dequeue_batch`/`ack`/`requeue`, never the internals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use cardstack_common::{EntityId, EntityType};

use crate::retry::RetryConfig;

/// Priority of a queued operation. Higher priorities drain first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background housekeeping.
    Low,
    /// Ordinary user mutations.
    Normal,
    /// User-visible mutations that should land quickly.
    High,
    /// Must-not-lose mutations (e.g. deletes the UI already reflects).
    Critical,
}

impl Priority {
    const COUNT: usize = 4;

    /// Tier index, highest priority first.
    fn tier(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

/// What a queued operation does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// New entity to push.
    Create,
    /// Existing entity modified.
    Update,
    /// Entity to tombstone.
    Delete,
}

/// Lifecycle state of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    /// Waiting in the queue.
    Queued,
    /// Handed to a batch worker.
    InFlight,
    /// Applied remotely and acknowledged.
    Completed,
    /// Retries exhausted or non-retryable failure.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

/// A queued unit of work: one local mutation awaiting remote application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Unique operation id.
    pub id: Uuid,
    /// What the operation does.
    pub kind: OperationKind,
    /// Collection of the target entity.
    pub entity_type: EntityType,
    /// Target entity.
    pub entity_id: EntityId,
    /// Payload after the mutation.
    pub payload: Value,
    /// Payload before the mutation, kept for merge resolution.
    pub previous_payload: Option<Value>,
    /// Drain priority.
    pub priority: Priority,
    /// Attempts made so far.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// When the operation entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: OperationStatus,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
}

impl SyncOperation {
    fn new(kind: OperationKind, entity_type: EntityType, entity_id: EntityId, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            entity_type,
            entity_id,
            payload,
            previous_payload: None,
            priority: Priority::Normal,
            retry_count: 0,
            max_retries: 3,
            enqueued_at: Utc::now(),
            status: OperationStatus::Queued,
            last_error: None,
        }
    }

    /// An operation pushing a newly created entity.
    pub fn create(entity_type: EntityType, entity_id: EntityId, payload: Value) -> Self {
        Self::new(OperationKind::Create, entity_type, entity_id, payload)
    }

    /// An operation pushing an update, with the pre-mutation payload kept
    /// for merge resolution.
    pub fn update(
        entity_type: EntityType,
        entity_id: EntityId,
        payload: Value,
        previous_payload: Option<Value>,
    ) -> Self {
        let mut op = Self::new(OperationKind::Update, entity_type, entity_id, payload);
        op.previous_payload = previous_payload;
        op
    }

    /// An operation pushing a soft delete. Deletes default to high priority.
    pub fn delete(entity_type: EntityType, entity_id: EntityId) -> Self {
        let mut op = Self::new(OperationKind::Delete, entity_type, entity_id, Value::Null);
        op.priority = Priority::High;
        op
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Result of [`OperationQueue::enqueue`].
#[derive(Debug)]
pub struct EnqueueOutcome {
    /// Id of the accepted operation.
    pub id: Uuid,
    /// A low-priority operation evicted to stay within capacity, if any.
    /// Callers must report it; eviction is never silent.
    pub evicted: Option<SyncOperation>,
}

/// Result of [`OperationQueue::requeue`].
#[derive(Debug)]
pub enum RequeueOutcome {
    /// The operation went back to the tail of its tier.
    Requeued {
        /// How long the operation is held back before the next attempt.
        delay: Duration,
        /// Attempts made so far, including the one that just failed.
        retry_count: u32,
    },
    /// The retry budget is spent; the operation is terminally failed.
    Exhausted(SyncOperation),
}

#[derive(Debug)]
struct QueuedOp {
    seq: u64,
    not_before: Option<Instant>,
    op: SyncOperation,
}

#[derive(Debug, Default)]
struct QueueInner {
    tiers: [VecDeque<QueuedOp>; Priority::COUNT],
    in_flight: HashMap<Uuid, SyncOperation>,
    in_flight_entities: HashSet<EntityId>,
    next_seq: u64,
}

impl QueueInner {
    fn queued_len(&self) -> usize {
        self.tiers.iter().map(|t| t.len()).sum()
    }

    fn push(&mut self, mut op: SyncOperation, not_before: Option<Instant>) {
        op.status = OperationStatus::Queued;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tiers[op.priority.tier()].push_back(QueuedOp {
            seq,
            not_before,
            op,
        });
    }

    /// Smallest sequence number per entity across all tiers. Used to keep
    /// per-entity FIFO order even when priorities differ.
    fn oldest_seq_per_entity(&self) -> HashMap<EntityId, u64> {
        let mut oldest: HashMap<EntityId, u64> = HashMap::new();
        for tier in &self.tiers {
            for queued in tier {
                oldest
                    .entry(queued.op.entity_id)
                    .and_modify(|s| *s = (*s).min(queued.seq))
                    .or_insert(queued.seq);
            }
        }
        oldest
    }
}

/// Bounded, priority-tiered FIFO queue of pending sync operations.
///
/// Ordering guarantees: batches drain critical before high before normal
/// before low, FIFO within a tier; and for any single entity id at most one
/// operation is in flight at a time, dispatched in enqueue order regardless
/// of priority.
pub struct OperationQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    backoff: RetryConfig,
}

impl OperationQueue {
    /// Create a queue with the given soft capacity bound and backoff policy.
    pub fn new(capacity: usize, backoff: RetryConfig) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            capacity,
            backoff,
        }
    }

    /// Accept an operation regardless of connectivity. Never blocks.
    ///
    /// When the queue exceeds capacity the oldest low-priority operation is
    /// evicted and returned for reporting. High and critical operations are
    /// never evicted; if nothing is evictable the new operation is accepted
    /// over capacity.
    pub fn enqueue(&self, op: SyncOperation) -> EnqueueOutcome {
        let mut inner = self.inner.lock().unwrap();
        let id = op.id;
        inner.push(op, None);

        let mut evicted = None;
        if inner.queued_len() > self.capacity {
            let low = &mut inner.tiers[Priority::Low.tier()];
            // Front of the low tier is its oldest entry.
            if let Some(victim) = low.pop_front() {
                let mut op = victim.op;
                warn!(
                    operation_id = %op.id,
                    entity_id = %op.entity_id,
                    "Queue over capacity, evicting oldest low-priority operation"
                );
                op.status = OperationStatus::Cancelled;
                evicted = Some(op);
            }
        }

        EnqueueOutcome { id, evicted }
    }

    /// Take up to `max_size` operations, priority tiers first, FIFO within a
    /// tier. Selected operations transition to `InFlight`.
    ///
    /// Operations are skipped while an older queued or in-flight operation
    /// exists for the same entity, and while their backoff delay has not
    /// elapsed.
    pub fn dequeue_batch(&self, max_size: usize) -> Vec<SyncOperation> {
        let mut inner = self.inner.lock().unwrap();
        if max_size == 0 {
            return Vec::new();
        }

        let oldest = inner.oldest_seq_per_entity();
        let now = Instant::now();
        let mut selected = Vec::new();

        for tier_idx in 0..Priority::COUNT {
            if selected.len() >= max_size {
                break;
            }
            let tier = &mut inner.tiers[tier_idx];
            let mut remaining = VecDeque::with_capacity(tier.len());
            while let Some(queued) = tier.pop_front() {
                let eligible = selected.len() < max_size
                    && oldest.get(&queued.op.entity_id) == Some(&queued.seq)
                    && queued.not_before.map_or(true, |t| now >= t);
                // An entity already in flight keeps all its queued ops back.
                if eligible {
                    selected.push(queued);
                } else {
                    remaining.push_back(queued);
                }
            }
            *tier = remaining;
        }

        // Filter out entities with in-flight work, then mark the rest.
        let mut batch = Vec::with_capacity(selected.len());
        let mut blocked = Vec::new();
        for queued in selected {
            if inner.in_flight_entities.contains(&queued.op.entity_id) {
                // Goes back untouched; it stays the oldest for its entity.
                blocked.push(queued);
                continue;
            }
            let mut op = queued.op;
            op.status = OperationStatus::InFlight;
            inner.in_flight_entities.insert(op.entity_id);
            inner.in_flight.insert(op.id, op.clone());
            batch.push(op);
        }
        // Re-insert blocked entries and restore FIFO order in every tier
        // they touched. Sequence numbers only grow, so sorting by seq is
        // exactly the original order.
        let mut touched = [false; Priority::COUNT];
        for queued in blocked {
            let tier = queued.op.priority.tier();
            inner.tiers[tier].push_front(queued);
            touched[tier] = true;
        }
        for (tier, touched) in touched.into_iter().enumerate() {
            if touched {
                inner.tiers[tier].make_contiguous().sort_by_key(|q| q.seq);
            }
        }

        debug!(count = batch.len(), "Dequeued operation batch");
        batch
    }

    /// Acknowledge a successfully applied operation, removing it.
    pub fn ack(&self, id: &Uuid) -> Option<SyncOperation> {
        let mut inner = self.inner.lock().unwrap();
        let mut op = inner.in_flight.remove(id)?;
        inner.in_flight_entities.remove(&op.entity_id);
        op.status = OperationStatus::Completed;
        Some(op)
    }

    /// Return a failed in-flight operation to the tail of its tier with
    /// backoff, or terminally fail it when the retry budget is spent.
    pub fn requeue(&self, id: &Uuid, error: impl Into<String>) -> Option<RequeueOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let mut op = inner.in_flight.remove(id)?;
        inner.in_flight_entities.remove(&op.entity_id);

        op.retry_count += 1;
        op.last_error = Some(error.into());

        if op.retry_count >= op.max_retries {
            op.status = OperationStatus::Failed;
            warn!(
                operation_id = %op.id,
                entity_id = %op.entity_id,
                retries = op.retry_count,
                "Operation exhausted its retry budget"
            );
            return Some(RequeueOutcome::Exhausted(op));
        }

        let delay = self.backoff.delay_for_attempt(op.retry_count - 1);
        let retry_count = op.retry_count;
        inner.push(op, Some(Instant::now() + delay));
        Some(RequeueOutcome::Requeued { delay, retry_count })
    }

    /// Terminally fail an in-flight operation without retrying (for
    /// non-retryable errors).
    pub fn fail(&self, id: &Uuid, error: impl Into<String>) -> Option<SyncOperation> {
        let mut inner = self.inner.lock().unwrap();
        let mut op = inner.in_flight.remove(id)?;
        inner.in_flight_entities.remove(&op.entity_id);
        op.status = OperationStatus::Failed;
        op.last_error = Some(error.into());
        Some(op)
    }

    /// Number of queued (not in-flight) operations.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queued_len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of in-flight operations.
    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().unwrap().in_flight.len()
    }

    /// Export all pending operations so the embedding application can
    /// persist them across restarts. In-flight operations are included,
    /// re-marked as queued and ahead of the queued ones; a crash between
    /// dequeue and ack must not lose them, and re-applying an already
    /// pushed operation is idempotent on the remote side.
    pub fn snapshot(&self) -> Vec<SyncOperation> {
        let inner = self.inner.lock().unwrap();
        let mut all: Vec<SyncOperation> = inner.in_flight.values().cloned().collect();
        for op in &mut all {
            op.status = OperationStatus::Queued;
        }
        all.sort_by_key(|op| (op.priority.tier(), op.enqueued_at));

        let mut queued: Vec<&QueuedOp> = inner.tiers.iter().flatten().collect();
        queued.sort_by_key(|q| (q.op.priority.tier(), q.seq));
        all.extend(queued.iter().map(|q| q.op.clone()));
        all
    }

    /// Re-enqueue previously snapshotted operations, preserving order.
    pub fn restore(&self, ops: Vec<SyncOperation>) {
        let mut inner = self.inner.lock().unwrap();
        for op in ops {
            inner.push(op, None);
        }
    }
}
