//! Event sink collaborator for lifecycle observers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cardstack_common::{EntityId, EntityType};

/// Lifecycle events emitted by the sync engine.
///
/// The engine publishes these for external observers (UI refresh, telemetry)
/// and has no dependency on any particular transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SyncEvent {
    /// A sync pass started for an entity type.
    SyncStarted {
        /// Entity type being synced.
        entity_type: EntityType,
    },
    /// A sync pass finished.
    SyncCompleted {
        /// Entity type that was synced.
        entity_type: EntityType,
        /// Items applied successfully.
        success_count: usize,
        /// Items that failed.
        error_count: usize,
        /// Conflicts encountered.
        conflict_count: usize,
    },
    /// A sync pass failed outright.
    SyncFailed {
        /// Entity type that was being synced.
        entity_type: EntityType,
        /// Failure description.
        message: String,
    },
    /// The push phase started draining the operation queue.
    PushStarted,
    /// The push phase finished.
    PushCompleted {
        /// Operations applied remotely.
        success_count: usize,
        /// Operations that failed.
        error_count: usize,
    },
    /// The push phase failed outright.
    PushFailed {
        /// Failure description.
        message: String,
    },
    /// Local and remote copies of an entity diverged.
    ConflictDetected {
        /// Entity type of the conflicted record.
        entity_type: EntityType,
        /// Id of the conflicted record.
        entity_id: EntityId,
    },
    /// A detected conflict was resolved automatically.
    ConflictResolved {
        /// Entity type of the resolved record.
        entity_type: EntityType,
        /// Id of the resolved record.
        entity_id: EntityId,
        /// Name of the strategy that resolved it.
        strategy: String,
    },
    /// A conflict could not be auto-resolved and awaits manual resolution.
    ConflictPending {
        /// Entity type of the conflicted record.
        entity_type: EntityType,
        /// Id of the conflicted record.
        entity_id: EntityId,
    },
    /// A queued operation was evicted to keep the queue within capacity.
    OperationEvicted {
        /// Id of the evicted operation.
        operation_id: Uuid,
        /// Entity the operation targeted.
        entity_id: EntityId,
    },
    /// A queued operation exhausted its retries.
    OperationFailed {
        /// Id of the failed operation.
        operation_id: Uuid,
        /// Entity the operation targeted.
        entity_id: EntityId,
        /// Final error description.
        message: String,
    },
    /// Connectivity came back.
    NetworkOnline,
    /// Connectivity was lost.
    NetworkOffline,
}

/// Publish interface for sync lifecycle events.
///
/// Implementations must be cheap and non-blocking; the engine calls this
/// from inside sync passes.
pub trait EventSink: Send + Sync {
    /// Publish one event.
    fn publish(&self, event: SyncEvent);
}
