//! Per-pass results, live progress, and cumulative engine statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use cardstack_common::{EntityId, EntityType};

use crate::detector::SyncConflict;

/// Where a sync pass currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    /// Nothing running.
    Idle,
    /// Fetching the remote delta.
    PullingDelta,
    /// Comparing local and remote snapshots.
    DetectingConflicts,
    /// Applying resolution strategies.
    Resolving,
    /// Draining the operation queue.
    PushingPending,
    /// Pass finished.
    Completed,
    /// Pass aborted.
    Failed,
}

/// Terminal state of a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    /// The pass ran to the end. Individual items may still have failed;
    /// check `error_count`.
    Completed,
    /// The pass could not run at all.
    Failed,
    /// The pass was cancelled; in-flight work finished, nothing new started.
    Cancelled,
    /// Another pass for the same scope was already running.
    AlreadySyncing,
}

/// One failed item inside an otherwise continuing pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncErrorDetail {
    /// Collection of the failed item, when known.
    pub entity_type: Option<EntityType>,
    /// Entity the failure concerns, when known.
    pub entity_id: Option<EntityId>,
    /// Queue operation id for push failures.
    pub operation_id: Option<Uuid>,
    /// Rendered error.
    pub error: String,
    /// Whether the failure was retryable (the operation was requeued).
    pub retryable: bool,
}

/// A live snapshot of pass progress, published over a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Current phase.
    pub phase: SyncPhase,
    /// Items processed so far in this phase.
    pub processed: usize,
    /// Total items in this phase, when known up front.
    pub total: usize,
}

impl SyncProgress {
    /// Idle snapshot.
    pub fn idle() -> Self {
        Self {
            phase: SyncPhase::Idle,
            processed: 0,
            total: 0,
        }
    }

    /// Fraction complete in [0, 1]; 0 when the total is unknown.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.processed as f64 / self.total as f64
        }
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::idle()
    }
}

/// Outcome of one sync pass.
///
/// Item-level failures accumulate in `errors` while the pass continues;
/// `status` only turns `Failed` when the pass as a whole could not run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    /// Terminal status of the pass.
    pub status: SyncStatus,
    /// Items the pass attempted.
    pub processed: usize,
    /// Items pushed or applied successfully.
    pub success_count: usize,
    /// Items that failed (retryable ones were requeued and still count).
    pub error_count: usize,
    /// Conflicts detected during the pass.
    pub conflict_count: usize,
    /// Conflicts resolved automatically.
    pub resolved_count: usize,
    /// Conflicts left for manual resolution.
    pub manual_conflicts: Vec<SyncConflict>,
    /// Item-level failures.
    pub errors: Vec<SyncErrorDetail>,
    /// When the pass started.
    pub started_at: DateTime<Utc>,
    /// When the pass finished.
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    /// An in-progress result started now.
    pub fn begin() -> Self {
        let now = Utc::now();
        Self {
            status: SyncStatus::Completed,
            processed: 0,
            success_count: 0,
            error_count: 0,
            conflict_count: 0,
            resolved_count: 0,
            manual_conflicts: Vec::new(),
            errors: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    /// The immediate result returned when a pass for the same scope is
    /// already running.
    pub fn already_syncing() -> Self {
        let mut result = Self::begin();
        result.status = SyncStatus::AlreadySyncing;
        result
    }

    /// A pass that could not run, with the reason recorded.
    pub fn failed(error: impl Into<String>) -> Self {
        let mut result = Self::begin();
        result.status = SyncStatus::Failed;
        result.errors.push(SyncErrorDetail {
            entity_type: None,
            entity_id: None,
            operation_id: None,
            error: error.into(),
            retryable: false,
        });
        result.error_count = 1;
        result
    }

    /// Record a successfully processed item.
    pub fn record_success(&mut self) {
        self.processed += 1;
        self.success_count += 1;
    }

    /// Record a failed item. Retryable failures were requeued elsewhere;
    /// they still count as errors for this pass.
    pub fn record_error(&mut self, detail: SyncErrorDetail) {
        self.processed += 1;
        self.error_count += 1;
        self.errors.push(detail);
    }

    /// Record a detected conflict that was resolved automatically.
    pub fn record_resolved_conflict(&mut self) {
        self.conflict_count += 1;
        self.resolved_count += 1;
    }

    /// Record a detected conflict left for manual resolution.
    pub fn record_manual_conflict(&mut self, conflict: SyncConflict) {
        self.conflict_count += 1;
        self.manual_conflicts.push(conflict);
    }

    /// Merge another pass's counters into this one. Used when a combined
    /// call runs several scoped passes.
    pub fn absorb(&mut self, other: SyncResult) {
        self.processed += other.processed;
        self.success_count += other.success_count;
        self.error_count += other.error_count;
        self.conflict_count += other.conflict_count;
        self.resolved_count += other.resolved_count;
        self.manual_conflicts.extend(other.manual_conflicts);
        self.errors.extend(other.errors);
        if other.status != SyncStatus::Completed {
            self.status = other.status;
        }
        if other.finished_at > self.finished_at {
            self.finished_at = other.finished_at;
        }
    }

    /// Stamp the terminal status and finish time.
    pub fn finish(mut self, status: SyncStatus) -> Self {
        self.status = status;
        self.finished_at = Utc::now();
        self
    }

    /// Whether the pass ran to the end without any item failing.
    pub fn is_clean(&self) -> bool {
        self.status == SyncStatus::Completed && self.error_count == 0
    }

    /// Wall-clock duration of the pass.
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Cumulative counters across the lifetime of an orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    /// Passes that ran to completion.
    pub cycles_completed: u64,
    /// Passes that failed outright.
    pub cycles_failed: u64,
    /// Items pushed successfully, total.
    pub records_pushed: u64,
    /// Records pulled and applied, total.
    pub records_pulled: u64,
    /// Conflicts detected, total.
    pub conflicts_detected: u64,
    /// Conflicts resolved automatically, total.
    pub conflicts_resolved: u64,
    /// Operations evicted from a full queue, total.
    pub operations_evicted: u64,
    /// Finish time of the most recent completed pass.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Most recent pass-level error, if any.
    pub last_error: Option<String>,
}

impl SyncStats {
    /// Fold one pass result into the running totals.
    pub fn record(&mut self, result: &SyncResult, pulled: u64, pushed: u64) {
        match result.status {
            SyncStatus::Completed | SyncStatus::Cancelled => {
                self.cycles_completed += 1;
                self.last_sync_at = Some(result.finished_at);
            }
            SyncStatus::Failed => {
                self.cycles_failed += 1;
                self.last_error = result.errors.first().map(|e| e.error.clone());
            }
            SyncStatus::AlreadySyncing => return,
        }
        self.records_pulled += pulled;
        self.records_pushed += pushed;
        self.conflicts_detected += result.conflict_count as u64;
        self.conflicts_resolved += result.resolved_count as u64;
    }
}
