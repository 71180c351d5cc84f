//! CardStack Sync Engine
//!
//! Offline synchronization and conflict resolution for the CardStack data
//! layer, including:
//! - Durable priority queue for mutations made while disconnected
//! - Network quality monitoring with debounced catch-up sync
//! - Conflict detection down to individual payload fields
//! - Multi-strategy conflict resolution with per-entity overrides
//! - Batched push/pull with bounded concurrency and retry
//! - An orchestrator façade exposing up/down/bidirectional/incremental sync

pub mod batch;
pub mod config;
pub mod detector;
pub mod network;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod resolver;
pub mod retry;

// Re-export main types
pub use batch::BatchSyncEngine;
pub use config::{DetectionConfig, SyncConfig};
pub use detector::{ConflictDetector, ConflictKind, ConflictReason, FieldConflict, SyncConflict};
pub use network::{BatchPlan, Bandwidth, LatencyClass, NetworkMonitor, NetworkQuality};
pub use orchestrator::SyncOrchestrator;
pub use progress::{SyncErrorDetail, SyncPhase, SyncProgress, SyncResult, SyncStats, SyncStatus};
pub use queue::{
    EnqueueOutcome, OperationKind, OperationQueue, OperationStatus, Priority, RequeueOutcome,
    SyncOperation,
};
pub use resolver::{ConflictResolver, Resolution, ResolutionStrategy};
pub use retry::{RetryConfig, RetryExecutor};
