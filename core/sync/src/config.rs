//! Configuration for the sync engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use cardstack_common::EntityType;

use crate::detector::ConflictKind;
use crate::resolver::ResolutionStrategy;
use crate::retry::RetryConfig;

/// Conflict detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Whether conflict detection runs at all. When disabled, remote records
    /// overwrite local copies unconditionally.
    pub enabled: bool,
    /// Whether to compare individual payload leaf fields instead of whole
    /// records.
    pub field_granularity: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            field_granularity: true,
        }
    }
}

/// Configuration for the sync engine.
///
/// Strategy precedence is entity-type override, then conflict-kind override,
/// then `default_strategy`. An override counts as configured by being present
/// in its map; equality with the default is irrelevant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Operations per push batch (upper bound; adapted down on poor links).
    pub batch_size: usize,
    /// Maximum number of push batches in flight concurrently.
    pub max_concurrent_batches: usize,
    /// Timeout applied to every individual network call.
    pub timeout: Duration,
    /// Backoff policy shared by the queue and the retry executor.
    pub retry: RetryConfig,
    /// Soft capacity bound of the offline operation queue.
    pub queue_capacity: usize,
    /// Strategy applied when no override matches.
    pub default_strategy: ResolutionStrategy,
    /// Per-entity-type strategy overrides.
    pub entity_strategies: HashMap<EntityType, ResolutionStrategy>,
    /// Per-conflict-kind strategy overrides.
    pub kind_strategies: HashMap<ConflictKind, ResolutionStrategy>,
    /// Conflict detection settings.
    pub detection: DetectionConfig,
    /// How long connectivity must stay up before the catch-up sync fires.
    pub stabilization_window: Duration,
}

impl SyncConfig {
    /// Set the push batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the concurrency cap for push batches.
    pub fn with_max_concurrent_batches(mut self, max: usize) -> Self {
        self.max_concurrent_batches = max;
        self
    }

    /// Set the per-call network timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the backoff policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the queue's soft capacity bound.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the global default resolution strategy.
    pub fn with_default_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Configure a strategy override for one entity type.
    pub fn with_entity_strategy(
        mut self,
        entity_type: EntityType,
        strategy: ResolutionStrategy,
    ) -> Self {
        self.entity_strategies.insert(entity_type, strategy);
        self
    }

    /// Configure a strategy override for one conflict kind.
    pub fn with_kind_strategy(
        mut self,
        kind: ConflictKind,
        strategy: ResolutionStrategy,
    ) -> Self {
        self.kind_strategies.insert(kind, strategy);
        self
    }

    /// Set conflict detection options.
    pub fn with_detection(mut self, detection: DetectionConfig) -> Self {
        self.detection = detection;
        self
    }

    /// Set the connectivity stabilization window.
    pub fn with_stabilization_window(mut self, window: Duration) -> Self {
        self.stabilization_window = window;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_concurrent_batches: 3,
            timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            queue_capacity: 1000,
            default_strategy: ResolutionStrategy::TimestampBased,
            entity_strategies: HashMap::new(),
            kind_strategies: HashMap::new(),
            detection: DetectionConfig::default(),
            stabilization_window: Duration::from_secs(2),
        }
    }
}
