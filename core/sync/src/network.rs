//! Network state monitoring and quality-adaptive batch planning.
//!
//! The embedding application feeds connectivity observations in; the
//! orchestrator subscribes to transitions and pauses or resumes sync
//! accordingly. Quality also drives how aggressively pushes are batched.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::config::SyncConfig;

/// Coarse bandwidth classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bandwidth {
    /// Barely usable link.
    Poor,
    /// Constrained link.
    Fair,
    /// Ordinary link.
    Good,
    /// Fast link.
    Excellent,
}

/// Coarse round-trip latency classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyClass {
    /// Low round-trip times.
    Low,
    /// Noticeable round-trip times.
    Medium,
    /// High round-trip times.
    High,
}

/// A snapshot of connection state and quality.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkQuality {
    /// Whether the device is online at all.
    pub online: bool,
    /// Bandwidth class.
    pub bandwidth: Bandwidth,
    /// Latency class.
    pub latency: LatencyClass,
    /// Fraction of recent requests that succeeded, in [0, 1].
    pub reliability: f64,
}

impl NetworkQuality {
    /// Offline state.
    pub fn offline() -> Self {
        Self {
            online: false,
            bandwidth: Bandwidth::Poor,
            latency: LatencyClass::High,
            reliability: 0.0,
        }
    }

    /// Online with the given quality classes.
    pub fn online(bandwidth: Bandwidth, latency: LatencyClass, reliability: f64) -> Self {
        Self {
            online: true,
            bandwidth,
            latency,
            reliability: reliability.clamp(0.0, 1.0),
        }
    }

    /// A healthy default used when the application reports bare "online".
    pub fn online_good() -> Self {
        Self::online(Bandwidth::Good, LatencyClass::Medium, 1.0)
    }
}

/// Batch sizing derived from network quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    /// Operations per push batch.
    pub batch_size: usize,
    /// Batches allowed in flight concurrently.
    pub concurrency: usize,
}

impl BatchPlan {
    /// Derive a plan from quality: poor links get small sequential batches,
    /// excellent links get the configured size and full concurrency.
    pub fn for_quality(quality: &NetworkQuality, config: &SyncConfig) -> Self {
        if !quality.online {
            return Self {
                batch_size: 0,
                concurrency: 0,
            };
        }
        let (batch_size, concurrency) = match quality.bandwidth {
            Bandwidth::Poor => ((config.batch_size / 4).max(1), 1),
            Bandwidth::Fair => ((config.batch_size / 2).max(1), 1),
            Bandwidth::Good => (config.batch_size, (config.max_concurrent_batches / 2).max(1)),
            Bandwidth::Excellent => (config.batch_size, config.max_concurrent_batches.max(1)),
        };
        Self {
            batch_size,
            concurrency,
        }
    }
}

/// Tracks connectivity and publishes transitions to subscribers.
pub struct NetworkMonitor {
    quality: watch::Sender<NetworkQuality>,
}

impl NetworkMonitor {
    /// Create a monitor with an initial state.
    pub fn new(initial: NetworkQuality) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { quality: tx }
    }

    /// Current quality snapshot.
    pub fn current_quality(&self) -> NetworkQuality {
        *self.quality.borrow()
    }

    /// Subscribe to quality transitions.
    pub fn subscribe(&self) -> watch::Receiver<NetworkQuality> {
        self.quality.subscribe()
    }

    /// Report that connectivity came back, with default good quality.
    pub fn report_online(&self) {
        self.update_quality(NetworkQuality::online_good());
    }

    /// Report that connectivity was lost.
    pub fn report_offline(&self) {
        self.update_quality(NetworkQuality::offline());
    }

    /// Feed a full quality observation.
    pub fn update_quality(&self, quality: NetworkQuality) {
        let was_online = self.quality.borrow().online;
        if was_online != quality.online {
            info!(online = quality.online, "Network transition");
        }
        self.quality.send_replace(quality);
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkQuality::online_good())
    }
}
