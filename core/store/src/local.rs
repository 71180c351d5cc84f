//! Local storage collaborator trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cardstack_common::{EntityId, EntityType, Result};

use crate::record::VersionedRecord;

/// A single write inside an atomic batch.
#[derive(Debug, Clone)]
pub enum LocalWrite {
    /// Upsert a record (versioned).
    Put(VersionedRecord),
    /// Soft-delete a record, leaving a tombstone.
    SoftDelete {
        /// Collection of the record.
        entity_type: EntityType,
        /// Id of the record.
        id: EntityId,
        /// Time of the deletion.
        deleted_at: DateTime<Utc>,
    },
}

/// An ordered set of writes applied atomically.
///
/// The batch sync engine wraps each push batch's accepted results in one
/// `WriteBatch` so a crash mid-batch cannot leave the local store and the
/// retry queue inconsistent.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    writes: Vec<LocalWrite>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an upsert.
    pub fn put(&mut self, record: VersionedRecord) -> &mut Self {
        self.writes.push(LocalWrite::Put(record));
        self
    }

    /// Add a soft delete.
    pub fn soft_delete(
        &mut self,
        entity_type: EntityType,
        id: EntityId,
        deleted_at: DateTime<Utc>,
    ) -> &mut Self {
        self.writes.push(LocalWrite::SoftDelete {
            entity_type,
            id,
            deleted_at,
        });
        self
    }

    /// Number of writes in the batch.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Consume the batch, yielding its writes in order.
    pub fn into_writes(self) -> Vec<LocalWrite> {
        self.writes
    }

    /// Borrow the writes in order.
    pub fn writes(&self) -> &[LocalWrite] {
        &self.writes
    }
}

/// The on-device database the engine reads from and writes through.
///
/// Implementations sit on top of whatever embedded store the application
/// uses. The engine only ever mutates versioned fields through this trait.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Fetch one record, tombstones included.
    async fn get(&self, entity_type: EntityType, id: &EntityId)
        -> Result<Option<VersionedRecord>>;

    /// Upsert one record.
    async fn put(&self, record: VersionedRecord) -> Result<()>;

    /// Soft-delete one record. Missing records are not an error: the
    /// tombstone may arrive from remote before the entity was ever seen.
    async fn delete(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        deleted_at: DateTime<Utc>,
    ) -> Result<()>;

    /// All records of a type modified at or after `since`; everything when
    /// `since` is `None`. Tombstones included.
    async fn query_updated_since(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<VersionedRecord>>;

    /// Apply a batch of writes atomically: either all writes land or none do.
    async fn transact(&self, batch: WriteBatch) -> Result<()>;
}
