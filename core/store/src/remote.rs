//! Remote store collaborator trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cardstack_common::{EntityId, EntityType, Result, UserId};

use crate::record::VersionedRecord;

/// The remote upsert/query/delete API the engine reconciles against.
///
/// Implementations classify their own failures into the common error
/// taxonomy (`Network`, `Server`, `Permission`, `Auth`, `Validation`); the
/// engine does not re-classify, it only decides retry behavior from
/// `Error::is_retryable`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Records of `entity_type` owned by `owner` with `updated_at >= since`,
    /// or the full collection when `since` is `None`. Tombstones included.
    async fn fetch_since(
        &self,
        entity_type: EntityType,
        owner: &UserId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<VersionedRecord>>;

    /// Upsert keyed by id with last-writer version comparison: a record whose
    /// `sync_version` does not exceed the stored one is a no-op, and the
    /// stored record is returned either way. This is what makes a retried
    /// push idempotent.
    async fn upsert(
        &self,
        entity_type: EntityType,
        record: VersionedRecord,
    ) -> Result<VersionedRecord>;

    /// Soft-delete on the remote side, leaving a tombstone.
    async fn soft_delete(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        deleted_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Fetch specific records by id. Unknown ids are silently absent from
    /// the result.
    async fn fetch_by_ids(
        &self,
        entity_type: EntityType,
        ids: &[EntityId],
    ) -> Result<Vec<VersionedRecord>>;
}
