//! The versioned entity representation shared by all sync components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cardstack_common::{EntityId, EntityType, UserId};

/// Any synchronizable entity: a card, folder, tag or image.
///
/// The entity-specific fields live in `payload` as structured JSON; the
/// surrounding fields carry the versioning state the engine maintains.
///
/// Invariant: `sync_version` never decreases. Every local mutation and every
/// remote-accepted mutation bumps it by one. Deletes are soft: the record is
/// kept with `is_deleted = true` so the deletion propagates to peers that
/// have not yet synced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    /// Stable unique id.
    pub id: EntityId,
    /// Owner scoping every remote call.
    pub owner_id: UserId,
    /// Which entity collection this record belongs to.
    pub entity_type: EntityType,
    /// Entity-specific content.
    pub payload: Value,
    /// Monotonically increasing version counter.
    pub sync_version: u64,
    /// Wall-clock time of the last mutation.
    pub updated_at: DateTime<Utc>,
    /// True while a local mutation has not been confirmed remotely.
    pub pending_sync: bool,
    /// Tombstone flag for soft deletion.
    pub is_deleted: bool,
}

impl VersionedRecord {
    /// Create a fresh record at version 1 with a pending local mutation.
    pub fn new(
        id: EntityId,
        owner_id: UserId,
        entity_type: EntityType,
        payload: Value,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            owner_id,
            entity_type,
            payload,
            sync_version: 1,
            updated_at,
            pending_sync: true,
            is_deleted: false,
        }
    }

    /// Apply a local payload mutation: bump the version, stamp the time,
    /// flag the record as pending.
    pub fn apply_local_update(&mut self, payload: Value, updated_at: DateTime<Utc>) {
        self.payload = payload;
        self.sync_version += 1;
        self.updated_at = updated_at;
        self.pending_sync = true;
    }

    /// Turn the record into a tombstone.
    pub fn apply_local_delete(&mut self, updated_at: DateTime<Utc>) {
        self.is_deleted = true;
        self.sync_version += 1;
        self.updated_at = updated_at;
        self.pending_sync = true;
    }

    /// Mark the record as confirmed by the remote store at the given version.
    pub fn confirm_synced(&mut self, remote_version: u64) {
        if remote_version > self.sync_version {
            self.sync_version = remote_version;
        }
        self.pending_sync = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> VersionedRecord {
        VersionedRecord::new(
            EntityId::generate(),
            UserId::new("user-1").unwrap(),
            EntityType::Card,
            json!({"title": "first"}),
            Utc::now(),
        )
    }

    #[test]
    fn local_update_bumps_version() {
        let mut rec = record();
        assert_eq!(rec.sync_version, 1);
        rec.apply_local_update(json!({"title": "second"}), Utc::now());
        assert_eq!(rec.sync_version, 2);
        assert!(rec.pending_sync);
    }

    #[test]
    fn delete_is_soft() {
        let mut rec = record();
        rec.apply_local_delete(Utc::now());
        assert!(rec.is_deleted);
        assert_eq!(rec.sync_version, 2);
        assert_eq!(rec.payload, json!({"title": "first"}));
    }

    #[test]
    fn confirm_never_lowers_version() {
        let mut rec = record();
        rec.apply_local_update(json!({"title": "second"}), Utc::now());
        rec.confirm_synced(1);
        assert_eq!(rec.sync_version, 2);
        assert!(!rec.pending_sync);
    }
}
