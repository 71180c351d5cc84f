//! Conflict detection between local and remote snapshots of an entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use cardstack_common::{EntityId, EntityType};
use cardstack_store::VersionedRecord;

use crate::config::DetectionConfig;

/// The shape of a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// Both sides edited the entity.
    UpdateUpdate,
    /// Local edited, remote deleted.
    UpdateDelete,
    /// Local deleted, remote edited.
    DeleteUpdate,
    /// Both sides independently created the entity.
    CreateCreate,
}

/// Why a field entry is in conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictReason {
    /// Present on both sides with different values.
    BothEdited,
    /// Present only in the local payload.
    LocalOnly,
    /// Present only in the remote payload.
    RemoteOnly,
}

/// One divergent leaf field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    /// Dotted path of the leaf field inside the payload.
    pub field: String,
    /// Local value, absent when the field only exists remotely.
    pub local_value: Option<Value>,
    /// Remote value, absent when the field only exists locally.
    pub remote_value: Option<Value>,
    /// Why this entry exists.
    pub reason: ConflictReason,
}

/// A detected divergence between local and remote copies of one entity.
///
/// Created per sync pass and consumed immediately by the resolver; conflicts
/// that cannot be auto-resolved are surfaced for manual resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Collection of the conflicted entity.
    pub entity_type: EntityType,
    /// Id of the conflicted entity.
    pub entity_id: EntityId,
    /// The local copy.
    pub local: VersionedRecord,
    /// The remote copy.
    pub remote: VersionedRecord,
    /// Common ancestor for three-way merge, when known.
    pub base: Option<VersionedRecord>,
    /// Shape of the conflict.
    pub kind: ConflictKind,
    /// Divergent leaf fields; empty when field granularity is disabled.
    pub field_conflicts: Vec<FieldConflict>,
    /// Local version at detection time.
    pub local_version: u64,
    /// Remote version at detection time.
    pub remote_version: u64,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
}

/// Compares local and remote snapshots to decide whether a true conflict
/// exists.
///
/// A conflict requires concurrent modification: both sides' `updated_at`
/// strictly after the last-sync watermark. Version numbers only gate whether
/// detection runs at all; they never trigger a conflict by themselves.
pub struct ConflictDetector {
    config: DetectionConfig,
}

impl ConflictDetector {
    /// Create a detector with the given settings.
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    /// Compare all overlapping entities of two snapshots.
    ///
    /// Entities present only locally are creations, present only remotely
    /// are new pulls; neither is a conflict.
    pub fn detect(
        &self,
        entity_type: EntityType,
        local_records: &[VersionedRecord],
        remote_records: &[VersionedRecord],
        last_sync: Option<DateTime<Utc>>,
    ) -> Vec<SyncConflict> {
        let local_by_id: HashMap<EntityId, &VersionedRecord> =
            local_records.iter().map(|r| (r.id, r)).collect();

        let mut conflicts = Vec::new();
        for remote in remote_records {
            debug_assert_eq!(remote.entity_type, entity_type);
            if let Some(local) = local_by_id.get(&remote.id) {
                if let Some(conflict) = self.check_pair(local, remote, last_sync) {
                    conflicts.push(conflict);
                }
            }
        }
        debug!(
            entity_type = %entity_type,
            count = conflicts.len(),
            "Conflict detection pass finished"
        );
        conflicts
    }

    /// Compare one local/remote pair.
    pub fn check_pair(
        &self,
        local: &VersionedRecord,
        remote: &VersionedRecord,
        last_sync: Option<DateTime<Utc>>,
    ) -> Option<SyncConflict> {
        if !self.config.enabled {
            return None;
        }

        // Nothing new arrived and nothing changed locally: skip detection
        // entirely. The version gate alone never triggers a conflict.
        if remote.sync_version <= local.sync_version && !local.pending_sync {
            return None;
        }

        // Concurrent-modification predicate: each side must independently
        // exceed the watermark. Without a watermark every modification
        // counts as post-watermark.
        let local_modified = last_sync.map_or(true, |w| local.updated_at > w);
        let remote_modified = last_sync.map_or(true, |w| remote.updated_at > w);
        if !(local_modified && remote_modified) {
            return None;
        }

        // Two identical tombstones, or identical content, have converged.
        if local.is_deleted && remote.is_deleted {
            return None;
        }
        if !local.is_deleted
            && !remote.is_deleted
            && local.payload == remote.payload
        {
            return None;
        }

        let kind = match (local.is_deleted, remote.is_deleted) {
            (false, true) => ConflictKind::UpdateDelete,
            (true, false) => ConflictKind::DeleteUpdate,
            (false, false) if local.sync_version == 1 && remote.sync_version == 1 => {
                ConflictKind::CreateCreate
            }
            _ => ConflictKind::UpdateUpdate,
        };

        let field_conflicts = if self.config.field_granularity && !local.is_deleted && !remote.is_deleted
        {
            diff_leaf_fields(&local.payload, &remote.payload)
        } else {
            Vec::new()
        };

        // Field granularity enabled and no leaf actually differs: the
        // structures are equal modulo key order, not a conflict.
        if self.config.field_granularity
            && kind == ConflictKind::UpdateUpdate
            && field_conflicts.is_empty()
        {
            return None;
        }

        Some(SyncConflict {
            entity_type: local.entity_type,
            entity_id: local.id,
            local: local.clone(),
            remote: remote.clone(),
            base: None,
            kind,
            field_conflicts,
            local_version: local.sync_version,
            remote_version: remote.sync_version,
            detected_at: Utc::now(),
        })
    }
}

/// Flatten a payload into dotted leaf paths. Objects are recursed into;
/// arrays and scalars are leaves.
fn flatten_leaves(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_leaves(&path, child, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

/// Deep structural comparison of two payloads, emitting an entry per leaf
/// that actually differs.
pub(crate) fn diff_leaf_fields(local: &Value, remote: &Value) -> Vec<FieldConflict> {
    let mut local_leaves = BTreeMap::new();
    let mut remote_leaves = BTreeMap::new();
    flatten_leaves("", local, &mut local_leaves);
    flatten_leaves("", remote, &mut remote_leaves);

    let mut conflicts = Vec::new();
    for (path, local_value) in &local_leaves {
        match remote_leaves.get(path) {
            Some(remote_value) if remote_value != local_value => {
                conflicts.push(FieldConflict {
                    field: path.clone(),
                    local_value: Some(local_value.clone()),
                    remote_value: Some(remote_value.clone()),
                    reason: ConflictReason::BothEdited,
                });
            }
            Some(_) => {}
            None => {
                conflicts.push(FieldConflict {
                    field: path.clone(),
                    local_value: Some(local_value.clone()),
                    remote_value: None,
                    reason: ConflictReason::LocalOnly,
                });
            }
        }
    }
    for (path, remote_value) in &remote_leaves {
        if !local_leaves.contains_key(path) {
            conflicts.push(FieldConflict {
                field: path.clone(),
                local_value: None,
                remote_value: Some(remote_value.clone()),
                reason: ConflictReason::RemoteOnly,
            });
        }
    }
    conflicts
}
