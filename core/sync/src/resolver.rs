//! Conflict resolution strategies.
//!
//! Resolution is deterministic: given the same conflict and strategy the
//! resolver returns a bit-identical record. No wall-clock reads happen here;
//! every timestamp in the result comes from the conflicting records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

use cardstack_common::{EntityType, Error, Result};
use cardstack_store::VersionedRecord;

use crate::config::SyncConfig;
use crate::detector::{diff_leaf_fields, ConflictKind, FieldConflict, SyncConflict};

/// How a conflict is turned into a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// Keep the local record verbatim.
    LocalWins,
    /// Keep the remote record verbatim.
    RemoteWins,
    /// Per conflicting field, keep the side with the later `updated_at`;
    /// everything else is inherited from the remote baseline.
    MergeFields,
    /// Whole-record winner by later `updated_at`.
    TimestampBased,
    /// Deletes win over concurrent updates; concurrent creates are never
    /// overwritten.
    OperationBased,
    /// No automatic resolution; surface for the user.
    Manual,
}

impl ResolutionStrategy {
    /// Stable name used in events and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::LocalWins => "local-wins",
            ResolutionStrategy::RemoteWins => "remote-wins",
            ResolutionStrategy::MergeFields => "merge-fields",
            ResolutionStrategy::TimestampBased => "timestamp-based",
            ResolutionStrategy::OperationBased => "operation-based",
            ResolutionStrategy::Manual => "manual",
        }
    }
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The conflict was resolved into a record ready to write back and
    /// re-push.
    Resolved {
        /// The merged/selected record, stamped with
        /// `sync_version = max(local, remote) + 1` and `pending_sync`
        /// cleared.
        record: VersionedRecord,
        /// The strategy that produced it.
        strategy: ResolutionStrategy,
    },
    /// The conflict needs manual resolution; the sync pass continues.
    Manual(SyncConflict),
}

/// Applies a configurable strategy to detected conflicts.
///
/// Strategy precedence: entity-type override, then conflict-kind override,
/// then the global default. An override is "configured" by being present in
/// its map; comparing values against the default would silently misbehave
/// whenever an override happens to equal it.
pub struct ConflictResolver {
    default_strategy: ResolutionStrategy,
    entity_overrides: HashMap<EntityType, ResolutionStrategy>,
    kind_overrides: HashMap<ConflictKind, ResolutionStrategy>,
}

impl ConflictResolver {
    /// Create a resolver with a global default and no overrides.
    pub fn new(default_strategy: ResolutionStrategy) -> Self {
        Self {
            default_strategy,
            entity_overrides: HashMap::new(),
            kind_overrides: HashMap::new(),
        }
    }

    /// Build a resolver from engine configuration.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            default_strategy: config.default_strategy,
            entity_overrides: config.entity_strategies.clone(),
            kind_overrides: config.kind_strategies.clone(),
        }
    }

    /// Add an entity-type override.
    pub fn with_entity_override(
        mut self,
        entity_type: EntityType,
        strategy: ResolutionStrategy,
    ) -> Self {
        self.entity_overrides.insert(entity_type, strategy);
        self
    }

    /// Add a conflict-kind override.
    pub fn with_kind_override(
        mut self,
        kind: ConflictKind,
        strategy: ResolutionStrategy,
    ) -> Self {
        self.kind_overrides.insert(kind, strategy);
        self
    }

    /// The strategy that applies to a conflict of this type and kind.
    pub fn strategy_for(&self, entity_type: EntityType, kind: ConflictKind) -> ResolutionStrategy {
        if let Some(strategy) = self.entity_overrides.get(&entity_type) {
            return *strategy;
        }
        if let Some(strategy) = self.kind_overrides.get(&kind) {
            return *strategy;
        }
        self.default_strategy
    }

    /// Resolve a conflict with the strategy selected by precedence.
    ///
    /// A strategy failure downgrades the conflict to manual resolution
    /// instead of aborting the sync pass.
    pub fn resolve(&self, conflict: &SyncConflict) -> Resolution {
        let strategy = self.strategy_for(conflict.entity_type, conflict.kind);
        self.resolve_with(conflict, strategy)
    }

    /// Resolve a conflict with an explicit strategy.
    pub fn resolve_with(&self, conflict: &SyncConflict, strategy: ResolutionStrategy) -> Resolution {
        match self.try_resolve(conflict, strategy) {
            Ok(Some(record)) => Resolution::Resolved { record, strategy },
            Ok(None) => Resolution::Manual(conflict.clone()),
            Err(err) => {
                warn!(
                    entity_id = %conflict.entity_id,
                    strategy = strategy.as_str(),
                    error = %err,
                    "Resolution failed, downgrading to manual"
                );
                Resolution::Manual(conflict.clone())
            }
        }
    }

    fn try_resolve(
        &self,
        conflict: &SyncConflict,
        strategy: ResolutionStrategy,
    ) -> Result<Option<VersionedRecord>> {
        let resolved = match strategy {
            ResolutionStrategy::Manual => return Ok(None),
            ResolutionStrategy::LocalWins => conflict.local.clone(),
            ResolutionStrategy::RemoteWins => conflict.remote.clone(),
            ResolutionStrategy::TimestampBased => later_side(conflict).clone(),
            ResolutionStrategy::OperationBased => match conflict.kind {
                // Deletes win over concurrent updates.
                ConflictKind::DeleteUpdate => conflict.local.clone(),
                ConflictKind::UpdateDelete => conflict.remote.clone(),
                // Concurrent creates are never overwritten automatically.
                ConflictKind::CreateCreate => return Ok(None),
                ConflictKind::UpdateUpdate => later_side(conflict).clone(),
            },
            ResolutionStrategy::MergeFields => merge_fields(conflict)?,
        };

        Ok(Some(stamp(resolved, conflict)))
    }
}

/// The side with the later `updated_at`; ties go to remote so the result
/// does not depend on evaluation order.
fn later_side(conflict: &SyncConflict) -> &VersionedRecord {
    if conflict.local.updated_at > conflict.remote.updated_at {
        &conflict.local
    } else {
        &conflict.remote
    }
}

/// Stamp the version-resolution invariant onto a resolved record.
fn stamp(mut record: VersionedRecord, conflict: &SyncConflict) -> VersionedRecord {
    record.sync_version = conflict.local_version.max(conflict.remote_version) + 1;
    record.pending_sync = false;
    record
}

/// Field-wise merge: remote record is the baseline, each conflicting field
/// independently goes to whichever side has the later `updated_at`.
fn merge_fields(conflict: &SyncConflict) -> Result<VersionedRecord> {
    // Tombstones have no fields to merge; the later side takes the record.
    if conflict.local.is_deleted || conflict.remote.is_deleted {
        return Ok(later_side(conflict).clone());
    }

    let field_conflicts: Vec<FieldConflict> = if conflict.field_conflicts.is_empty() {
        diff_leaf_fields(&conflict.local.payload, &conflict.remote.payload)
    } else {
        conflict.field_conflicts.clone()
    };

    let mut merged = conflict.remote.clone();
    let local_is_later = conflict.local.updated_at > conflict.remote.updated_at;

    if local_is_later {
        for field in &field_conflicts {
            match &field.local_value {
                Some(value) => set_path(&mut merged.payload, &field.field, value.clone())?,
                None => remove_path(&mut merged.payload, &field.field),
            }
        }
    }

    merged.updated_at = conflict.local.updated_at.max(conflict.remote.updated_at);
    Ok(merged)
}

/// Set a dotted-path leaf inside a JSON object, creating intermediate
/// objects as needed.
fn set_path(root: &mut Value, path: &str, value: Value) -> Result<()> {
    if path.is_empty() {
        return Err(Error::ConflictResolution(
            "cannot merge a non-object payload".to_string(),
        ));
    }
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let map = current.as_object_mut().ok_or_else(|| {
            Error::ConflictResolution(format!("payload path '{path}' crosses a non-object"))
        })?;
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return Ok(());
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    unreachable!("split always yields at least one segment")
}

/// Remove a dotted-path leaf; absent parents are fine.
fn remove_path(root: &mut Value, path: &str) {
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if segments.peek().is_none() {
            map.remove(segment);
            return;
        }
        match map.get_mut(segment) {
            Some(child) => current = child,
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionConfig;
    use crate::detector::ConflictDetector;
    use cardstack_common::{EntityId, UserId};
    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;

    fn record(payload: Value, version: u64, updated_at: DateTime<Utc>) -> VersionedRecord {
        let mut rec = VersionedRecord::new(
            EntityId::generate(),
            UserId::new("u").unwrap(),
            EntityType::Card,
            payload,
            updated_at,
        );
        rec.sync_version = version;
        rec.pending_sync = true;
        rec
    }

    fn conflict_between(
        local_payload: Value,
        remote_payload: Value,
        local_at: DateTime<Utc>,
        remote_at: DateTime<Utc>,
    ) -> SyncConflict {
        let local = record(local_payload, 2, local_at);
        let mut remote = record(remote_payload, 3, remote_at);
        remote.id = local.id;
        remote.pending_sync = false;

        let detector = ConflictDetector::new(DetectionConfig::default());
        detector
            .check_pair(&local, &remote, None)
            .expect("fixture records must conflict")
    }

    #[test]
    fn timestamp_based_later_remote_wins() {
        // Local "Local"@T2, remote "Remote"@T3 > T2: remote title survives
        // and the version is max + 1.
        let t2 = Utc::now() - Duration::hours(2);
        let t3 = t2 + Duration::hours(1);
        let conflict =
            conflict_between(json!({"title": "Local"}), json!({"title": "Remote"}), t2, t3);

        let resolver = ConflictResolver::new(ResolutionStrategy::TimestampBased);
        match resolver.resolve(&conflict) {
            Resolution::Resolved { record, strategy } => {
                assert_eq!(strategy, ResolutionStrategy::TimestampBased);
                assert_eq!(record.payload, json!({"title": "Remote"}));
                assert_eq!(record.sync_version, 4);
                assert!(!record.pending_sync);
            }
            Resolution::Manual(_) => panic!("should auto-resolve"),
        }
    }

    #[test]
    fn local_and_remote_wins_return_sides_verbatim() {
        let now = Utc::now();
        let conflict = conflict_between(json!({"a": 1}), json!({"a": 2}), now, now);

        let local = ConflictResolver::new(ResolutionStrategy::LocalWins).resolve(&conflict);
        let remote = ConflictResolver::new(ResolutionStrategy::RemoteWins).resolve(&conflict);

        match (local, remote) {
            (
                Resolution::Resolved { record: l, .. },
                Resolution::Resolved { record: r, .. },
            ) => {
                assert_eq!(l.payload, json!({"a": 1}));
                assert_eq!(r.payload, json!({"a": 2}));
                assert_eq!(l.sync_version, 4);
                assert_eq!(r.sync_version, 4);
            }
            _ => panic!("both should auto-resolve"),
        }
    }

    #[test]
    fn merge_fields_keeps_later_side_per_field() {
        // Local is later: its conflicting fields win, but fields it never
        // touched are inherited from the remote baseline.
        let remote_at = Utc::now() - Duration::hours(1);
        let local_at = remote_at + Duration::minutes(30);
        let conflict = conflict_between(
            json!({"title": "Mine", "body": "shared", "color": "red"}),
            json!({"title": "Theirs", "body": "shared", "starred": true}),
            local_at,
            remote_at,
        );

        let resolver = ConflictResolver::new(ResolutionStrategy::MergeFields);
        match resolver.resolve(&conflict) {
            Resolution::Resolved { record, .. } => {
                assert_eq!(record.payload["title"], json!("Mine"));
                assert_eq!(record.payload["body"], json!("shared"));
                assert_eq!(record.payload["color"], json!("red"));
                // Remote-only field removed because the later local side
                // does not have it.
                assert!(record.payload.get("starred").is_none());
                assert_eq!(record.updated_at, local_at);
            }
            Resolution::Manual(_) => panic!("should auto-resolve"),
        }
    }

    #[test]
    fn merge_fields_remote_later_keeps_remote_values() {
        let local_at = Utc::now() - Duration::hours(1);
        let remote_at = local_at + Duration::minutes(5);
        let conflict = conflict_between(
            json!({"title": "Mine"}),
            json!({"title": "Theirs"}),
            local_at,
            remote_at,
        );

        match ConflictResolver::new(ResolutionStrategy::MergeFields).resolve(&conflict) {
            Resolution::Resolved { record, .. } => {
                assert_eq!(record.payload, json!({"title": "Theirs"}));
            }
            Resolution::Manual(_) => panic!("should auto-resolve"),
        }
    }

    #[test]
    fn operation_based_delete_wins() {
        let now = Utc::now();
        let local = {
            let mut r = record(json!({"a": 1}), 2, now);
            r.is_deleted = true;
            r
        };
        let mut remote = record(json!({"a": 2}), 2, now);
        remote.id = local.id;

        let detector = ConflictDetector::new(DetectionConfig::default());
        let conflict = detector.check_pair(&local, &remote, None).unwrap();
        assert_eq!(conflict.kind, ConflictKind::DeleteUpdate);

        match ConflictResolver::new(ResolutionStrategy::OperationBased).resolve(&conflict) {
            Resolution::Resolved { record, .. } => {
                assert!(record.is_deleted);
                assert_eq!(record.sync_version, 3);
            }
            Resolution::Manual(_) => panic!("delete should win"),
        }
    }

    #[test]
    fn operation_based_create_create_goes_manual() {
        let now = Utc::now();
        let local = record(json!({"a": 1}), 1, now);
        let mut remote = record(json!({"a": 2}), 1, now);
        remote.id = local.id;

        let detector = ConflictDetector::new(DetectionConfig::default());
        let conflict = detector.check_pair(&local, &remote, None).unwrap();
        assert_eq!(conflict.kind, ConflictKind::CreateCreate);

        let resolution =
            ConflictResolver::new(ResolutionStrategy::OperationBased).resolve(&conflict);
        assert!(matches!(resolution, Resolution::Manual(_)));
    }

    #[test]
    fn precedence_entity_over_kind_over_default() {
        let resolver = ConflictResolver::new(ResolutionStrategy::TimestampBased)
            .with_kind_override(ConflictKind::UpdateUpdate, ResolutionStrategy::RemoteWins)
            .with_entity_override(EntityType::Card, ResolutionStrategy::LocalWins);

        assert_eq!(
            resolver.strategy_for(EntityType::Card, ConflictKind::UpdateUpdate),
            ResolutionStrategy::LocalWins
        );
        assert_eq!(
            resolver.strategy_for(EntityType::Folder, ConflictKind::UpdateUpdate),
            ResolutionStrategy::RemoteWins
        );
        assert_eq!(
            resolver.strategy_for(EntityType::Folder, ConflictKind::UpdateDelete),
            ResolutionStrategy::TimestampBased
        );
    }

    #[test]
    fn override_equal_to_default_still_applies() {
        // Presence decides, not value inequality with the default.
        let resolver = ConflictResolver::new(ResolutionStrategy::RemoteWins)
            .with_entity_override(EntityType::Tag, ResolutionStrategy::RemoteWins)
            .with_kind_override(ConflictKind::UpdateUpdate, ResolutionStrategy::LocalWins);

        // The entity override shadows the kind override even though it
        // coincides with the default.
        assert_eq!(
            resolver.strategy_for(EntityType::Tag, ConflictKind::UpdateUpdate),
            ResolutionStrategy::RemoteWins
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let t = Utc::now();
        let conflict = conflict_between(
            json!({"title": "a", "n": 1}),
            json!({"title": "b", "n": 2}),
            t,
            t + Duration::seconds(1),
        );
        let resolver = ConflictResolver::new(ResolutionStrategy::MergeFields);

        let first = resolver.resolve(&conflict);
        let second = resolver.resolve(&conflict);
        match (first, second) {
            (
                Resolution::Resolved { record: a, .. },
                Resolution::Resolved { record: b, .. },
            ) => assert_eq!(a, b),
            _ => panic!("should auto-resolve"),
        }
    }

    #[test]
    fn failed_merge_downgrades_to_manual() {
        // Scalar payloads cannot be field-merged; the failure surfaces the
        // conflict instead of dropping it.
        let remote_at = Utc::now();
        let local_at = remote_at + Duration::seconds(1);
        let conflict = conflict_between(json!("local"), json!("remote"), local_at, remote_at);

        let resolution = ConflictResolver::new(ResolutionStrategy::MergeFields).resolve(&conflict);
        assert!(matches!(resolution, Resolution::Manual(_)));
    }

    #[test]
    fn manual_strategy_surfaces_conflict() {
        let now = Utc::now();
        let conflict = conflict_between(json!({"a": 1}), json!({"a": 2}), now, now);
        let resolution = ConflictResolver::new(ResolutionStrategy::Manual).resolve(&conflict);
        assert!(matches!(resolution, Resolution::Manual(_)));
    }
}
