//! In-memory collaborator implementations for testing and development.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use cardstack_common::{EntityId, EntityType, Error, Result, UserId};

use crate::auth::AuthProvider;
use crate::events::{EventSink, SyncEvent};
use crate::local::{LocalStore, LocalWrite, WriteBatch};
use crate::record::VersionedRecord;
use crate::remote::RemoteStore;

type Key = (EntityType, EntityId);

/// In-memory local store.
///
/// All data is held in a map and lost on drop. `transact` applies writes
/// under one lock acquisition, which is as atomic as memory gets.
pub struct MemoryLocalStore {
    records: RwLock<HashMap<Key, VersionedRecord>>,
}

impl MemoryLocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of records held, tombstones included.
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply_write(records: &mut HashMap<Key, VersionedRecord>, write: LocalWrite) {
        match write {
            LocalWrite::Put(record) => {
                records.insert((record.entity_type, record.id), record);
            }
            LocalWrite::SoftDelete {
                entity_type,
                id,
                deleted_at,
            } => {
                if let Some(existing) = records.get_mut(&(entity_type, id)) {
                    existing.apply_local_delete(deleted_at);
                }
            }
        }
    }
}

impl Default for MemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(
        &self,
        entity_type: EntityType,
        id: &EntityId,
    ) -> Result<Option<VersionedRecord>> {
        Ok(self.records.read().unwrap().get(&(entity_type, *id)).cloned())
    }

    async fn put(&self, record: VersionedRecord) -> Result<()> {
        self.records
            .write()
            .unwrap()
            .insert((record.entity_type, record.id), record);
        Ok(())
    }

    async fn delete(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        deleted_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut records = self.records.write().unwrap();
        if let Some(existing) = records.get_mut(&(entity_type, *id)) {
            existing.apply_local_delete(deleted_at);
        }
        Ok(())
    }

    async fn query_updated_since(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<VersionedRecord>> {
        let records = self.records.read().unwrap();
        Ok(records
            .values()
            .filter(|r| r.entity_type == entity_type)
            .filter(|r| since.map_or(true, |s| r.updated_at >= s))
            .cloned()
            .collect())
    }

    async fn transact(&self, batch: WriteBatch) -> Result<()> {
        let mut records = self.records.write().unwrap();
        for write in batch.into_writes() {
            Self::apply_write(&mut records, write);
        }
        Ok(())
    }
}

/// In-memory remote store with failure injection.
///
/// Upsert follows the last-writer version rule a real backend would apply:
/// an incoming record only replaces the stored one when its `sync_version`
/// is strictly greater, and the stored record is returned either way.
pub struct MemoryRemoteStore {
    records: RwLock<HashMap<Key, VersionedRecord>>,
    injected_failures: Mutex<VecDeque<Error>>,
    failing_entities: Mutex<HashMap<EntityId, u32>>,
    latency: Mutex<Option<std::time::Duration>>,
}

impl MemoryRemoteStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            injected_failures: Mutex::new(VecDeque::new()),
            failing_entities: Mutex::new(HashMap::new()),
            latency: Mutex::new(None),
        }
    }

    /// Seed a record directly, bypassing upsert version checks.
    pub fn seed(&self, record: VersionedRecord) {
        self.records
            .write()
            .unwrap()
            .insert((record.entity_type, record.id), record);
    }

    /// Read a record back for assertions.
    pub fn record(&self, entity_type: EntityType, id: &EntityId) -> Option<VersionedRecord> {
        self.records.read().unwrap().get(&(entity_type, *id)).cloned()
    }

    /// Queue an error to be returned by the next mutating call.
    pub fn inject_failure(&self, error: Error) {
        self.injected_failures.lock().unwrap().push_back(error);
    }

    /// Make the next `times` calls touching `id` fail with a network error.
    pub fn fail_entity(&self, id: EntityId, times: u32) {
        self.failing_entities.lock().unwrap().insert(id, times);
    }

    /// Delay every call by `latency`, simulating a slow link.
    pub fn set_latency(&self, latency: std::time::Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    async fn apply_latency(&self) {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_injected(&self) -> Option<Error> {
        self.injected_failures.lock().unwrap().pop_front()
    }

    fn check_entity_failure(&self, id: &EntityId) -> Result<()> {
        let mut failing = self.failing_entities.lock().unwrap();
        if let Some(remaining) = failing.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                if *remaining == 0 {
                    failing.remove(id);
                }
                return Err(Error::Network(format!("injected failure for {id}")));
            }
        }
        Ok(())
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn fetch_since(
        &self,
        entity_type: EntityType,
        owner: &UserId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<VersionedRecord>> {
        self.apply_latency().await;
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let records = self.records.read().unwrap();
        Ok(records
            .values()
            .filter(|r| r.entity_type == entity_type && &r.owner_id == owner)
            .filter(|r| since.map_or(true, |s| r.updated_at >= s))
            .cloned()
            .collect())
    }

    async fn upsert(
        &self,
        entity_type: EntityType,
        record: VersionedRecord,
    ) -> Result<VersionedRecord> {
        self.apply_latency().await;
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        self.check_entity_failure(&record.id)?;

        let mut records = self.records.write().unwrap();
        let key = (entity_type, record.id);
        match records.get(&key) {
            Some(existing) if existing.sync_version >= record.sync_version => {
                Ok(existing.clone())
            }
            _ => {
                let mut accepted = record;
                accepted.pending_sync = false;
                records.insert(key, accepted.clone());
                Ok(accepted)
            }
        }
    }

    async fn soft_delete(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        deleted_at: DateTime<Utc>,
    ) -> Result<()> {
        self.apply_latency().await;
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        self.check_entity_failure(id)?;

        let mut records = self.records.write().unwrap();
        if let Some(existing) = records.get_mut(&(entity_type, *id)) {
            existing.apply_local_delete(deleted_at);
            existing.pending_sync = false;
        }
        Ok(())
    }

    async fn fetch_by_ids(
        &self,
        entity_type: EntityType,
        ids: &[EntityId],
    ) -> Result<Vec<VersionedRecord>> {
        self.apply_latency().await;
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let records = self.records.read().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| records.get(&(entity_type, *id)).cloned())
            .collect())
    }
}

/// Auth provider returning a fixed user.
pub struct StaticAuth {
    user: Option<UserId>,
}

impl StaticAuth {
    /// A provider with a signed-in user.
    pub fn signed_in(user: UserId) -> Self {
        Self { user: Some(user) }
    }

    /// A provider with no session.
    pub fn signed_out() -> Self {
        Self { user: None }
    }
}

impl AuthProvider for StaticAuth {
    fn current_user_id(&self) -> Option<UserId> {
        self.user.clone()
    }
}

/// Event sink that records every published event.
pub struct MemoryEventSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl MemoryEventSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// All events published so far, in order.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Count events matching a predicate.
    pub fn count_matching(&self, pred: impl Fn(&SyncEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl Default for MemoryEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for MemoryEventSink {
    fn publish(&self, event: SyncEvent) {
        self.events.lock().unwrap().push(event);
    }
}
