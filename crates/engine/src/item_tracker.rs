//! Item action tracker: per-item intent recording and value-segment
//! management.
//!
//! Every Get/Add/Update/Remove the B-Tree performs on an item is
//! recorded here. The tracker owns the external value blobs when a
//! store keeps values in a separate segment: values ride in the tracked
//! record until phase one persists them in one batch (or immediately,
//! for actively-persisted stores, guarded by a pre-commit log record so
//! a crash leaves no dangling blob untracked).
//!
//! Item-level conflict detection runs over shared-cache lock records:
//! one record per tracked non-add item, compatible only when both
//! holders are plain readers.

use crate::logger::SharedLogger;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sop_core::{
    format_item_key, format_lock_key, BlobStore, BlobsIds, BlobsPayload, Cache, CacheExt, Error,
    Item, Result, StoreInfo, Uid,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What a transaction intends to do with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum ItemAction {
    Get,
    Add,
    Update,
    Remove,
}

/// The lock record placed in the shared cache under `"L"+itemID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LockRecord {
    pub lock_id: Uid,
    pub action: ItemAction,
}

impl LockRecord {
    /// Two holders can share an item only when both just read it.
    fn is_compatible_with(&self, action: ItemAction) -> bool {
        self.action == ItemAction::Get && action == ItemAction::Get
    }
}

/// One tracked item. The map key stays the item's original ID for the
/// life of the transaction; `item.id` may rotate to a fresh in-flight
/// ID when a separate-segment value is replaced.
#[derive(Debug, Clone)]
pub(crate) struct TrackedRecord<K, V> {
    pub lock_id: Uid,
    pub action: ItemAction,
    pub item: Item<K, V>,
    pub version_in_db: i32,
    pub is_lock_owner: bool,
    pub persisted: bool,
}

/// Per-B-Tree item action tracker.
pub(crate) struct ItemActionTracker<K, V> {
    items: HashMap<Uid, TrackedRecord<K, V>>,
    for_deletion: Vec<Uid>,
    blob_store: Arc<dyn BlobStore>,
    cache: Arc<dyn Cache>,
    logger: SharedLogger,
}

impl<K, V> ItemActionTracker<K, V>
where
    K: Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    pub fn new(blob_store: Arc<dyn BlobStore>, cache: Arc<dyn Cache>, logger: SharedLogger) -> Self {
        ItemActionTracker {
            items: HashMap::new(),
            for_deletion: Vec::new(),
            blob_store,
            cache,
            logger,
        }
    }

    /// Whether anything is tracked.
    pub fn has_items(&self) -> bool {
        !self.items.is_empty()
    }

    /// Record an add. Bumps the item's in-memory version.
    pub fn add(&mut self, store: &StoreInfo, item: &mut Item<K, V>) -> Result<()> {
        let version_in_db = item.version;
        item.version += 1;
        let map_key = item.id;
        self.items.insert(
            map_key,
            TrackedRecord {
                lock_id: Uid::new(),
                action: ItemAction::Add,
                item: item.clone(),
                version_in_db,
                is_lock_owner: false,
                persisted: false,
            },
        );
        if store.is_value_data_actively_persisted && !store.is_value_data_in_node_segment {
            self.persist_record(store, map_key)?;
        }
        Ok(())
    }

    /// Record an update, applying the action table. For separate-segment
    /// stores the first update of a committed item rotates `item.id` to
    /// a fresh in-flight blob ID and queues the committed blob for
    /// deletion at commit end.
    pub fn update(&mut self, store: &StoreInfo, item: &mut Item<K, V>) -> Result<()> {
        let separate = !store.is_value_data_in_node_segment;
        let eager = store.is_value_data_actively_persisted && separate;

        let Some(map_key) = self.record_key_for(item.id) else {
            // Untracked: a blind write over a committed item.
            let version_in_db = item.version;
            item.version += 1;
            let map_key = item.id;
            if separate {
                self.for_deletion.push(item.id);
                item.id = Uid::new();
            }
            self.items.insert(
                map_key,
                TrackedRecord {
                    lock_id: Uid::new(),
                    action: ItemAction::Update,
                    item: item.clone(),
                    version_in_db,
                    is_lock_owner: false,
                    persisted: false,
                },
            );
            if eager {
                self.persist_record(store, map_key)?;
            }
            return Ok(());
        };

        let (action, version_in_db, rec_item_id, rec_item_version, persisted) = {
            let r = self.items.get(&map_key).expect("record exists");
            (
                r.action,
                r.version_in_db,
                r.item.id,
                r.item.version,
                r.persisted,
            )
        };
        match action {
            // A removed item stays removed.
            ItemAction::Remove => Ok(()),
            ItemAction::Add => {
                // Still an add; new contents, no extra version bump.
                item.version = rec_item_version;
                item.id = rec_item_id;
                {
                    let r = self.items.get_mut(&map_key).expect("record exists");
                    r.item = item.clone();
                    r.persisted = false;
                }
                if eager {
                    self.persist_record(store, map_key)?;
                }
                Ok(())
            }
            ItemAction::Get | ItemAction::Update => {
                if action == ItemAction::Get && item.version == version_in_db {
                    item.version += 1;
                }
                if separate {
                    if action == ItemAction::Get {
                        // First write over a committed value: stage under
                        // a fresh in-flight ID, retire the old blob at
                        // commit end.
                        self.for_deletion.push(item.id);
                        item.id = Uid::new();
                    } else if persisted {
                        self.for_deletion.push(rec_item_id);
                        item.id = Uid::new();
                    } else {
                        item.id = rec_item_id;
                    }
                }
                {
                    let r = self.items.get_mut(&map_key).expect("record exists");
                    r.action = ItemAction::Update;
                    r.item = item.clone();
                    r.persisted = false;
                }
                if eager {
                    self.persist_record(store, map_key)?;
                }
                Ok(())
            }
        }
    }

    /// Record a removal. An item added by this transaction is dropped
    /// from tracking entirely.
    pub fn remove(&mut self, store: &StoreInfo, item: &Item<K, V>) -> Result<()> {
        let separate = !store.is_value_data_in_node_segment;
        match self.record_key_for(item.id) {
            Some(map_key) => {
                let (is_add, persisted, rec_item_id) = {
                    let r = self.items.get(&map_key).expect("record exists");
                    (r.action == ItemAction::Add, r.persisted, r.item.id)
                };
                if is_add {
                    if persisted && separate {
                        self.for_deletion.push(rec_item_id);
                    }
                    self.items.remove(&map_key);
                } else {
                    let r = self.items.get_mut(&map_key).expect("record exists");
                    r.action = ItemAction::Remove;
                }
            }
            None => {
                self.items.insert(
                    item.id,
                    TrackedRecord {
                        lock_id: Uid::new(),
                        action: ItemAction::Remove,
                        item: item.clone(),
                        version_in_db: item.version,
                        is_lock_owner: false,
                        persisted: false,
                    },
                );
            }
        }
        Ok(())
    }

    /// Record a read and materialize the value when it lives in the
    /// value segment. An already-tracked item keeps its record; only the
    /// caller's copy is hydrated.
    pub fn get(&mut self, store: &StoreInfo, item: &mut Item<K, V>) -> Result<()> {
        if item.value.is_none() || item.value_needs_fetch {
            self.hydrate(store, item)?;
        }
        if self.record_key_for(item.id).is_none() {
            self.items.insert(
                item.id,
                TrackedRecord {
                    lock_id: Uid::new(),
                    action: ItemAction::Get,
                    item: item.clone(),
                    version_in_db: item.version,
                    is_lock_owner: false,
                    persisted: false,
                },
            );
        }
        Ok(())
    }

    fn hydrate(&mut self, store: &StoreInfo, item: &mut Item<K, V>) -> Result<()> {
        // In-flight values live in the tracked records.
        let tracked_value = self
            .record_key_for(item.id)
            .and_then(|k| self.items.get(&k))
            .and_then(|r| r.item.value.clone());
        if let Some(value) = tracked_value {
            item.value = Some(value);
            item.value_needs_fetch = false;
            return Ok(());
        }
        if store.is_value_data_in_node_segment {
            return Ok(());
        }
        let cfg = &store.cache_config;
        let value_key = format_item_key(item.id);
        if store.is_value_data_globally_cached {
            let cached: Option<V> = if cfg.is_value_data_cache_ttl {
                self.cache
                    .get_struct_ex(&value_key, cfg.value_data_cache_duration)?
            } else {
                self.cache.get_struct(&value_key)?
            };
            if let Some(value) = cached {
                item.value = Some(value);
                item.value_needs_fetch = false;
                return Ok(());
            }
        }
        let Some(bytes) = self.blob_store.get_one(&store.blob_table, item.id)? else {
            return Err(Error::NotFound(format!(
                "value blob {} missing from {}",
                item.id, store.blob_table
            )));
        };
        let value: V = bincode::deserialize(&bytes)?;
        if store.is_value_data_globally_cached {
            self.cache.set(
                &value_key,
                &bytes,
                Some(cfg.value_data_cache_duration).filter(|d| !d.is_zero()),
            )?;
        }
        item.value = Some(value);
        item.value_needs_fetch = false;
        Ok(())
    }

    /// Place a lock record for every tracked non-add item. A
    /// pre-existing holder is tolerated only when both sides are plain
    /// readers.
    pub fn lock(&mut self, duration: Duration) -> Result<()> {
        for (id, record) in self.items.iter_mut() {
            if record.action == ItemAction::Add {
                continue;
            }
            let key = format_lock_key(&id.to_string());
            if let Some(existing) = self.cache.get_struct::<LockRecord>(&key)? {
                if existing.lock_id == record.lock_id {
                    record.is_lock_owner = true;
                    continue;
                }
                if existing.is_compatible_with(record.action) {
                    continue;
                }
                return Err(Error::conflict(format!(
                    "item {} is locked by another transaction",
                    id
                )));
            }
            let claim = LockRecord {
                lock_id: record.lock_id,
                action: record.action,
            };
            self.cache
                .set_if_not_exist(&key, &bincode::serialize(&claim)?, Some(duration))?;
            // Re-read: the set-if-absent may have lost to a racer, or
            // the entry may have expired under us.
            match self.cache.get_struct::<LockRecord>(&key)? {
                Some(readback) if readback.lock_id == record.lock_id => {
                    record.is_lock_owner = true;
                }
                Some(readback) if readback.is_compatible_with(record.action) => {}
                _ => {
                    return Err(Error::conflict(format!("item {} lost the lock race", id)));
                }
            }
        }
        Ok(())
    }

    /// Re-verify every lock record immediately before phase two,
    /// catching cache eviction between lock and finalize.
    pub fn check_tracked_items(&self) -> Result<()> {
        for (id, record) in &self.items {
            if record.action == ItemAction::Add {
                continue;
            }
            let key = format_lock_key(&id.to_string());
            match self.cache.get_struct::<LockRecord>(&key)? {
                Some(existing)
                    if existing.lock_id == record.lock_id
                        || existing.is_compatible_with(record.action) => {}
                Some(_) => {
                    return Err(Error::conflict(format!(
                        "item {} lock is held by another transaction",
                        id
                    )));
                }
                None => {
                    return Err(Error::conflict(format!(
                        "item {} lock disappeared before finalize",
                        id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Release the lock records this transaction owns.
    pub fn unlock(&mut self) -> Result<()> {
        let mut keys = Vec::new();
        for (id, record) in self.items.iter_mut() {
            if record.is_lock_owner {
                keys.push(format_lock_key(&id.to_string()));
                record.is_lock_owner = false;
            }
        }
        if !keys.is_empty() {
            self.cache.delete(&keys)?;
        }
        Ok(())
    }

    /// Persist the pending value blobs in one batch and externalize the
    /// tracked copies. No-op for in-node-segment and actively-persisted
    /// stores.
    pub fn commit_values(&mut self, store: &StoreInfo) -> Result<()> {
        if store.is_value_data_in_node_segment || store.is_value_data_actively_persisted {
            return Ok(());
        }
        let mut blobs = Vec::new();
        let cfg = store.cache_config;
        for record in self.items.values_mut() {
            if !matches!(record.action, ItemAction::Add | ItemAction::Update) || record.persisted {
                continue;
            }
            let Some(value) = &record.item.value else {
                continue;
            };
            let bytes = bincode::serialize(value)?;
            if store.is_value_data_globally_cached {
                self.cache.set(
                    &format_item_key(record.item.id),
                    &bytes,
                    Some(cfg.value_data_cache_duration).filter(|d| !d.is_zero()),
                )?;
            }
            blobs.push((record.item.id, bytes));
            record.persisted = true;
            record.item.value = None;
            record.item.value_needs_fetch = true;
        }
        if blobs.is_empty() {
            return Ok(());
        }
        self.blob_store.add(vec![BlobsPayload {
            blob_table: store.blob_table.clone(),
            blobs,
        }])?;
        Ok(())
    }

    /// Blob IDs written (or about to be written) by this transaction,
    /// for the rollback log entry.
    pub fn rollback_values_payload(&self, store: &StoreInfo) -> Vec<BlobsIds> {
        if store.is_value_data_in_node_segment {
            return Vec::new();
        }
        let ids: Vec<Uid> = self
            .items
            .values()
            .filter(|r| matches!(r.action, ItemAction::Add | ItemAction::Update))
            .map(|r| r.item.id)
            .collect();
        if ids.is_empty() {
            return Vec::new();
        }
        vec![BlobsIds {
            blob_table: store.blob_table.clone(),
            ids,
        }]
    }

    /// Blob IDs that become obsolete once the commit finalizes: retired
    /// in-flight predecessors plus removed items' values.
    pub fn obsolete_values_payload(&self, store: &StoreInfo) -> Vec<BlobsIds> {
        if store.is_value_data_in_node_segment {
            return Vec::new();
        }
        let mut ids = self.for_deletion.clone();
        ids.extend(
            self.items
                .iter()
                .filter(|(_, r)| r.action == ItemAction::Remove)
                .map(|(id, _)| *id),
        );
        if ids.is_empty() {
            return Vec::new();
        }
        vec![BlobsIds {
            blob_table: store.blob_table.clone(),
            ids,
        }]
    }

    /// Queue a committed value blob for deletion at commit end.
    pub fn queue_for_deletion(&mut self, id: Uid) {
        self.for_deletion.push(id);
    }

    /// Drain all tracked state (refetch-and-merge snapshot).
    pub fn take_state(&mut self) -> HashMap<Uid, TrackedRecord<K, V>> {
        self.for_deletion.clear();
        std::mem::take(&mut self.items)
    }

    /// Re-insert a record under an explicit key (refetch-and-merge).
    pub fn insert_record(&mut self, key: Uid, record: TrackedRecord<K, V>) {
        self.items.insert(key, record);
    }

    /// Remove a record by key (refetch-and-merge).
    pub fn remove_record(&mut self, key: Uid) -> Option<TrackedRecord<K, V>> {
        self.items.remove(&key)
    }

    /// Drop all tracked state (commit/rollback end).
    pub fn clear(&mut self) {
        self.items.clear();
        self.for_deletion.clear();
    }

    fn record_key_for(&self, item_id: Uid) -> Option<Uid> {
        if self.items.contains_key(&item_id) {
            return Some(item_id);
        }
        self.items
            .iter()
            .find(|(_, r)| r.item.id == item_id)
            .map(|(k, _)| *k)
    }

    /// Eagerly persist one record's value blob, writing the pre-commit
    /// log entry first so a crash can reclaim the blob.
    fn persist_record(&mut self, store: &StoreInfo, map_key: Uid) -> Result<()> {
        let (blob_id, bytes) = {
            let Some(record) = self.items.get(&map_key) else {
                return Ok(());
            };
            let Some(value) = &record.item.value else {
                return Ok(());
            };
            (record.item.id, bincode::serialize(value)?)
        };
        let payload = vec![BlobsIds {
            blob_table: store.blob_table.clone(),
            ids: vec![blob_id],
        }];
        self.logger
            .lock()
            .log_pre_commit(bincode::serialize(&payload)?)?;
        if store.is_value_data_globally_cached {
            self.cache.set(
                &format_item_key(blob_id),
                &bytes,
                Some(store.cache_config.value_data_cache_duration).filter(|d| !d.is_zero()),
            )?;
        }
        self.blob_store.add(vec![BlobsPayload {
            blob_table: store.blob_table.clone(),
            blobs: vec![(blob_id, bytes)],
        }])?;
        if let Some(record) = self.items.get_mut(&map_key) {
            record.persisted = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::TransactionLogger;
    use parking_lot::Mutex;
    use sop_core::StoreOptions;
    use sop_durability::MemoryTransactionLog;
    use sop_storage::{MemoryBlobStore, MemoryCache};

    struct Fixture {
        blob_store: Arc<MemoryBlobStore>,
        cache: Arc<MemoryCache>,
        log: Arc<MemoryTransactionLog>,
        store: StoreInfo,
    }

    impl Fixture {
        fn new(in_node: bool) -> Self {
            Fixture {
                blob_store: Arc::new(MemoryBlobStore::new()),
                cache: Arc::new(MemoryCache::new()),
                log: Arc::new(MemoryTransactionLog::new()),
                store: StoreInfo::new(StoreOptions::new("tracker_test", 4, false, in_node))
                    .unwrap(),
            }
        }

        fn tracker(&self) -> ItemActionTracker<i32, String> {
            let logger = Arc::new(Mutex::new(TransactionLogger::new(self.log.clone(), true)));
            ItemActionTracker::new(self.blob_store.clone(), self.cache.clone(), logger)
        }
    }

    fn action_of(tracker: &ItemActionTracker<i32, String>, id: Uid) -> Option<ItemAction> {
        tracker.items.get(&id).map(|r| r.action)
    }

    fn track_update(
        fx: &Fixture,
        tracker: &mut ItemActionTracker<i32, String>,
        item: &mut Item<i32, String>,
    ) {
        tracker.get(&fx.store, item).unwrap();
        tracker.update(&fx.store, item).unwrap();
    }

    #[test]
    fn test_add_bumps_version() {
        let fx = Fixture::new(true);
        let mut tracker = fx.tracker();
        let mut item = Item::new(1, "v".to_string());
        tracker.add(&fx.store, &mut item).unwrap();
        assert_eq!(item.version, 1);
        assert_eq!(action_of(&tracker, item.id), Some(ItemAction::Add));
    }

    #[test]
    fn test_add_then_remove_drops_tracking() {
        let fx = Fixture::new(true);
        let mut tracker = fx.tracker();
        let mut item = Item::new(1, "v".to_string());
        tracker.add(&fx.store, &mut item).unwrap();
        tracker.remove(&fx.store, &item).unwrap();
        assert!(!tracker.has_items());
    }

    #[test]
    fn test_add_then_update_stays_add() {
        let fx = Fixture::new(true);
        let mut tracker = fx.tracker();
        let mut item = Item::new(1, "v".to_string());
        tracker.add(&fx.store, &mut item).unwrap();

        item.value = Some("v2".to_string());
        tracker.update(&fx.store, &mut item).unwrap();
        assert_eq!(action_of(&tracker, item.id), Some(ItemAction::Add));
        // No extra version bump past the add's.
        assert_eq!(item.version, 1);
    }

    #[test]
    fn test_get_then_update_bumps_once() {
        let fx = Fixture::new(true);
        let mut tracker = fx.tracker();
        let mut item = Item::new(1, "v".to_string());
        item.version = 3;
        tracker.get(&fx.store, &mut item).unwrap();
        assert_eq!(action_of(&tracker, item.id), Some(ItemAction::Get));

        tracker.update(&fx.store, &mut item).unwrap();
        assert_eq!(item.version, 4);
        assert_eq!(action_of(&tracker, item.id), Some(ItemAction::Update));

        // Second update: no further bump.
        tracker.update(&fx.store, &mut item).unwrap();
        assert_eq!(item.version, 4);
    }

    #[test]
    fn test_remove_stays_remove() {
        let fx = Fixture::new(true);
        let mut tracker = fx.tracker();
        let mut item = Item::new(1, "v".to_string());
        item.version = 1;
        tracker.get(&fx.store, &mut item).unwrap();
        tracker.remove(&fx.store, &item).unwrap();
        tracker.update(&fx.store, &mut item).unwrap();
        assert_eq!(action_of(&tracker, item.id), Some(ItemAction::Remove));
    }

    #[test]
    fn test_separate_segment_update_rotates_id() {
        let fx = Fixture::new(false);
        let mut tracker = fx.tracker();
        let mut item = Item::new(1, "v".to_string());
        item.version = 2;
        let committed_id = item.id;
        tracker.get(&fx.store, &mut item).unwrap();

        item.value = Some("v2".to_string());
        tracker.update(&fx.store, &mut item).unwrap();
        assert_ne!(item.id, committed_id);
        // Record stays keyed under the committed ID.
        assert_eq!(action_of(&tracker, committed_id), Some(ItemAction::Update));
        // The committed blob is queued for retirement.
        let obsolete = tracker.obsolete_values_payload(&fx.store);
        assert_eq!(obsolete[0].ids, vec![committed_id]);
    }

    #[test]
    fn test_commit_values_persists_and_externalizes() {
        let fx = Fixture::new(false);
        let mut tracker = fx.tracker();
        let mut item = Item::new(1, "payload".to_string());
        tracker.add(&fx.store, &mut item).unwrap();

        tracker.commit_values(&fx.store).unwrap();
        assert!(fx.blob_store.contains(&fx.store.blob_table, item.id));
        let record = tracker.items.get(&item.id).unwrap();
        assert!(record.persisted);
        assert!(record.item.value.is_none());
        assert!(record.item.value_needs_fetch);
    }

    #[test]
    fn test_hydrate_from_blob_store() {
        let fx = Fixture::new(false);
        let mut tracker = fx.tracker();
        let mut item = Item::new(1, "payload".to_string());
        tracker.add(&fx.store, &mut item).unwrap();
        tracker.commit_values(&fx.store).unwrap();
        tracker.clear();

        let mut read: Item<i32, String> = Item {
            id: item.id,
            key: 1,
            value: None,
            version: 1,
            value_needs_fetch: true,
        };
        tracker.get(&fx.store, &mut read).unwrap();
        assert_eq!(read.value.as_deref(), Some("payload"));
        assert!(!read.value_needs_fetch);
    }

    #[test]
    fn test_actively_persisted_add_writes_pre_commit_log() {
        let fx = Fixture::new(false);
        let mut store = fx.store.clone();
        store.is_value_data_actively_persisted = true;

        let mut tracker = fx.tracker();
        let mut item = Item::new(1, "eager".to_string());
        tracker.add(&store, &mut item).unwrap();

        // Blob written immediately, guarded by a pre-commit log record.
        assert!(fx.blob_store.contains(&store.blob_table, item.id));
        assert_eq!(fx.log.len(), 1);
        assert!(tracker.items.get(&item.id).unwrap().persisted);
    }

    #[test]
    fn test_lock_conflicts_on_incompatible_holder() {
        let fx = Fixture::new(true);
        let mut t1 = fx.tracker();
        let mut t2 = fx.tracker();

        let mut item = Item::new(1, "v".to_string());
        item.version = 1;
        track_update(&fx, &mut t1, &mut item.clone());
        track_update(&fx, &mut t2, &mut item);

        t1.lock(Duration::from_secs(10)).unwrap();
        let err = t2.lock(Duration::from_secs(10)).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_lock_allows_two_readers() {
        let fx = Fixture::new(true);
        let mut t1 = fx.tracker();
        let mut t2 = fx.tracker();

        let mut item = Item::new(1, "v".to_string());
        item.version = 1;
        t1.get(&fx.store, &mut item.clone()).unwrap();
        t2.get(&fx.store, &mut item).unwrap();

        t1.lock(Duration::from_secs(10)).unwrap();
        t2.lock(Duration::from_secs(10)).unwrap();
        // First locker owns; second shares without ownership.
        assert!(t1.items.values().any(|r| r.is_lock_owner));
        assert!(t2.items.values().all(|r| !r.is_lock_owner));
    }

    #[test]
    fn test_unlock_releases_only_owned() {
        let fx = Fixture::new(true);
        let mut tracker = fx.tracker();
        let mut item = Item::new(1, "v".to_string());
        item.version = 1;
        track_update(&fx, &mut tracker, &mut item);

        tracker.lock(Duration::from_secs(10)).unwrap();
        tracker.check_tracked_items().unwrap();
        tracker.unlock().unwrap();
        assert!(fx.cache.is_empty());
        assert!(tracker.check_tracked_items().is_err());
    }
}
