//! In-memory handle registry.

use parking_lot::Mutex;
use sop_core::{
    create_lock_keys_for_ids, Cache, Error, Handle, Registry, RegistryPayload, Result, Uid,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How long a sector lock claimed by [`Registry::update`] lives.
const SECTOR_LOCK_DURATION: Duration = Duration::from_secs(30);

/// In-memory [`Registry`] implementation.
///
/// One mutex guards every table, so `update_no_locks` applied to a
/// batch is atomic: readers observe either none or all of the batch.
/// That is the engine's linearization point for commit publish.
pub struct MemoryRegistry {
    tables: Mutex<HashMap<String, HashMap<Uid, Handle>>>,
    cache: Option<Arc<dyn Cache>>,
    replicate_calls: AtomicUsize,
}

impl MemoryRegistry {
    /// Create a registry whose `update` does not claim sector locks.
    pub fn new() -> Self {
        MemoryRegistry {
            tables: Mutex::new(HashMap::new()),
            cache: None,
            replicate_calls: AtomicUsize::new(0),
        }
    }

    /// Create a registry that claims sector locks through the shared
    /// cache on `update` (the recovery-path variant).
    pub fn with_cache(cache: Arc<dyn Cache>) -> Self {
        MemoryRegistry {
            tables: Mutex::new(HashMap::new()),
            cache: Some(cache),
            replicate_calls: AtomicUsize::new(0),
        }
    }

    /// Fetch one handle. Test observability.
    pub fn get_handle(&self, registry_table: &str, logical_id: Uid) -> Option<Handle> {
        self.tables
            .lock()
            .get(registry_table)
            .and_then(|t| t.get(&logical_id).copied())
    }

    /// Number of handles across all tables. Test observability.
    pub fn len(&self) -> usize {
        self.tables.lock().values().map(|t| t.len()).sum()
    }

    /// Whether no handle is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many change sets were replicated. Test observability.
    pub fn replicate_calls(&self) -> usize {
        self.replicate_calls.load(Ordering::Relaxed)
    }

    fn apply(&self, handles: Vec<RegistryPayload<Handle>>) {
        let mut tables = self.tables.lock();
        for payload in handles {
            let table = tables.entry(payload.registry_table).or_default();
            for handle in payload.items {
                table.insert(handle.logical_id, handle);
            }
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry for MemoryRegistry {
    fn get(&self, keys: Vec<RegistryPayload<Uid>>) -> Result<Vec<RegistryPayload<Handle>>> {
        let tables = self.tables.lock();
        let mut out = Vec::with_capacity(keys.len());
        for payload in keys {
            let handles = match tables.get(&payload.registry_table) {
                Some(table) => payload
                    .items
                    .iter()
                    .filter_map(|id| table.get(id).copied())
                    .collect(),
                None => Vec::new(),
            };
            out.push(RegistryPayload::new(payload.registry_table, handles));
        }
        Ok(out)
    }

    fn add(&self, handles: Vec<RegistryPayload<Handle>>) -> Result<()> {
        self.apply(handles);
        Ok(())
    }

    fn update(&self, handles: Vec<RegistryPayload<Handle>>) -> Result<()> {
        let Some(cache) = &self.cache else {
            return self.update_no_locks(handles);
        };
        // Claim a sector lock per affected logical ID; a live claim by
        // someone else means a competing recovery is touching the same
        // sector.
        let ids: Vec<Uid> = handles
            .iter()
            .flat_map(|p| p.items.iter().map(|h| h.logical_id))
            .collect();
        let mut lock_keys = create_lock_keys_for_ids(Uid::new(), &ids);
        let (ok, owner) = cache.dual_lock(SECTOR_LOCK_DURATION, &mut lock_keys)?;
        if !ok {
            cache.unlock(&lock_keys)?;
            let key = lock_keys
                .first()
                .map(|k| k.key.clone())
                .unwrap_or_default();
            return Err(Error::sector_lock(key, owner));
        }
        let result = self.update_no_locks(handles);
        cache.unlock(&lock_keys)?;
        result
    }

    fn update_no_locks(&self, handles: Vec<RegistryPayload<Handle>>) -> Result<()> {
        self.apply(handles);
        Ok(())
    }

    fn remove(&self, keys: Vec<RegistryPayload<Uid>>) -> Result<()> {
        let mut tables = self.tables.lock();
        for payload in keys {
            if let Some(table) = tables.get_mut(&payload.registry_table) {
                for id in payload.items {
                    table.remove(&id);
                }
            }
        }
        Ok(())
    }

    fn replicate(
        &self,
        new_root_nodes: Vec<RegistryPayload<Handle>>,
        added_nodes: Vec<RegistryPayload<Handle>>,
        updated_nodes: Vec<RegistryPayload<Handle>>,
        removed_nodes: Vec<RegistryPayload<Handle>>,
    ) -> Result<()> {
        self.replicate_calls.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "sop::registry",
            roots = new_root_nodes.len(),
            added = added_nodes.len(),
            updated = updated_nodes.len(),
            removed = removed_nodes.len(),
            "replicated handle change set"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memcache::MemoryCache;

    #[test]
    fn test_add_get_round_trip() {
        let registry = MemoryRegistry::new();
        let h = Handle::new(Uid::new());
        registry
            .add(vec![RegistryPayload::new("t_r", vec![h])])
            .unwrap();

        let got = registry
            .get(vec![RegistryPayload::new("t_r", vec![h.logical_id])])
            .unwrap();
        assert_eq!(got[0].items, vec![h]);
    }

    #[test]
    fn test_get_skips_missing_ids() {
        let registry = MemoryRegistry::new();
        let h = Handle::new(Uid::new());
        registry
            .add(vec![RegistryPayload::new("t_r", vec![h])])
            .unwrap();

        let got = registry
            .get(vec![RegistryPayload::new(
                "t_r",
                vec![h.logical_id, Uid::new()],
            )])
            .unwrap();
        assert_eq!(got[0].items.len(), 1);
    }

    #[test]
    fn test_update_no_locks_batch_is_atomic_per_mutex() {
        let registry = MemoryRegistry::new();
        let mut h1 = Handle::new(Uid::new());
        let mut h2 = Handle::new(Uid::new());
        registry
            .add(vec![RegistryPayload::new("t_r", vec![h1, h2])])
            .unwrap();

        h1.version = 1;
        h2.version = 2;
        registry
            .update_no_locks(vec![RegistryPayload::new("t_r", vec![h1, h2])])
            .unwrap();
        assert_eq!(registry.get_handle("t_r", h1.logical_id).unwrap().version, 1);
        assert_eq!(registry.get_handle("t_r", h2.logical_id).unwrap().version, 2);
    }

    #[test]
    fn test_update_with_locks_fails_on_claimed_sector() {
        let cache = Arc::new(MemoryCache::new());
        let registry = MemoryRegistry::with_cache(cache.clone());
        let h = Handle::new(Uid::new());
        registry
            .add(vec![RegistryPayload::new("t_r", vec![h])])
            .unwrap();

        // Another party claims the sector.
        let mut claim = create_lock_keys_for_ids(Uid::new(), &[h.logical_id]);
        assert!(cache
            .dual_lock(Duration::from_secs(10), &mut claim)
            .unwrap()
            .0);

        let err = registry
            .update(vec![RegistryPayload::new("t_r", vec![h])])
            .unwrap_err();
        assert!(err.is_sector_failure());
    }

    #[test]
    fn test_remove_tolerates_missing() {
        let registry = MemoryRegistry::new();
        registry
            .remove(vec![RegistryPayload::new("t_r", vec![Uid::new()])])
            .unwrap();
        assert!(registry.is_empty());
    }
}
