//! In-memory store metadata repository.

use parking_lot::Mutex;
use sop_core::{now_millis, Error, Result, StoreInfo, StoreRepository};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// In-memory [`StoreRepository`] implementation.
///
/// `update` reconciles concurrent committers: each transaction reports
/// the count change it observed (`count_delta`), and the repository
/// folds deltas into the persisted count instead of trusting any one
/// transaction's absolute view.
pub struct MemoryStoreRepository {
    stores: Mutex<HashMap<String, StoreInfo>>,
    replicate_calls: AtomicUsize,
}

impl MemoryStoreRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        MemoryStoreRepository {
            stores: Mutex::new(HashMap::new()),
            replicate_calls: AtomicUsize::new(0),
        }
    }

    /// How many store sets were replicated. Test observability.
    pub fn replicate_calls(&self) -> usize {
        self.replicate_calls.load(Ordering::Relaxed)
    }
}

impl Default for MemoryStoreRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreRepository for MemoryStoreRepository {
    fn get(&self, names: &[String]) -> Result<Vec<StoreInfo>> {
        let stores = self.stores.lock();
        Ok(names.iter().filter_map(|n| stores.get(n).cloned()).collect())
    }

    fn get_with_ttl(
        &self,
        _is_ttl: bool,
        _ttl: Duration,
        names: &[String],
    ) -> Result<Vec<StoreInfo>> {
        // No remote round-trip to amortize in memory; the TTL policy is
        // meaningful for networked repositories only.
        self.get(names)
    }

    fn get_all(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.stores.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn add(&self, stores: Vec<StoreInfo>) -> Result<()> {
        let mut map = self.stores.lock();
        for store in &stores {
            if map.contains_key(&store.name) {
                return Err(Error::Config(format!(
                    "store {} already exists",
                    store.name
                )));
            }
        }
        for store in stores {
            map.insert(store.name.clone(), store);
        }
        Ok(())
    }

    fn update(&self, stores: Vec<StoreInfo>) -> Result<Vec<StoreInfo>> {
        let mut map = self.stores.lock();
        let mut reconciled = Vec::with_capacity(stores.len());
        for mut incoming in stores {
            match map.get_mut(&incoming.name) {
                Some(existing) => {
                    existing.count += incoming.count_delta;
                    existing.root_node_id = incoming.root_node_id;
                    existing.timestamp = now_millis();
                    let mut out = existing.clone();
                    out.count_delta = 0;
                    reconciled.push(out);
                }
                None => {
                    incoming.count_delta = 0;
                    incoming.timestamp = now_millis();
                    map.insert(incoming.name.clone(), incoming.clone());
                    reconciled.push(incoming);
                }
            }
        }
        Ok(reconciled)
    }

    fn remove(&self, names: &[String]) -> Result<()> {
        let mut map = self.stores.lock();
        for name in names {
            map.remove(name);
        }
        Ok(())
    }

    fn replicate(&self, stores: Vec<StoreInfo>) -> Result<()> {
        self.replicate_calls.fetch_add(1, Ordering::Relaxed);
        debug!(target: "sop::store_repo", stores = stores.len(), "replicated store records");
        Ok(())
    }
}
