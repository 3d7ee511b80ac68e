//! Shared fixtures for the engine integration tests.

// Each test binary compiles its own copy; not all of them use every
// helper.
#![allow(dead_code)]

use sop_core::{Cache, StoreOptions};
use sop_durability::MemoryTransactionLog;
use sop_engine::{new_two_phase_commit_transaction, Transaction, TransactionMode};
use sop_storage::{MemoryBlobStore, MemoryCache, MemoryRegistry, MemoryStoreRepository};
use std::sync::Arc;
use std::time::Duration;

/// One set of shared storage backends, as several concurrent
/// transactions would see them.
#[derive(Clone)]
pub struct Env {
    pub blob_store: Arc<MemoryBlobStore>,
    pub store_repository: Arc<MemoryStoreRepository>,
    pub registry: Arc<MemoryRegistry>,
    pub cache: Arc<MemoryCache>,
    pub log: Arc<MemoryTransactionLog>,
}

impl Env {
    pub fn new() -> Self {
        Env::with_log(Arc::new(MemoryTransactionLog::new()))
    }

    pub fn with_log(log: Arc<MemoryTransactionLog>) -> Self {
        Env {
            blob_store: Arc::new(MemoryBlobStore::new()),
            store_repository: Arc::new(MemoryStoreRepository::new()),
            registry: Arc::new(MemoryRegistry::new()),
            cache: Arc::new(MemoryCache::new()),
            log,
        }
    }

    pub fn transaction(&self, mode: TransactionMode) -> Transaction {
        let txn = new_two_phase_commit_transaction(
            mode,
            Some(Duration::from_secs(5)),
            true,
            self.blob_store.clone(),
            self.store_repository.clone(),
            self.registry.clone(),
            self.cache.clone(),
            self.log.clone(),
        );
        txn.begin().expect("begin");
        txn
    }

    pub fn l2(&self) -> Arc<dyn Cache> {
        self.cache.clone()
    }
}

/// In-node-segment store options used by most tests.
pub fn small_store(name: &str) -> StoreOptions {
    StoreOptions::new(name, 4, false, true)
}
