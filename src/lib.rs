//! SOP (Scalable Objects Persistence): a transactional B-Tree storage
//! engine core.
//!
//! Multiple concurrent sessions perform ordered CRUD on persistent
//! B-Trees with ACID-like guarantees: serializable-per-key updates with
//! optimistic concurrency, durable commit via a write-ahead log, and
//! self-healing rollback of dead transactions.
//!
//! ## Quick start
//!
//! ```ignore
//! use sop::{
//!     new_btree, new_two_phase_commit_transaction, MemoryBlobStore, MemoryCache,
//!     MemoryRegistry, MemoryStoreRepository, MemoryTransactionLog, StoreOptions,
//!     TransactionMode,
//! };
//! use std::sync::Arc;
//!
//! let txn = new_two_phase_commit_transaction(
//!     TransactionMode::ForWriting,
//!     None,
//!     true,
//!     Arc::new(MemoryBlobStore::new()),
//!     Arc::new(MemoryStoreRepository::new()),
//!     Arc::new(MemoryRegistry::new()),
//!     Arc::new(MemoryCache::new()),
//!     Arc::new(MemoryTransactionLog::new()),
//! );
//! txn.begin()?;
//! let tree = new_btree::<String, String>(StoreOptions::new("people", 100, false, true), &txn)?;
//! tree.add("jane".to_string(), "doe".to_string())?;
//! txn.commit()?;
//! # Ok::<(), sop::Error>(())
//! ```
//!
//! The blob store, registry, store repository, shared cache and
//! transaction log are abstract traits; the in-memory implementations
//! re-exported here serve embedded use and tests, and networked
//! backends plug into the same seams.

#![warn(clippy::all)]

pub use sop_core::{
    create_lock_keys, create_lock_keys_for_ids, format_item_key, format_lock_key, format_node_key,
    now_millis, BlobStore, BlobsIds, BlobsPayload, Cache, CacheConfig, CacheExt, CommitLogEntry,
    CommitStep, Error, ExpiredTransaction, Handle, Item, LockKey, PriorityLog, Registry,
    RegistryPayload, Result, SectorClaim, StoreInfo, StoreOptions, StoreRepository,
    TransactionLog, Uid, MIN_CACHE_DURATION,
};
pub use sop_durability::{
    format_hour, MemoryPriorityLog, MemoryTransactionLog, DEFAULT_LOG_EXPIRY,
};
pub use sop_engine::{
    acquire_locks, default_scheduler, do_priority_rollbacks, handle_registry_sector_lock_timeout,
    new_btree, new_two_phase_commit_transaction, open_btree, priority_rollback,
    set_replication_error_handler, Btree, IdleScheduler, RecoveryServices, Transaction,
    TransactionMode, DEFAULT_MAX_TIME, MAX_MAX_TIME, PRIORITY_BATCH_SIZE,
};
pub use sop_storage::{
    global_l1_cache, L1Cache, MemoryBlobStore, MemoryCache, MemoryRegistry, MemoryStoreRepository,
    DEFAULT_L1_CAPACITY,
};
