//! Core types for SOP (Scalable Objects Persistence)
//!
//! This crate defines the shared vocabulary of the storage engine:
//! - `Uid`: 128-bit unique identifier with a nil sentinel
//! - `Handle`: the virtual ID mapping a logical ID to an active and an
//!   inactive physical blob ID
//! - `StoreInfo` / `StoreOptions` / `CacheConfig`: B-Tree store metadata
//! - `Item`: the key/value unit managed inside B-Tree nodes
//! - `CommitStep`: the write-ahead-log step enumeration
//! - Collaborator traits consumed by the transaction engine: blob store,
//!   registry, store repository, shared (L2) cache, transaction log
//!
//! All backing stores are abstract here; concrete in-memory
//! implementations live in `sop-storage` and `sop-durability`.

#![warn(clippy::all)]

pub mod cache;
pub mod commit_step;
pub mod error;
pub mod handle;
pub mod item;
pub mod store;
pub mod traits;
pub mod types;

pub use cache::{
    create_lock_keys, create_lock_keys_for_ids, format_item_key, format_lock_key, format_node_key,
    Cache, CacheExt, LockKey,
};
pub use commit_step::CommitStep;
pub use error::{Error, Result, SectorClaim};
pub use handle::Handle;
pub use item::Item;
pub use store::{CacheConfig, StoreInfo, StoreOptions, MIN_CACHE_DURATION};
pub use traits::{
    BlobStore, BlobsIds, BlobsPayload, CommitLogEntry, ExpiredTransaction, PriorityLog, Registry,
    RegistryPayload, StoreRepository, TransactionLog,
};
pub use types::{now_millis, Uid};
