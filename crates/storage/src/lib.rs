//! In-memory storage collaborators for SOP.
//!
//! This crate provides the reference implementations of the storage
//! traits the transaction engine consumes:
//! - `MemoryBlobStore`: content-addressed blobs by table and ID
//! - `MemoryRegistry`: the handle table with atomic batch publish
//! - `MemoryStoreRepository`: store metadata with count reconciliation
//! - `MemoryCache`: the shared (L2) cache stand-in, including the
//!   distributed lock protocol and a restartable `run_id` info probe
//! - `L1Cache`: the process-wide MRU of serialized nodes
//!
//! Embedded deployments and tests run entirely on these; production
//! deployments substitute networked implementations of the same traits.

#![warn(clippy::all)]

pub mod blob;
pub mod l1;
pub mod memcache;
pub mod registry;
pub mod store_repository;

pub use blob::MemoryBlobStore;
pub use l1::{global_l1_cache, L1Cache, DEFAULT_L1_CAPACITY};
pub use memcache::MemoryCache;
pub use registry::MemoryRegistry;
pub use store_repository::MemoryStoreRepository;
