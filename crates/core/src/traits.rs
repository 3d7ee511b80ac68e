//! Collaborator traits the transaction engine consumes.
//!
//! The engine is backend-agnostic: blob store, registry, store
//! repository and transaction log are abstract interfaces consumed as
//! `Arc<dyn …>` trait objects. In-memory reference implementations live
//! in `sop-storage` and `sop-durability`; production deployments plug
//! in networked ones.

use crate::commit_step::CommitStep;
use crate::handle::Handle;
use crate::store::StoreInfo;
use crate::types::Uid;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A batch of blobs destined for one blob table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobsPayload {
    /// Target blob table.
    pub blob_table: String,
    /// `(blob ID, bytes)` pairs.
    pub blobs: Vec<(Uid, Vec<u8>)>,
}

/// A batch of blob IDs within one blob table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlobsIds {
    /// Target blob table.
    pub blob_table: String,
    /// Affected blob IDs.
    pub ids: Vec<Uid>,
}

/// A batch of registry entries (IDs or handles) within one registry
/// table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryPayload<T> {
    /// Target registry table.
    pub registry_table: String,
    /// The entries.
    pub items: Vec<T>,
}

impl<T> RegistryPayload<T> {
    /// Create a payload for one registry table.
    pub fn new(registry_table: impl Into<String>, items: Vec<T>) -> Self {
        RegistryPayload {
            registry_table: registry_table.into(),
            items,
        }
    }
}

/// One logged commit step with its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitLogEntry {
    /// The protocol step.
    pub step: CommitStep,
    /// Step payload; encoding is step-specific.
    pub payload: Vec<u8>,
}

/// An unfinished transaction surfaced by the recovery sweep.
#[derive(Debug, Clone)]
pub struct ExpiredTransaction {
    /// Transaction ID.
    pub tid: Uid,
    /// The hour bucket (`YYYYMMDDHH`) the transaction started in.
    pub hour: String,
    /// The logged steps, in append order.
    pub entries: Vec<CommitLogEntry>,
}

/// Content-addressed blob storage.
///
/// Writes are idempotent overwrites for the same ID; deletes tolerate
/// missing keys.
pub trait BlobStore: Send + Sync {
    /// Fetch one blob. `None` when missing.
    ///
    /// # Errors
    ///
    /// Returns an error when the storage backend fails.
    fn get_one(&self, blob_table: &str, blob_id: Uid) -> Result<Option<Vec<u8>>>;

    /// Write a batch of blobs.
    ///
    /// # Errors
    ///
    /// Returns an error when the storage backend fails.
    fn add(&self, blobs: Vec<BlobsPayload>) -> Result<()>;

    /// Overwrite a batch of blobs.
    ///
    /// # Errors
    ///
    /// Returns an error when the storage backend fails.
    fn update(&self, blobs: Vec<BlobsPayload>) -> Result<()>;

    /// Delete a batch of blobs. Missing IDs are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error when the storage backend fails.
    fn remove(&self, blobs: Vec<BlobsIds>) -> Result<()>;
}

/// The handle table: logical ID to [`Handle`] per registry table.
///
/// `update_no_locks` applied to a batch is the engine's atomic
/// linearization point for publishing updated and removed handles.
pub trait Registry: Send + Sync {
    /// Bulk-fetch handles. Missing IDs are simply absent from the
    /// result payloads.
    ///
    /// # Errors
    ///
    /// Returns an error when the registry backend fails.
    fn get(&self, keys: Vec<RegistryPayload<Uid>>) -> Result<Vec<RegistryPayload<Handle>>>;

    /// Register new handles.
    ///
    /// # Errors
    ///
    /// Returns an error when the registry backend fails.
    fn add(&self, handles: Vec<RegistryPayload<Handle>>) -> Result<()>;

    /// Update handles, claiming per-sector locks first. Used by
    /// recovery paths that do not own the transaction's lock keys.
    ///
    /// # Errors
    ///
    /// Returns an error when a sector is claimed or the backend fails.
    fn update(&self, handles: Vec<RegistryPayload<Handle>>) -> Result<()>;

    /// Update handles without lock claims; the whole batch takes effect
    /// atomically.
    ///
    /// # Errors
    ///
    /// Returns an error when the registry backend fails.
    fn update_no_locks(&self, handles: Vec<RegistryPayload<Handle>>) -> Result<()>;

    /// Remove handles. Missing IDs are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error when the registry backend fails.
    fn remove(&self, keys: Vec<RegistryPayload<Uid>>) -> Result<()>;

    /// Best-effort replication of a committed change set to passive
    /// targets.
    ///
    /// # Errors
    ///
    /// Returns an error when replication fails; commit durability is
    /// unaffected.
    fn replicate(
        &self,
        new_root_nodes: Vec<RegistryPayload<Handle>>,
        added_nodes: Vec<RegistryPayload<Handle>>,
        updated_nodes: Vec<RegistryPayload<Handle>>,
        removed_nodes: Vec<RegistryPayload<Handle>>,
    ) -> Result<()>;
}

/// Store metadata repository.
pub trait StoreRepository: Send + Sync {
    /// Fetch stores by name. Missing names are absent from the result.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository backend fails.
    fn get(&self, names: &[String]) -> Result<Vec<StoreInfo>>;

    /// Fetch stores by name honoring the store-info cache policy.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository backend fails.
    fn get_with_ttl(&self, is_ttl: bool, ttl: Duration, names: &[String])
        -> Result<Vec<StoreInfo>>;

    /// All known store names.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository backend fails.
    fn get_all(&self) -> Result<Vec<String>>;

    /// Register new stores. Fails when a name already exists.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate names or backend failure.
    fn add(&self, stores: Vec<StoreInfo>) -> Result<()>;

    /// Merge each store's `count_delta` into the persisted count and
    /// return the reconciled records.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository backend fails.
    fn update(&self, stores: Vec<StoreInfo>) -> Result<Vec<StoreInfo>>;

    /// Remove stores by name.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository backend fails.
    fn remove(&self, names: &[String]) -> Result<()>;

    /// Best-effort replication of store records to passive targets.
    ///
    /// # Errors
    ///
    /// Returns an error when replication fails; commit durability is
    /// unaffected.
    fn replicate(&self, stores: Vec<StoreInfo>) -> Result<()>;
}

/// Append-only log of commit steps per transaction, with an hour-bucket
/// view for the recovery sweep.
pub trait TransactionLog: Send + Sync {
    /// Append a step. Idempotent for an identical `(tid, step,
    /// payload)`; implementations tolerate duplicates.
    ///
    /// # Errors
    ///
    /// Returns an error when the log backend fails.
    fn add(&self, tid: Uid, step: CommitStep, payload: Vec<u8>) -> Result<()>;

    /// Discard every step for a transaction (successful commit end, or
    /// completed rollback).
    ///
    /// # Errors
    ///
    /// Returns an error when the log backend fails.
    fn remove(&self, tid: Uid) -> Result<()>;

    /// Return one transaction older than the configured expiry, along
    /// with its hour bucket. Repeated calls within the same hour return
    /// the same set, which is what lets the sweep drain an hour
    /// deterministically.
    ///
    /// # Errors
    ///
    /// Returns an error when the log backend fails.
    fn get_one(&self) -> Result<Option<ExpiredTransaction>>;

    /// Return the next expired transaction within the given hour
    /// bucket. `None` when the hour is drained.
    ///
    /// # Errors
    ///
    /// Returns an error when the log backend fails.
    fn get_one_of_hour(&self, hour: &str) -> Result<Option<(Uid, Vec<CommitLogEntry>)>>;

    /// Mint a transaction ID.
    fn new_uuid(&self) -> Uid {
        Uid::new()
    }

    /// The priority log paired with this transaction log.
    fn priority_log(&self) -> Arc<dyn PriorityLog>;
}

/// Compact log of the registry-handle changes a transaction is about to
/// apply; the recovery sweep uses it for fast-path rollback when a
/// coordinator dies mid-publish.
pub trait PriorityLog: Send + Sync {
    /// Whether priority logging is active for this backend.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Record the restore images for a transaction about to publish.
    ///
    /// # Errors
    ///
    /// Returns an error when the log backend fails.
    fn add(&self, tid: Uid, handles: Vec<RegistryPayload<Handle>>) -> Result<()>;

    /// Drop a transaction's record.
    ///
    /// # Errors
    ///
    /// Returns an error when the log backend fails.
    fn remove(&self, tid: Uid) -> Result<()>;

    /// Fetch a transaction's restore images, when present.
    ///
    /// # Errors
    ///
    /// Returns an error when the log backend fails.
    fn get(&self, tid: Uid) -> Result<Option<Vec<RegistryPayload<Handle>>>>;

    /// Fetch up to `batch_size` records old enough to be considered
    /// dead. `ignore_age` bypasses the age filter; the cache-restart
    /// sweep sets it because a restart invalidates every in-flight
    /// transaction regardless of age.
    ///
    /// # Errors
    ///
    /// Returns an error when the log backend fails.
    fn get_batch(
        &self,
        batch_size: usize,
        ignore_age: bool,
    ) -> Result<Vec<(Uid, Vec<RegistryPayload<Handle>>)>>;

    /// Fire-and-forget record of a committed change set, for
    /// replication debugging.
    ///
    /// # Errors
    ///
    /// Returns an error when the log backend fails.
    fn log_commit_changes(
        &self,
        stores: Vec<StoreInfo>,
        new_root_nodes: Vec<RegistryPayload<Handle>>,
        added_nodes: Vec<RegistryPayload<Handle>>,
        updated_nodes: Vec<RegistryPayload<Handle>>,
        removed_nodes: Vec<RegistryPayload<Handle>>,
    ) -> Result<()>;

    /// Drop any registry sector claims this backend tracks.
    ///
    /// # Errors
    ///
    /// Returns an error when the log backend fails.
    fn clear_registry_sector_claims(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_payload_round_trip() {
        let h = Handle::new(Uid::new());
        let payload = RegistryPayload::new("t_r", vec![h]);
        let bytes = bincode::serialize(&payload).unwrap();
        let back: RegistryPayload<Handle> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_commit_log_entry_round_trip() {
        let entry = CommitLogEntry {
            step: CommitStep::CommitUpdatedNodes,
            payload: vec![1, 2, 3],
        };
        let bytes = bincode::serialize(&entry).unwrap();
        let back: CommitLogEntry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, entry);
    }
}
