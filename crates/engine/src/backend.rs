//! The per-B-Tree capability set the transaction coordinator drives.
//!
//! A transaction can host several B-Trees with different key/value
//! types. The coordinator is type-agnostic: it talks to each tree
//! through this object-safe trait, and the generic `SessionBackend`
//! adapter funnels the calls into the tree's shared state.

use crate::btree::BtreeInner;
use crate::node_repository::{HandlesPayload, NodesPayload};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sop_core::{BlobsIds, Handle, Result, StoreInfo, Uid};
use std::sync::Arc;
use std::time::Duration;

/// What the coordinator needs from a bound B-Tree during commit.
pub(crate) trait CommitBackend: Send + Sync {
    /// Current store metadata (including in-transaction count).
    fn store_info(&self) -> StoreInfo;

    /// Whether the session touched any item.
    fn has_tracked_items(&self) -> bool;

    /// Take item lock records for every tracked non-add item.
    fn lock_tracked_items(&self, duration: Duration) -> Result<()>;

    /// Release owned item lock records.
    fn unlock_tracked_items(&self) -> Result<()>;

    /// Re-verify item lock records immediately before finalize.
    fn check_tracked_items(&self) -> Result<()>;

    /// Persist pending separate-segment values.
    fn commit_tracked_items_values(&self) -> Result<()>;

    /// Value blob IDs to delete should this transaction roll back.
    fn rollback_tracked_items_values(&self) -> Vec<BlobsIds>;

    /// Value blob IDs that become obsolete once this transaction
    /// finalizes.
    fn obsolete_tracked_items_values(&self) -> Vec<BlobsIds>;

    /// Discard local caches and replay intent against a fresh read.
    fn refetch_and_merge(&self) -> Result<()>;

    /// Partition the local node cache by intent. Must run before the
    /// per-class commit calls.
    fn classify(&self);

    /// Logical IDs whose lock keys guard this commit (updates and
    /// removes).
    fn locked_node_ids(&self) -> Vec<Uid>;

    /// IDs of new root nodes, for the pre-action log entry.
    fn new_root_ids(&self) -> NodesPayload;

    /// IDs of added nodes, for the pre-action log entry.
    fn added_node_ids(&self) -> NodesPayload;

    /// IDs of removed nodes, for the pre-action log entry.
    fn removed_node_ids(&self) -> NodesPayload;

    /// Register new root nodes; `None` when another transaction won the
    /// root.
    fn commit_new_root_nodes(&self) -> Result<Option<HandlesPayload>>;

    /// Whether fetched node versions still hold.
    fn are_fetched_items_intact(&self) -> Result<bool>;

    /// Stage updated nodes into inactive slots; `None` on conflict.
    fn commit_updated_nodes(&self) -> Result<Option<HandlesPayload>>;

    /// Mark removed nodes deleted; `None` on conflict.
    fn commit_removed_nodes(&self) -> Result<Option<HandlesPayload>>;

    /// Register added nodes (no conflict path).
    fn commit_added_nodes(&self) -> Result<HandlesPayload>;

    /// `(commit, rollback)` store records: the commit one carries this
    /// transaction's count delta, the rollback one its inverse.
    fn store_info_for_commit(&self) -> (StoreInfo, StoreInfo);

    /// Push this transaction's committed nodes into the process-wide
    /// MRU under their published physical IDs.
    fn populate_mru(&self, handles: &[Handle]) -> Result<()>;

    /// Read-mode validation: fetched node versions still hold;
    /// refetching is the caller's business.
    fn reader_nodes_intact(&self) -> Result<bool>;

    /// Drop all session-local caches (transaction end).
    fn clear_session(&self);
}

/// Adapter binding a typed B-Tree to the type-erased commit surface.
pub(crate) struct SessionBackend<K, V> {
    inner: Arc<Mutex<BtreeInner<K, V>>>,
}

impl<K, V> SessionBackend<K, V> {
    pub fn new(inner: Arc<Mutex<BtreeInner<K, V>>>) -> Self {
        SessionBackend { inner }
    }
}

impl<K, V> CommitBackend for SessionBackend<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned + Send + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    fn store_info(&self) -> StoreInfo {
        self.inner.lock().store.clone()
    }

    fn has_tracked_items(&self) -> bool {
        self.inner.lock().tracker.has_items()
    }

    fn lock_tracked_items(&self, duration: Duration) -> Result<()> {
        self.inner.lock().tracker.lock(duration)
    }

    fn unlock_tracked_items(&self) -> Result<()> {
        self.inner.lock().tracker.unlock()
    }

    fn check_tracked_items(&self) -> Result<()> {
        self.inner.lock().tracker.check_tracked_items()
    }

    fn commit_tracked_items_values(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.tracker.commit_values(&inner.store)
    }

    fn rollback_tracked_items_values(&self) -> Vec<BlobsIds> {
        let guard = self.inner.lock();
        guard.tracker.rollback_values_payload(&guard.store)
    }

    fn obsolete_tracked_items_values(&self) -> Vec<BlobsIds> {
        let guard = self.inner.lock();
        guard.tracker.obsolete_values_payload(&guard.store)
    }

    fn refetch_and_merge(&self) -> Result<()> {
        self.inner.lock().refetch_and_merge()
    }

    fn classify(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.classified = Some(inner.repo.classify(&inner.store));
    }

    fn locked_node_ids(&self) -> Vec<Uid> {
        let guard = self.inner.lock();
        let Some(classified) = &guard.classified else {
            return Vec::new();
        };
        classified
            .updates
            .iter()
            .chain(classified.removes.iter())
            .map(|n| n.id)
            .collect()
    }

    fn new_root_ids(&self) -> NodesPayload {
        let guard = self.inner.lock();
        let ids = guard
            .classified
            .as_ref()
            .map(|c| c.root_adds.iter().map(|n| n.id).collect())
            .unwrap_or_default();
        NodesPayload {
            registry_table: guard.store.registry_table.clone(),
            blob_table: guard.store.blob_table.clone(),
            ids,
        }
    }

    fn added_node_ids(&self) -> NodesPayload {
        let guard = self.inner.lock();
        let ids = guard
            .classified
            .as_ref()
            .map(|c| c.adds.iter().map(|n| n.id).collect())
            .unwrap_or_default();
        NodesPayload {
            registry_table: guard.store.registry_table.clone(),
            blob_table: guard.store.blob_table.clone(),
            ids,
        }
    }

    fn removed_node_ids(&self) -> NodesPayload {
        let guard = self.inner.lock();
        let ids = guard
            .classified
            .as_ref()
            .map(|c| c.removes.iter().map(|n| n.id).collect())
            .unwrap_or_default();
        NodesPayload {
            registry_table: guard.store.registry_table.clone(),
            blob_table: guard.store.blob_table.clone(),
            ids,
        }
    }

    fn commit_new_root_nodes(&self) -> Result<Option<HandlesPayload>> {
        let guard = self.inner.lock();
        let nodes = guard
            .classified
            .as_ref()
            .map(|c| c.root_adds.as_slice())
            .unwrap_or(&[]);
        guard.repo.commit_new_root_nodes(&guard.store, nodes)
    }

    fn are_fetched_items_intact(&self) -> Result<bool> {
        let guard = self.inner.lock();
        let fetched = guard
            .classified
            .as_ref()
            .map(|c| c.fetched.as_slice())
            .unwrap_or(&[]);
        guard.repo.are_fetched_items_intact(&guard.store, fetched)
    }

    fn commit_updated_nodes(&self) -> Result<Option<HandlesPayload>> {
        let guard = self.inner.lock();
        let nodes = guard
            .classified
            .as_ref()
            .map(|c| c.updates.as_slice())
            .unwrap_or(&[]);
        guard.repo.commit_updated_nodes(&guard.store, nodes)
    }

    fn commit_removed_nodes(&self) -> Result<Option<HandlesPayload>> {
        let guard = self.inner.lock();
        let nodes = guard
            .classified
            .as_ref()
            .map(|c| c.removes.as_slice())
            .unwrap_or(&[]);
        guard.repo.commit_removed_nodes(&guard.store, nodes)
    }

    fn commit_added_nodes(&self) -> Result<HandlesPayload> {
        let guard = self.inner.lock();
        let nodes = guard
            .classified
            .as_ref()
            .map(|c| c.adds.as_slice())
            .unwrap_or(&[]);
        guard.repo.commit_added_nodes(&guard.store, nodes)
    }

    fn store_info_for_commit(&self) -> (StoreInfo, StoreInfo) {
        let guard = self.inner.lock();
        let delta = guard.store.count - guard.repo.count_at_open;
        let mut commit = guard.store.clone();
        commit.count_delta = delta;
        let mut rollback = guard.store.clone();
        rollback.count = guard.repo.count_at_open;
        rollback.count_delta = -delta;
        (commit, rollback)
    }

    fn populate_mru(&self, handles: &[Handle]) -> Result<()> {
        let guard = self.inner.lock();
        let Some(classified) = &guard.classified else {
            return Ok(());
        };
        guard.repo.populate_mru(&guard.store, classified, handles)
    }

    fn reader_nodes_intact(&self) -> Result<bool> {
        self.inner.lock().fetched_nodes_intact()
    }

    fn clear_session(&self) {
        let mut guard = self.inner.lock();
        guard.repo.clear();
        guard.tracker.clear();
        guard.classified = None;
    }
}
