//! Node repository: the per-B-Tree view of nodes inside a transaction.
//!
//! The frontend (`NodeRepository`) is what the B-Tree reads and writes
//! through. It keeps a local cache of every node the transaction
//! touched, classified by intent (added, updated, removed, fetched),
//! and resolves reads through registry handle -> active physical ID ->
//! L1 -> shared cache -> blob store.
//!
//! The commit side stages each class against the backends:
//! - updated nodes write their new bytes into the handle's INACTIVE
//!   slot; the active slot is never overwritten until phase two flips
//!   it, which is what makes node updates atomic at the registry layer
//! - added and new-root nodes register fresh handles
//! - removed nodes are marked deleted with a work-in-progress stamp
//!
//! The rollback half consists of non-generic helpers driven by logged
//! commit steps, shared by live rollback and the recovery sweep.

use crate::btree::node::Node;
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sop_core::{
    format_node_key, now_millis, BlobStore, BlobsIds, BlobsPayload, Cache, CacheExt, Error, Handle,
    Registry, RegistryPayload, Result, StoreInfo, Uid,
};
use sop_storage::global_l1_cache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

/// Bound on the recently-read (untracked) node cache.
const READ_CACHE_CAPACITY: usize = 128;

/// What a transaction intends to do with a locally cached node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeAction {
    /// Read through without an explicit fetch signal.
    Default,
    /// Read and relied upon; version-checked at commit.
    Get,
    /// Created in this transaction.
    Add,
    /// Modified in this transaction.
    Update,
    /// Removed in this transaction.
    Remove,
}

/// A node in the transaction's local cache, tagged with intent.
#[derive(Debug, Clone)]
pub(crate) struct CachedNode<K, V> {
    pub action: NodeAction,
    pub node: Node<K, V>,
}

/// The one-pass partition of the local cache at commit time.
#[derive(Debug, Clone)]
pub(crate) struct Classified<K, V> {
    pub root_adds: Vec<Node<K, V>>,
    pub adds: Vec<Node<K, V>>,
    pub updates: Vec<Node<K, V>>,
    pub removes: Vec<Node<K, V>>,
    pub fetched: Vec<(Uid, i32)>,
}

impl<K, V> Default for Classified<K, V> {
    fn default() -> Self {
        Classified {
            root_adds: Vec::new(),
            adds: Vec::new(),
            updates: Vec::new(),
            removes: Vec::new(),
            fetched: Vec::new(),
        }
    }
}

/// Registry handles plus the table coordinates needed to undo or
/// publish them. The commit-step payload format for node classes staged
/// with known handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub(crate) struct HandlesPayload {
    pub registry_table: String,
    pub blob_table: String,
    pub handles: Vec<Handle>,
}

impl HandlesPayload {
    /// View as a registry payload.
    pub fn registry_payload(&self) -> RegistryPayload<Handle> {
        RegistryPayload::new(self.registry_table.clone(), self.handles.clone())
    }

    pub fn logical_ids(&self) -> Vec<Uid> {
        self.handles.iter().map(|h| h.logical_id).collect()
    }
}

/// Node IDs plus table coordinates. The commit-step payload format for
/// node classes logged before their handles exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub(crate) struct NodesPayload {
    pub registry_table: String,
    pub blob_table: String,
    pub ids: Vec<Uid>,
}

/// The storage backends a commit or rollback runs against.
#[derive(Clone)]
pub(crate) struct StorageServices {
    pub registry: Arc<dyn Registry>,
    pub blob_store: Arc<dyn BlobStore>,
    pub cache: Arc<dyn Cache>,
}

fn duration_opt(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}

/// Per-B-Tree node repository frontend.
pub(crate) struct NodeRepository<K, V> {
    local_cache: HashMap<Uid, CachedNode<K, V>>,
    read_cache: LruCache<Uid, Node<K, V>>,
    /// Store count snapshot taken when the B-Tree was bound to the
    /// transaction; the commit reports `count - count_at_open` as its
    /// delta.
    pub count_at_open: i64,
    registry: Arc<dyn Registry>,
    blob_store: Arc<dyn BlobStore>,
    cache: Arc<dyn Cache>,
}

impl<K, V> NodeRepository<K, V>
where
    K: Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    pub fn new(
        registry: Arc<dyn Registry>,
        blob_store: Arc<dyn BlobStore>,
        cache: Arc<dyn Cache>,
        count_at_open: i64,
    ) -> Self {
        NodeRepository {
            local_cache: HashMap::new(),
            read_cache: LruCache::new(
                NonZeroUsize::new(READ_CACHE_CAPACITY).expect("capacity is non-zero"),
            ),
            count_at_open,
            registry,
            blob_store,
            cache,
        }
    }

    /// Track a node created by this transaction.
    pub fn add(&mut self, node: Node<K, V>) {
        self.local_cache.insert(
            node.id,
            CachedNode {
                action: NodeAction::Add,
                node,
            },
        );
    }

    /// Track a modification. A node added in this transaction stays an
    /// add (with the new contents); anything else becomes an update.
    pub fn update(&mut self, node: Node<K, V>) {
        let action = match self.local_cache.get(&node.id) {
            Some(cached) if cached.action == NodeAction::Add => NodeAction::Add,
            _ => NodeAction::Update,
        };
        self.local_cache.insert(node.id, CachedNode { action, node });
    }

    /// Track a removal. A node added in this transaction is simply
    /// dropped; it never reached the backend.
    pub fn remove(&mut self, id: Uid) {
        match self.local_cache.get_mut(&id) {
            Some(cached) if cached.action == NodeAction::Add => {
                self.local_cache.remove(&id);
            }
            Some(cached) => cached.action = NodeAction::Remove,
            None => {}
        }
    }

    /// Promote a read node into the tracked set: its version will be
    /// validated at commit.
    pub fn fetched(&mut self, id: Uid) {
        if let Some(cached) = self.local_cache.get_mut(&id) {
            if cached.action == NodeAction::Default {
                cached.action = NodeAction::Get;
            }
            return;
        }
        if let Some(node) = self.read_cache.pop(&id) {
            self.local_cache.insert(
                id,
                CachedNode {
                    action: NodeAction::Get,
                    node,
                },
            );
        }
    }

    /// Read a node. The local cache is authoritative for this
    /// transaction's view: a locally removed node reads as absent even
    /// if the backend still has it.
    pub fn get(&mut self, store: &StoreInfo, logical_id: Uid) -> Result<Option<Node<K, V>>> {
        if let Some(cached) = self.local_cache.get(&logical_id) {
            return Ok(match cached.action {
                NodeAction::Remove => None,
                _ => Some(cached.node.clone()),
            });
        }
        if let Some(node) = self.read_cache.get(&logical_id) {
            return Ok(Some(node.clone()));
        }
        let Some(node) = self.fetch(store, logical_id)? else {
            return Ok(None);
        };
        self.read_cache.put(logical_id, node.clone());
        self.local_cache.insert(
            logical_id,
            CachedNode {
                action: NodeAction::Default,
                node: node.clone(),
            },
        );
        Ok(Some(node))
    }

    /// Drop all transaction-local state (commit/rollback end, refetch).
    pub fn clear(&mut self) {
        self.local_cache.clear();
        self.read_cache.clear();
    }

    /// Resolve through registry handle, then L1, shared cache, blob
    /// store. Freshly read nodes are mirrored into both caches.
    fn fetch(&mut self, store: &StoreInfo, logical_id: Uid) -> Result<Option<Node<K, V>>> {
        let handles = self.registry.get(vec![RegistryPayload::new(
            store.registry_table.clone(),
            vec![logical_id],
        )])?;
        let Some(handle) = handles.first().and_then(|p| p.items.first()).copied() else {
            return Ok(None);
        };
        if handle.is_deleted {
            return Ok(None);
        }
        let active_id = handle.get_active_id();
        let node_key = format_node_key(active_id);

        if let Some(bytes) = global_l1_cache().get(&node_key) {
            let mut node: Node<K, V> = bincode::deserialize(&bytes)?;
            node.version = handle.version;
            return Ok(Some(node));
        }

        let cfg = &store.cache_config;
        let cached: Option<Node<K, V>> = if cfg.is_node_cache_ttl {
            self.cache.get_struct_ex(&node_key, cfg.node_cache_duration)?
        } else {
            self.cache.get_struct(&node_key)?
        };
        if let Some(mut node) = cached {
            node.version = handle.version;
            return Ok(Some(node));
        }

        let Some(bytes) = self.blob_store.get_one(&store.blob_table, active_id)? else {
            return Err(Error::NotFound(format!(
                "node blob {} missing from {}",
                active_id, store.blob_table
            )));
        };
        let mut node: Node<K, V> = bincode::deserialize(&bytes)?;
        node.version = handle.version;
        if let Some(d) = duration_opt(cfg.node_cache_duration) {
            self.cache.set(&node_key, &bytes, Some(d))?;
            global_l1_cache().set(&node_key, bytes, Some(d));
        }
        Ok(Some(node))
    }

    /// Walk the local cache once and partition it by intent.
    pub fn classify(&self, store: &StoreInfo) -> Classified<K, V> {
        let mut out = Classified::default();
        for (id, cached) in &self.local_cache {
            match cached.action {
                NodeAction::Add | NodeAction::Default
                    if cached.node.version == 0 && *id == store.root_node_id =>
                {
                    out.root_adds.push(cached.node.clone());
                }
                NodeAction::Add => out.adds.push(cached.node.clone()),
                NodeAction::Update => out.updates.push(cached.node.clone()),
                NodeAction::Remove => out.removes.push(cached.node.clone()),
                NodeAction::Get => out.fetched.push((*id, cached.node.version)),
                NodeAction::Default => {}
            }
        }
        out
    }

    /// Register brand-new root nodes. Returns `None` when another
    /// transaction registered a root first; the caller refetches and
    /// merges.
    pub fn commit_new_root_nodes(
        &self,
        store: &StoreInfo,
        roots: &[Node<K, V>],
    ) -> Result<Option<HandlesPayload>> {
        let payload = HandlesPayload {
            registry_table: store.registry_table.clone(),
            blob_table: store.blob_table.clone(),
            handles: Vec::new(),
        };
        if roots.is_empty() {
            return Ok(Some(payload));
        }
        let ids: Vec<Uid> = roots.iter().map(|n| n.id).collect();
        let existing = self.registry.get(vec![RegistryPayload::new(
            store.registry_table.clone(),
            ids,
        )])?;
        if existing.iter().any(|p| !p.items.is_empty()) {
            return Ok(None);
        }
        self.persist_new_nodes(store, roots)
    }

    /// Register nodes added by this transaction. Added nodes carry
    /// fresh logical IDs, so there is nothing to conflict with.
    pub fn commit_added_nodes(
        &self,
        store: &StoreInfo,
        adds: &[Node<K, V>],
    ) -> Result<HandlesPayload> {
        Ok(self
            .persist_new_nodes(store, adds)?
            .expect("new nodes have no conflict path"))
    }

    fn persist_new_nodes(
        &self,
        store: &StoreInfo,
        nodes: &[Node<K, V>],
    ) -> Result<Option<HandlesPayload>> {
        let mut handles = Vec::with_capacity(nodes.len());
        let mut blobs = Vec::with_capacity(nodes.len());
        let cache_duration = duration_opt(store.cache_config.node_cache_duration);
        for node in nodes {
            let mut handle = Handle::new(node.id);
            handle.version = 1;
            let mut copy = node.clone();
            copy.version = handle.version;
            let bytes = bincode::serialize(&copy)?;
            if let Some(d) = cache_duration {
                self.cache
                    .set(&format_node_key(handle.get_active_id()), &bytes, Some(d))?;
            }
            blobs.push((handle.get_active_id(), bytes));
            handles.push(handle);
        }
        self.blob_store.add(vec![BlobsPayload {
            blob_table: store.blob_table.clone(),
            blobs,
        }])?;
        self.registry.add(vec![RegistryPayload::new(
            store.registry_table.clone(),
            handles.clone(),
        )])?;
        Ok(Some(HandlesPayload {
            registry_table: store.registry_table.clone(),
            blob_table: store.blob_table.clone(),
            handles,
        }))
    }

    /// Stage updated nodes into their handles' inactive slots. Returns
    /// `None` on any version drift or live competing writer.
    pub fn commit_updated_nodes(
        &self,
        store: &StoreInfo,
        updates: &[Node<K, V>],
    ) -> Result<Option<HandlesPayload>> {
        let mut payload = HandlesPayload {
            registry_table: store.registry_table.clone(),
            blob_table: store.blob_table.clone(),
            handles: Vec::new(),
        };
        if updates.is_empty() {
            return Ok(Some(payload));
        }
        let Some(mut handles) = self.current_handles(store, updates)? else {
            return Ok(None);
        };
        let mut blobs = Vec::with_capacity(updates.len());
        let cache_duration = duration_opt(store.cache_config.node_cache_duration);
        for (node, handle) in updates.iter().zip(handles.iter_mut()) {
            if handle.is_deleted {
                if !handle.is_expired_inactive() {
                    return Ok(None);
                }
                // The deleting transaction is dead; take over its mark.
                handle.is_deleted = false;
            }
            if handle.version != node.version {
                return Ok(None);
            }
            let mut staged_id = handle.allocate_id();
            if staged_id.is_nil() && handle.is_expired_inactive() {
                handle.clear_inactive_id();
                staged_id = handle.allocate_id();
            }
            if staged_id.is_nil() {
                // A live writer already staged an update for this node.
                return Ok(None);
            }
            let bytes = bincode::serialize(node)?;
            if let Some(d) = cache_duration {
                self.cache
                    .set(&format_node_key(staged_id), &bytes, Some(d))?;
            }
            blobs.push((staged_id, bytes));
        }
        self.blob_store.add(vec![BlobsPayload {
            blob_table: store.blob_table.clone(),
            blobs,
        }])?;
        self.registry.update_no_locks(vec![RegistryPayload::new(
            store.registry_table.clone(),
            handles.clone(),
        )])?;
        payload.handles = handles;
        Ok(Some(payload))
    }

    /// Mark removed nodes deleted (with a work-in-progress stamp).
    /// Returns `None` on version drift or an already-deleted handle.
    pub fn commit_removed_nodes(
        &self,
        store: &StoreInfo,
        removes: &[Node<K, V>],
    ) -> Result<Option<HandlesPayload>> {
        let mut payload = HandlesPayload {
            registry_table: store.registry_table.clone(),
            blob_table: store.blob_table.clone(),
            handles: Vec::new(),
        };
        if removes.is_empty() {
            return Ok(Some(payload));
        }
        let Some(mut handles) = self.current_handles(store, removes)? else {
            return Ok(None);
        };
        let now = now_millis();
        for (node, handle) in removes.iter().zip(handles.iter_mut()) {
            if handle.is_deleted || handle.version != node.version {
                return Ok(None);
            }
            handle.is_deleted = true;
            handle.work_in_progress_timestamp = now;
        }
        self.registry.update_no_locks(vec![RegistryPayload::new(
            store.registry_table.clone(),
            handles.clone(),
        )])?;
        payload.handles = handles;
        Ok(Some(payload))
    }

    /// Whether every fetched node's registry version is unchanged.
    pub fn are_fetched_items_intact(
        &self,
        store: &StoreInfo,
        fetched: &[(Uid, i32)],
    ) -> Result<bool> {
        if fetched.is_empty() {
            return Ok(true);
        }
        let ids: Vec<Uid> = fetched.iter().map(|(id, _)| *id).collect();
        let payloads = self.registry.get(vec![RegistryPayload::new(
            store.registry_table.clone(),
            ids,
        )])?;
        let by_id: HashMap<Uid, &Handle> = payloads
            .iter()
            .flat_map(|p| p.items.iter())
            .map(|h| (h.logical_id, h))
            .collect();
        Ok(fetched.iter().all(|(id, version)| {
            by_id
                .get(id)
                .map(|h| !h.is_deleted && h.version == *version)
                .unwrap_or(false)
        }))
    }

    /// Populate the process-wide MRU with this transaction's committed
    /// nodes, keyed by their (new) active physical IDs.
    pub fn populate_mru(
        &self,
        store: &StoreInfo,
        classified: &Classified<K, V>,
        handles: &[Handle],
    ) -> Result<()> {
        let Some(d) = duration_opt(store.cache_config.node_cache_duration) else {
            return Ok(());
        };
        let nodes = classified
            .root_adds
            .iter()
            .chain(classified.adds.iter())
            .chain(classified.updates.iter());
        let by_id: HashMap<Uid, &Handle> = handles.iter().map(|h| (h.logical_id, h)).collect();
        for node in nodes {
            let Some(handle) = by_id.get(&node.id) else {
                continue;
            };
            let mut copy = node.clone();
            copy.version = handle.version;
            let bytes = bincode::serialize(&copy)?;
            global_l1_cache().set(&format_node_key(handle.get_active_id()), bytes, Some(d));
        }
        Ok(())
    }

    /// Fetch the current handle of every node, in node order. `None`
    /// when any is missing from the registry.
    fn current_handles(
        &self,
        store: &StoreInfo,
        nodes: &[Node<K, V>],
    ) -> Result<Option<Vec<Handle>>> {
        let ids: Vec<Uid> = nodes.iter().map(|n| n.id).collect();
        let payloads = self.registry.get(vec![RegistryPayload::new(
            store.registry_table.clone(),
            ids.clone(),
        )])?;
        let by_id: HashMap<Uid, Handle> = payloads
            .into_iter()
            .flat_map(|p| p.items)
            .map(|h| (h.logical_id, h))
            .collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match by_id.get(&id) {
                Some(h) => out.push(*h),
                None => return Ok(None),
            }
        }
        Ok(Some(out))
    }
}

// ---------------------------------------------------------------------------
// Rollback / finalize helpers (non-generic; driven by logged payloads)
// ---------------------------------------------------------------------------

/// Undo registered new-root nodes.
///
/// When the log shows registration completed, the handles are ours:
/// remove them along with their blobs and cache entries. When it does
/// not, only reclaim blobs for root IDs absent from the registry - a
/// present handle means a competing transaction won the root and its
/// blob is live data.
pub(crate) fn rollback_new_root_nodes(
    services: &StorageServices,
    payloads: &[NodesPayload],
    registry_progressed: bool,
) -> Result<()> {
    for payload in payloads {
        if payload.ids.is_empty() {
            continue;
        }
        let reclaim: Vec<Uid> = if registry_progressed {
            payload.ids.clone()
        } else {
            let registered = services.registry.get(vec![RegistryPayload::new(
                payload.registry_table.clone(),
                payload.ids.clone(),
            )])?;
            let taken: Vec<Uid> = registered
                .iter()
                .flat_map(|p| p.items.iter())
                .map(|h| h.logical_id)
                .collect();
            payload
                .ids
                .iter()
                .filter(|id| !taken.contains(id))
                .copied()
                .collect()
        };
        if !reclaim.is_empty() {
            services.blob_store.remove(vec![BlobsIds {
                blob_table: payload.blob_table.clone(),
                ids: reclaim.clone(),
            }])?;
            let keys: Vec<String> = reclaim.iter().map(|id| format_node_key(*id)).collect();
            services.cache.delete(&keys)?;
            delete_l1(&keys);
        }
        if registry_progressed {
            services.registry.remove(vec![RegistryPayload::new(
                payload.registry_table.clone(),
                payload.ids.clone(),
            )])?;
        }
    }
    Ok(())
}

/// Undo registered added nodes: blobs, cache entries and registry
/// handles.
pub(crate) fn rollback_added_nodes(
    services: &StorageServices,
    payloads: &[NodesPayload],
) -> Result<()> {
    rollback_new_root_nodes(services, payloads, true)
}

/// Undo staged node updates: clear the inactive slots and delete the
/// staged blobs.
pub(crate) fn rollback_updated_nodes(
    services: &StorageServices,
    payloads: &[HandlesPayload],
    nodes_are_locked: bool,
) -> Result<()> {
    for payload in payloads {
        if payload.handles.is_empty() {
            continue;
        }
        let mut staged_ids = Vec::new();
        let mut restored = Vec::with_capacity(payload.handles.len());
        for handle in &payload.handles {
            let mut h = *handle;
            let staged = h.get_inactive_id();
            if !staged.is_nil() {
                staged_ids.push(staged);
            }
            h.clear_inactive_id();
            restored.push(h);
        }
        let registry_payload = vec![RegistryPayload::new(
            payload.registry_table.clone(),
            restored,
        )];
        if nodes_are_locked {
            services.registry.update_no_locks(registry_payload)?;
        } else {
            services.registry.update(registry_payload)?;
        }
        if !staged_ids.is_empty() {
            services.blob_store.remove(vec![BlobsIds {
                blob_table: payload.blob_table.clone(),
                ids: staged_ids.clone(),
            }])?;
            let keys: Vec<String> = staged_ids.iter().map(|id| format_node_key(*id)).collect();
            services.cache.delete(&keys)?;
            delete_l1(&keys);
        }
    }
    Ok(())
}

/// Undo delete marks: unset `is_deleted` and the work-in-progress stamp
/// on the affected handles.
pub(crate) fn rollback_removed_nodes(
    services: &StorageServices,
    payloads: &[NodesPayload],
    nodes_are_locked: bool,
) -> Result<()> {
    for payload in payloads {
        if payload.ids.is_empty() {
            continue;
        }
        let current = services.registry.get(vec![RegistryPayload::new(
            payload.registry_table.clone(),
            payload.ids.clone(),
        )])?;
        let mut restored = Vec::new();
        for handle in current.into_iter().flat_map(|p| p.items) {
            if handle.is_deleted {
                let mut h = handle;
                h.is_deleted = false;
                h.work_in_progress_timestamp = 0;
                restored.push(h);
            }
        }
        if restored.is_empty() {
            continue;
        }
        let registry_payload = vec![RegistryPayload::new(
            payload.registry_table.clone(),
            restored,
        )];
        if nodes_are_locked {
            services.registry.update_no_locks(registry_payload)?;
        } else {
            services.registry.update(registry_payload)?;
        }
    }
    Ok(())
}

/// Unconditional blob and cache eviction, for dead-transaction residue.
pub(crate) fn remove_nodes(
    blob_store: &Arc<dyn BlobStore>,
    cache: &Arc<dyn Cache>,
    blobs: &[BlobsIds],
) -> Result<()> {
    for payload in blobs {
        if payload.ids.is_empty() {
            continue;
        }
        blob_store.remove(vec![payload.clone()])?;
        let keys: Vec<String> = payload.ids.iter().map(|id| format_node_key(*id)).collect();
        cache.delete(&keys)?;
        delete_l1(&keys);
    }
    Ok(())
}

/// Produce the phase-two publish images for updated nodes: active slot
/// flipped, version bumped, work-in-progress stamp set to the sentinel
/// that marks the active slot as freshly published.
pub(crate) fn activate_inactive_nodes(payloads: &[HandlesPayload]) -> Vec<HandlesPayload> {
    payloads
        .iter()
        .map(|payload| {
            let mut out = payload.clone();
            for handle in &mut out.handles {
                handle.flip_active_id();
                handle.version += 1;
                handle.work_in_progress_timestamp = 1;
            }
            out
        })
        .collect()
}

/// Produce the phase-two publish images for removed nodes: version
/// bumped, work-in-progress stamp cleared, deletion mark kept.
pub(crate) fn touch_nodes(payloads: &[HandlesPayload]) -> Vec<HandlesPayload> {
    payloads
        .iter()
        .map(|payload| {
            let mut out = payload.clone();
            for handle in &mut out.handles {
                handle.version += 1;
                handle.work_in_progress_timestamp = 0;
            }
            out
        })
        .collect()
}

fn delete_l1(keys: &[String]) {
    global_l1_cache().delete(keys);
}

#[cfg(test)]
mod tests {
    use super::*;
    use sop_core::StoreOptions;
    use sop_storage::{MemoryBlobStore, MemoryCache, MemoryRegistry};

    type Repo = NodeRepository<i32, String>;

    struct Fixture {
        registry: Arc<MemoryRegistry>,
        blob_store: Arc<MemoryBlobStore>,
        cache: Arc<MemoryCache>,
        store: StoreInfo,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                registry: Arc::new(MemoryRegistry::new()),
                blob_store: Arc::new(MemoryBlobStore::new()),
                cache: Arc::new(MemoryCache::new()),
                store: StoreInfo::new(StoreOptions::new("repo_test", 4, false, true)).unwrap(),
            }
        }

        fn repo(&self) -> Repo {
            NodeRepository::new(
                self.registry.clone(),
                self.blob_store.clone(),
                self.cache.clone(),
                0,
            )
        }

        fn services(&self) -> StorageServices {
            StorageServices {
                registry: self.registry.clone(),
                blob_store: self.blob_store.clone(),
                cache: self.cache.clone(),
            }
        }
    }

    fn leaf(id: Uid) -> Node<i32, String> {
        let mut node = Node::new(id);
        node.slots.push(sop_core::Item::new(1, "one".to_string()));
        node
    }

    #[test]
    fn test_local_cache_is_authoritative() {
        let fx = Fixture::new();
        let mut repo = fx.repo();
        let node = leaf(Uid::new());
        let id = node.id;

        repo.add(node.clone());
        assert!(repo.get(&fx.store, id).unwrap().is_some());

        repo.remove(id);
        // An added-then-removed node vanishes without backend churn.
        assert!(repo.get(&fx.store, id).unwrap().is_none());
        assert!(repo.classify(&fx.store).adds.is_empty());
    }

    #[test]
    fn test_update_of_added_node_stays_add() {
        let fx = Fixture::new();
        let mut repo = fx.repo();
        let mut node = leaf(Uid::new());
        repo.add(node.clone());
        node.slots.push(sop_core::Item::new(2, "two".to_string()));
        repo.update(node.clone());

        let classified = repo.classify(&fx.store);
        assert_eq!(classified.adds.len(), 1);
        assert!(classified.updates.is_empty());
        assert_eq!(classified.adds[0].slots.len(), 2);
    }

    #[test]
    fn test_classification_of_root_add() {
        let fx = Fixture::new();
        let mut repo = fx.repo();
        let root = Node::<i32, String>::new(fx.store.root_node_id);
        repo.add(root);
        let classified = repo.classify(&fx.store);
        assert_eq!(classified.root_adds.len(), 1);
        assert!(classified.adds.is_empty());
    }

    #[test]
    fn test_commit_added_then_get_round_trip() {
        let fx = Fixture::new();
        let mut repo = fx.repo();
        let node = leaf(Uid::new());
        let id = node.id;

        repo.commit_added_nodes(&fx.store, &[node]).unwrap();

        // A fresh repository (another transaction) resolves it through
        // the registry with the committed version.
        let mut other = fx.repo();
        let read = other.get(&fx.store, id).unwrap().expect("node resolves");
        assert_eq!(read.version, 1);
        assert_eq!(read.slots.len(), 1);
    }

    #[test]
    fn test_commit_new_root_nodes_detects_existing_root() {
        let fx = Fixture::new();
        let repo = fx.repo();
        let root = Node::<i32, String>::new(fx.store.root_node_id);

        let staged = repo
            .commit_new_root_nodes(&fx.store, &[root.clone()])
            .unwrap();
        assert!(staged.is_some());

        // A competing transaction creating the same root loses.
        let other = fx.repo();
        assert!(other
            .commit_new_root_nodes(&fx.store, &[root])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_commit_updated_nodes_stages_inactive_slot() {
        let fx = Fixture::new();
        let mut repo = fx.repo();
        let node = leaf(Uid::new());
        let id = node.id;
        repo.commit_added_nodes(&fx.store, &[node]).unwrap();

        let mut fresh = fx.repo();
        let mut read = fresh.get(&fx.store, id).unwrap().unwrap();
        read.slots.push(sop_core::Item::new(9, "nine".to_string()));
        let staged = fresh
            .commit_updated_nodes(&fx.store, &[read])
            .unwrap()
            .expect("no conflict");
        let handle = staged.handles[0];

        // Active slot untouched; staged bytes sit in the inactive slot.
        assert_eq!(handle.get_active_id(), id);
        assert!(!handle.get_inactive_id().is_nil());
        assert!(fx
            .blob_store
            .contains(&fx.store.blob_table, handle.get_inactive_id()));
        assert_eq!(fx.registry.get_handle(&fx.store.registry_table, id), Some(handle));
    }

    #[test]
    fn test_commit_updated_nodes_conflicts_on_version_drift() {
        let fx = Fixture::new();
        let repo = fx.repo();
        let node = leaf(Uid::new());
        let id = node.id;
        repo.commit_added_nodes(&fx.store, &[node]).unwrap();

        let mut stale = fx.repo().get(&fx.store, id).unwrap().unwrap();
        stale.version = 99;
        assert!(fx
            .repo()
            .commit_updated_nodes(&fx.store, &[stale])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_commit_updated_nodes_conflicts_on_live_staged_slot() {
        let fx = Fixture::new();
        let repo = fx.repo();
        let node = leaf(Uid::new());
        let id = node.id;
        repo.commit_added_nodes(&fx.store, &[node]).unwrap();

        let read = fx.repo().get(&fx.store, id).unwrap().unwrap();
        assert!(fx
            .repo()
            .commit_updated_nodes(&fx.store, &[read.clone()])
            .unwrap()
            .is_some());

        // Second writer sees a live inactive slot and loses.
        assert!(fx
            .repo()
            .commit_updated_nodes(&fx.store, &[read])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_commit_removed_nodes_marks_deleted() {
        let fx = Fixture::new();
        let repo = fx.repo();
        let node = leaf(Uid::new());
        let id = node.id;
        repo.commit_added_nodes(&fx.store, &[node]).unwrap();

        let read = fx.repo().get(&fx.store, id).unwrap().unwrap();
        let staged = fx
            .repo()
            .commit_removed_nodes(&fx.store, &[read.clone()])
            .unwrap()
            .expect("no conflict");
        assert!(staged.handles[0].is_deleted);
        assert!(staged.handles[0].work_in_progress_timestamp > 0);

        // A second remover conflicts on the deletion mark.
        assert!(fx
            .repo()
            .commit_removed_nodes(&fx.store, &[read])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_are_fetched_items_intact() {
        let fx = Fixture::new();
        let repo = fx.repo();
        let node = leaf(Uid::new());
        let id = node.id;
        repo.commit_added_nodes(&fx.store, &[node]).unwrap();

        assert!(repo
            .are_fetched_items_intact(&fx.store, &[(id, 1)])
            .unwrap());
        assert!(!repo
            .are_fetched_items_intact(&fx.store, &[(id, 2)])
            .unwrap());
        assert!(!repo
            .are_fetched_items_intact(&fx.store, &[(Uid::new(), 1)])
            .unwrap());
    }

    #[test]
    fn test_rollback_updated_nodes_clears_staged_state() {
        let fx = Fixture::new();
        let repo = fx.repo();
        let node = leaf(Uid::new());
        let id = node.id;
        repo.commit_added_nodes(&fx.store, &[node]).unwrap();

        let read = fx.repo().get(&fx.store, id).unwrap().unwrap();
        let staged = fx
            .repo()
            .commit_updated_nodes(&fx.store, &[read])
            .unwrap()
            .unwrap();
        let staged_id = staged.handles[0].get_inactive_id();

        rollback_updated_nodes(&fx.services(), &[staged], true).unwrap();

        let handle = fx.registry.get_handle(&fx.store.registry_table, id).unwrap();
        assert!(handle.get_inactive_id().is_nil());
        assert_eq!(handle.work_in_progress_timestamp, 0);
        assert!(!fx.blob_store.contains(&fx.store.blob_table, staged_id));
    }

    #[test]
    fn test_rollback_removed_nodes_restores_handles() {
        let fx = Fixture::new();
        let repo = fx.repo();
        let node = leaf(Uid::new());
        let id = node.id;
        repo.commit_added_nodes(&fx.store, &[node]).unwrap();

        let read = fx.repo().get(&fx.store, id).unwrap().unwrap();
        fx.repo()
            .commit_removed_nodes(&fx.store, &[read])
            .unwrap()
            .unwrap();

        let payload = NodesPayload {
            registry_table: fx.store.registry_table.clone(),
            blob_table: fx.store.blob_table.clone(),
            ids: vec![id],
        };
        rollback_removed_nodes(&fx.services(), &[payload], true).unwrap();

        let handle = fx.registry.get_handle(&fx.store.registry_table, id).unwrap();
        assert!(!handle.is_deleted);
        assert_eq!(handle.work_in_progress_timestamp, 0);
    }

    #[test]
    fn test_rollback_added_nodes_removes_everything() {
        let fx = Fixture::new();
        let repo = fx.repo();
        let node = leaf(Uid::new());
        let id = node.id;
        repo.commit_added_nodes(&fx.store, &[node]).unwrap();

        let payload = NodesPayload {
            registry_table: fx.store.registry_table.clone(),
            blob_table: fx.store.blob_table.clone(),
            ids: vec![id],
        };
        rollback_added_nodes(&fx.services(), &[payload]).unwrap();

        assert!(fx.registry.get_handle(&fx.store.registry_table, id).is_none());
        assert!(!fx.blob_store.contains(&fx.store.blob_table, id));
    }

    #[test]
    fn test_activate_and_touch_publish_images() {
        let mut handle = Handle::new(Uid::new());
        let staged_id = handle.allocate_id();
        let payload = HandlesPayload {
            registry_table: "t_r".to_string(),
            blob_table: "t_b".to_string(),
            handles: vec![handle],
        };

        let activated = activate_inactive_nodes(&[payload.clone()]);
        let published = activated[0].handles[0];
        assert_eq!(published.get_active_id(), staged_id);
        assert_eq!(published.version, handle.version + 1);
        assert_eq!(published.work_in_progress_timestamp, 1);

        let mut deleted = handle;
        deleted.is_deleted = true;
        let touched = touch_nodes(&[HandlesPayload {
            handles: vec![deleted],
            ..payload
        }]);
        let finalized = touched[0].handles[0];
        assert!(finalized.is_deleted);
        assert_eq!(finalized.version, deleted.version + 1);
        assert_eq!(finalized.work_in_progress_timestamp, 0);
    }
}
