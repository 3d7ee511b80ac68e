//! Transaction-bound B-Tree.
//!
//! The tree is deliberately plain: ordered slots per node, child links
//! by logical ID, split on overflow, no eager rebalance on removal.
//! What makes it interesting is that every node it touches flows
//! through the transaction's node repository and every item through the
//! item action tracker, so the two-phase commit sees the full intent of
//! the session.
//!
//! The cursor is a root-to-item path. Ancestor entries record the child
//! index taken; the last entry records the slot index of the current
//! item. Successor navigation works off that path alone, since nodes
//! carry no parent pointers.

pub mod node;

use crate::backend::SessionBackend;
use crate::item_tracker::{ItemAction, ItemActionTracker};
use crate::node_repository::{Classified, NodeRepository};
use crate::transaction::Transaction;
use node::Node;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sop_core::{Error, Item, Result, StoreInfo, StoreOptions, StoreRepository, Uid};
use std::sync::Arc;

/// Create a B-Tree store (or open it when it already exists with
/// compatible options) and bind it to the transaction.
///
/// # Errors
///
/// Returns a configuration error when the transaction is not active,
/// when an existing store's options are incompatible, or when a
/// read-only transaction asks for a store that does not exist.
pub fn new_btree<K, V>(options: StoreOptions, transaction: &Transaction) -> Result<Btree<K, V>>
where
    K: Ord + Clone + Serialize + DeserializeOwned + Send + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    transaction.ensure_active()?;
    let repository = transaction.store_repository();
    let existing = repository.get(&[options.name.clone()])?;
    let store = match existing.into_iter().next() {
        Some(store) => {
            if !store.is_compatible_with(&options) {
                return Err(Error::Config(format!(
                    "store {} exists with incompatible options",
                    options.name
                )));
            }
            store
        }
        None => {
            if !transaction.is_for_writing() {
                return Err(Error::NotFound(format!(
                    "store {} does not exist",
                    options.name
                )));
            }
            let store = StoreInfo::new(options)?;
            repository.add(vec![store.clone()])?;
            store
        }
    };
    Ok(bind(store, transaction))
}

/// Open an existing B-Tree store and bind it to the transaction.
///
/// # Errors
///
/// Returns `NotFound` when no store goes by that name.
pub fn open_btree<K, V>(name: &str, transaction: &Transaction) -> Result<Btree<K, V>>
where
    K: Ord + Clone + Serialize + DeserializeOwned + Send + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    transaction.ensure_active()?;
    let repository = transaction.store_repository();
    let store = repository
        .get(&[name.to_string()])?
        .into_iter()
        .next()
        .ok_or_else(|| Error::NotFound(format!("store {} does not exist", name)))?;
    Ok(bind(store, transaction))
}

fn bind<K, V>(store: StoreInfo, transaction: &Transaction) -> Btree<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned + Send + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    let repo = NodeRepository::new(
        transaction.registry(),
        transaction.blob_store(),
        transaction.cache(),
        store.count,
    );
    let tracker = ItemActionTracker::new(
        transaction.blob_store(),
        transaction.cache(),
        transaction.logger(),
    );
    let inner = Arc::new(Mutex::new(BtreeInner {
        store,
        repo,
        tracker,
        store_repository: transaction.store_repository(),
        cursor: None,
        classified: None,
    }));
    transaction.register_backend(Arc::new(SessionBackend::new(inner.clone())));
    Btree {
        inner,
        transaction: transaction.clone(),
    }
}

/// A B-Tree bound to one transaction. All mutations become part of that
/// transaction's commit.
pub struct Btree<K, V> {
    inner: Arc<Mutex<BtreeInner<K, V>>>,
    transaction: Transaction,
}

impl<K, V> std::fmt::Debug for Btree<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Btree").finish_non_exhaustive()
    }
}

impl<K, V> Btree<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned + Send + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    /// Add a key/value pair. Returns false when the store is unique and
    /// the key already exists.
    pub fn add(&self, key: K, value: V) -> Result<bool> {
        self.transaction.ensure_active()?;
        self.inner.lock().add(key, value)
    }

    /// Position the cursor on the first item with this key.
    pub fn find(&self, key: &K) -> Result<bool> {
        self.transaction.ensure_active()?;
        self.inner.lock().find(key)
    }

    /// Position the cursor on the item with this key and ID (walks
    /// duplicates).
    pub fn find_with_id(&self, key: &K, id: Uid) -> Result<bool> {
        self.transaction.ensure_active()?;
        self.inner.lock().find_with_id(key, id)
    }

    /// The current item's value, fetched from the value segment when
    /// needed.
    pub fn get_current_value(&self) -> Result<Option<V>> {
        self.transaction.ensure_active()?;
        self.inner.lock().get_current_value()
    }

    /// The current item's key.
    pub fn get_current_key(&self) -> Result<Option<K>> {
        self.transaction.ensure_active()?;
        self.inner.lock().get_current_key()
    }

    /// The current item as stored in the node (value not hydrated).
    pub fn get_current_item(&self) -> Result<Option<Item<K, V>>> {
        self.transaction.ensure_active()?;
        self.inner.lock().current_item()
    }

    /// Find and update in one call.
    pub fn update(&self, key: &K, value: V) -> Result<bool> {
        self.transaction.ensure_active()?;
        let mut inner = self.inner.lock();
        if !inner.find(key)? {
            return Ok(false);
        }
        inner.update_current_item(value)
    }

    /// Replace the current item's value.
    pub fn update_current_item(&self, value: V) -> Result<bool> {
        self.transaction.ensure_active()?;
        self.inner.lock().update_current_item(value)
    }

    /// Find and remove in one call.
    pub fn remove(&self, key: &K) -> Result<bool> {
        self.transaction.ensure_active()?;
        let mut inner = self.inner.lock();
        if !inner.find(key)? {
            return Ok(false);
        }
        inner.remove_current_item()
    }

    /// Remove the item the cursor is on.
    pub fn remove_current_item(&self) -> Result<bool> {
        self.transaction.ensure_active()?;
        self.inner.lock().remove_current_item()
    }

    /// Position the cursor on the smallest key.
    pub fn first(&self) -> Result<bool> {
        self.transaction.ensure_active()?;
        self.inner.lock().first()
    }

    /// Advance the cursor to the in-order successor.
    pub fn next(&self) -> Result<bool> {
        self.transaction.ensure_active()?;
        self.inner.lock().next()
    }

    /// Item count as seen by this transaction.
    pub fn count(&self) -> i64 {
        self.inner.lock().store.count
    }

    /// The store's name.
    pub fn name(&self) -> String {
        self.inner.lock().store.name.clone()
    }
}

/// The tree state shared between the user-facing handle and the
/// transaction's commit backend.
pub(crate) struct BtreeInner<K, V> {
    pub store: StoreInfo,
    pub repo: NodeRepository<K, V>,
    pub tracker: ItemActionTracker<K, V>,
    pub store_repository: Arc<dyn StoreRepository>,
    /// Root-to-item path: ancestor entries hold the child index taken,
    /// the last entry holds the current slot index.
    cursor: Option<Vec<(Uid, usize)>>,
    pub classified: Option<Classified<K, V>>,
}

impl<K, V> BtreeInner<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    fn node(&mut self, id: Uid) -> Result<Option<Node<K, V>>> {
        self.repo.get(&self.store, id)
    }

    /// The in-node representation: separate-segment stores keep values
    /// out of the node bytes.
    fn node_item(&self, item: &Item<K, V>) -> Item<K, V> {
        if self.store.is_value_data_in_node_segment {
            item.clone()
        } else {
            Item {
                id: item.id,
                key: item.key.clone(),
                value: None,
                version: item.version,
                value_needs_fetch: true,
            }
        }
    }

    pub fn add(&mut self, key: K, value: V) -> Result<bool> {
        if self.store.is_unique && self.find(&key)? {
            self.cursor = None;
            return Ok(false);
        }
        let mut item = Item::new(key, value);
        self.tracker.add(&self.store, &mut item)?;
        self.insert_into_tree(item)?;
        self.store.count += 1;
        self.cursor = None;
        Ok(true)
    }

    /// Insert an item preserving its identity, without touching the
    /// tracker. Used by the refetch-and-merge replay.
    pub fn add_item(&mut self, item: Item<K, V>) -> Result<bool> {
        if self.store.is_unique && self.find(&item.key)? {
            self.cursor = None;
            return Ok(false);
        }
        self.insert_into_tree(item)?;
        self.store.count += 1;
        self.cursor = None;
        Ok(true)
    }

    fn insert_into_tree(&mut self, item: Item<K, V>) -> Result<()> {
        let stripped = self.node_item(&item);
        let root_id = self.store.root_node_id;
        let Some(mut node) = self.node(root_id)? else {
            let mut root = Node::new(root_id);
            root.slots.push(stripped);
            self.repo.add(root);
            return Ok(());
        };

        // Descend to the leaf, remembering the path for splits.
        let mut path: Vec<(Node<K, V>, usize)> = Vec::new();
        let mut pos;
        loop {
            pos = node.slots.partition_point(|it| it.key <= item.key);
            match &node.children {
                Some(children) => {
                    let child_id = children[pos];
                    let child = self.node(child_id)?.ok_or_else(|| {
                        Error::NotFound(format!("child node {} unresolvable", child_id))
                    })?;
                    path.push((node, pos));
                    node = child;
                }
                None => break,
            }
        }
        node.slots.insert(pos, stripped);
        self.repo.update(node.clone());

        // Split upward while any node on the path overflows.
        while node.slots.len() > self.store.slot_length {
            let mid = node.slots.len() / 2;
            let right_slots = node.slots.split_off(mid + 1);
            let median = node.slots.pop().expect("split point exists");
            let mut right = Node::new(Uid::new());
            right.slots = right_slots;
            if let Some(children) = &mut node.children {
                right.children = Some(children.split_off(mid + 1));
            }
            self.repo.update(node.clone());
            self.repo.add(right.clone());

            match path.pop() {
                Some((mut parent, child_idx)) => {
                    parent.slots.insert(child_idx, median);
                    parent
                        .children
                        .as_mut()
                        .expect("parent is internal")
                        .insert(child_idx + 1, right.id);
                    self.repo.update(parent.clone());
                    node = parent;
                }
                None => {
                    let mut new_root = Node::new(Uid::new());
                    new_root.slots = vec![median];
                    new_root.children = Some(vec![node.id, right.id]);
                    self.store.root_node_id = new_root.id;
                    self.repo.add(new_root);
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn find(&mut self, key: &K) -> Result<bool> {
        self.cursor = None;
        let mut path: Vec<(Uid, usize)> = Vec::new();
        let mut best: Option<Vec<(Uid, usize)>> = None;
        let mut node_id = self.store.root_node_id;
        loop {
            let Some(node) = self.node(node_id)? else {
                break;
            };
            let idx = node.slots.partition_point(|it| it.key < *key);
            if idx < node.slots.len() && node.slots[idx].key == *key {
                let mut found = path.clone();
                found.push((node_id, idx));
                // Deeper hits are further left for equal keys; the last
                // assignment wins.
                best = Some(found);
            }
            match &node.children {
                Some(children) => {
                    path.push((node_id, idx));
                    node_id = children[idx];
                }
                None => break,
            }
        }
        match best {
            Some(found) => {
                let (nid, _) = *found.last().expect("path is never empty");
                self.repo.fetched(nid);
                self.cursor = Some(found);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn find_with_id(&mut self, key: &K, id: Uid) -> Result<bool> {
        if !self.find(key)? {
            return Ok(false);
        }
        loop {
            let Some(item) = self.current_item()? else {
                return Ok(false);
            };
            if item.key != *key {
                self.cursor = None;
                return Ok(false);
            }
            if item.id == id {
                return Ok(true);
            }
            if !self.next()? {
                return Ok(false);
            }
        }
    }

    pub fn first(&mut self) -> Result<bool> {
        self.cursor = None;
        let root_id = self.store.root_node_id;
        let mut path = Vec::new();
        if self.leftmost_in_subtree(root_id, &mut path)? {
            self.mark_cursor(path);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn next(&mut self) -> Result<bool> {
        let Some(mut path) = self.cursor.take() else {
            return Ok(false);
        };
        let (nid, slot) = *path.last().expect("cursor path is never empty");
        let Some(node) = self.node(nid)? else {
            return Ok(false);
        };
        match &node.children {
            Some(children) => {
                // Successor lives in the subtree right of the slot, or
                // failing that, it is a later slot found while
                // ascending.
                *path.last_mut().expect("non-empty") = (nid, slot + 1);
                let child = children[slot + 1];
                if self.leftmost_in_subtree(child, &mut path)? {
                    self.mark_cursor(path);
                    return Ok(true);
                }
            }
            None => {
                if slot + 1 < node.slots.len() {
                    *path.last_mut().expect("non-empty") = (nid, slot + 1);
                    self.mark_cursor(path);
                    return Ok(true);
                }
                path.pop();
            }
        }
        // Ascend: each remaining entry is (parent, child index taken);
        // slot c of the parent is the next item after child c.
        loop {
            let Some(&(pnid, c)) = path.last() else {
                self.cursor = None;
                return Ok(false);
            };
            let parent = self
                .node(pnid)?
                .ok_or_else(|| Error::NotFound(format!("node {} unresolvable", pnid)))?;
            if c < parent.slots.len() {
                self.mark_cursor(path);
                return Ok(true);
            }
            path.pop();
        }
    }

    /// Find the leftmost item of a subtree, appending path entries.
    /// Skips nodes emptied by removals. Leaves `path` unchanged when
    /// the subtree holds no items.
    fn leftmost_in_subtree(&mut self, node_id: Uid, path: &mut Vec<(Uid, usize)>) -> Result<bool> {
        let Some(node) = self.node(node_id)? else {
            return Ok(false);
        };
        match &node.children {
            Some(children) => {
                let children = children.clone();
                for (i, child) in children.iter().enumerate() {
                    path.push((node_id, i));
                    if self.leftmost_in_subtree(*child, path)? {
                        return Ok(true);
                    }
                    path.pop();
                    if i < node.slots.len() {
                        path.push((node_id, i));
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            None => {
                if node.slots.is_empty() {
                    return Ok(false);
                }
                path.push((node_id, 0));
                Ok(true)
            }
        }
    }

    fn mark_cursor(&mut self, path: Vec<(Uid, usize)>) {
        if let Some(&(nid, _)) = path.last() {
            self.repo.fetched(nid);
        }
        self.cursor = Some(path);
    }

    pub fn current_item(&mut self) -> Result<Option<Item<K, V>>> {
        let Some(path) = self.cursor.clone() else {
            return Ok(None);
        };
        let (nid, slot) = *path.last().expect("cursor path is never empty");
        let Some(node) = self.node(nid)? else {
            return Ok(None);
        };
        Ok(node.slots.get(slot).cloned())
    }

    pub fn get_current_key(&mut self) -> Result<Option<K>> {
        Ok(self.current_item()?.map(|item| item.key))
    }

    pub fn get_current_value(&mut self) -> Result<Option<V>> {
        let Some(mut item) = self.current_item()? else {
            return Ok(None);
        };
        self.tracker.get(&self.store, &mut item)?;
        Ok(item.value)
    }

    pub fn update_current_item(&mut self, value: V) -> Result<bool> {
        let Some(mut item) = self.current_item()? else {
            return Ok(false);
        };
        item.value = Some(value);
        item.value_needs_fetch = false;
        self.tracker.update(&self.store, &mut item)?;
        self.write_current_item(&item)
    }

    /// Replace the current slot with an already-tracked item
    /// (refetch-and-merge).
    pub fn update_current_node_item(&mut self, item: Item<K, V>) -> Result<bool> {
        self.write_current_item(&item)
    }

    fn write_current_item(&mut self, item: &Item<K, V>) -> Result<bool> {
        let Some(path) = self.cursor.clone() else {
            return Ok(false);
        };
        let (nid, slot) = *path.last().expect("cursor path is never empty");
        let Some(mut node) = self.node(nid)? else {
            return Ok(false);
        };
        if slot >= node.slots.len() {
            return Ok(false);
        }
        node.slots[slot] = self.node_item(item);
        self.repo.update(node);
        Ok(true)
    }

    pub fn remove_current_item(&mut self) -> Result<bool> {
        let Some(path) = self.cursor.take() else {
            return Ok(false);
        };
        let (nid, slot) = *path.last().expect("cursor path is never empty");
        let Some(mut node) = self.node(nid)? else {
            return Ok(false);
        };
        let Some(item) = node.slots.get(slot).cloned() else {
            return Ok(false);
        };
        self.tracker.remove(&self.store, &item)?;

        if node.is_leaf() {
            node.slots.remove(slot);
            self.repo.update(node);
        } else {
            let children = node.children.clone().expect("internal node");
            if let Some(successor) = self.take_edge_item(children[slot + 1], true)? {
                node.slots[slot] = successor;
                self.repo.update(node);
            } else if let Some(predecessor) = self.take_edge_item(children[slot], false)? {
                node.slots[slot] = predecessor;
                self.repo.update(node);
            } else {
                // Both adjacent subtrees are empty; collapse the slot
                // and retire the right subtree.
                self.remove_subtree(children[slot + 1])?;
                node.slots.remove(slot);
                node.children
                    .as_mut()
                    .expect("internal node")
                    .remove(slot + 1);
                self.repo.update(node);
            }
        }
        self.store.count -= 1;
        Ok(true)
    }

    /// Take the edge item (leftmost or rightmost) from a subtree's edge
    /// leaf. Returns `None` when the edge leaf has been emptied by
    /// earlier removals.
    fn take_edge_item(&mut self, subtree: Uid, leftmost: bool) -> Result<Option<Item<K, V>>> {
        let mut node_id = subtree;
        loop {
            let Some(mut node) = self.node(node_id)? else {
                return Ok(None);
            };
            match &node.children {
                Some(children) => {
                    node_id = if leftmost {
                        children[0]
                    } else {
                        *children.last().expect("children are never empty")
                    };
                }
                None => {
                    if node.slots.is_empty() {
                        return Ok(None);
                    }
                    let item = if leftmost {
                        node.slots.remove(0)
                    } else {
                        node.slots.pop().expect("slots are not empty")
                    };
                    self.repo.update(node);
                    return Ok(Some(item));
                }
            }
        }
    }

    fn remove_subtree(&mut self, node_id: Uid) -> Result<()> {
        let mut stack = vec![node_id];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.node(id)? {
                if let Some(children) = &node.children {
                    stack.extend(children.iter().copied());
                }
            }
            self.repo.remove(id);
        }
        Ok(())
    }

    /// Whether every node the cursor relied on still has its registry
    /// version (read-mode commit validation).
    pub fn fetched_nodes_intact(&mut self) -> Result<bool> {
        let classified = self.repo.classify(&self.store);
        self.repo
            .are_fetched_items_intact(&self.store, &classified.fetched)
    }

    /// Discard local caches, re-read the store, and replay this
    /// transaction's intent against the fresh view.
    pub fn refetch_and_merge(&mut self) -> Result<()> {
        let snapshot = self.tracker.take_state();
        self.repo.clear();
        self.cursor = None;
        self.classified = None;

        let cfg = self.store.cache_config;
        let fresh = self
            .store_repository
            .get_with_ttl(
                cfg.is_store_info_cache_ttl,
                cfg.store_info_cache_duration,
                &[self.store.name.clone()],
            )?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("store {} disappeared", self.store.name)))?;
        self.store.root_node_id = fresh.root_node_id;
        self.store.count = fresh.count;
        self.store.timestamp = fresh.timestamp;
        self.repo.count_at_open = fresh.count;

        let separate = !self.store.is_value_data_in_node_segment;
        for (old_id, record) in snapshot {
            match record.action {
                ItemAction::Add => {
                    if separate {
                        let item = record.item.clone();
                        if !self.add_item(item)? {
                            return Err(Error::conflict("failed to add item"));
                        }
                        self.tracker.insert_record(record.item.id, record);
                    } else {
                        let key = record.item.key.clone();
                        let value = record
                            .item
                            .value
                            .clone()
                            .ok_or_else(|| Error::conflict("added item lost its value"))?;
                        if !self.add(key, value)? {
                            return Err(Error::conflict("failed to add item"));
                        }
                    }
                }
                _ => {
                    if !self.find_with_id(&record.item.key, old_id)? {
                        return Err(Error::conflict("failed to find item"));
                    }
                    let current = self
                        .current_item()?
                        .ok_or_else(|| Error::conflict("failed to find item"))?;
                    if current.version != record.version_in_db {
                        return Err(Error::conflict("newer version detected"));
                    }
                    match record.action {
                        ItemAction::Get => {
                            let mut replayed = record;
                            replayed.item = current;
                            self.tracker.insert_record(old_id, replayed);
                        }
                        ItemAction::Remove => {
                            self.remove_current_item()?;
                        }
                        ItemAction::Update => {
                            if separate {
                                self.tracker.queue_for_deletion(current.id);
                                let mut replayed = record;
                                replayed.version_in_db = current.version;
                                let item = replayed.item.clone();
                                self.tracker.insert_record(item.id, replayed);
                                self.update_current_node_item(item)?;
                            } else {
                                let value = record
                                    .item
                                    .value
                                    .clone()
                                    .ok_or_else(|| Error::conflict("updated item lost its value"))?;
                                self.update_current_item(value)?;
                            }
                        }
                        ItemAction::Add => unreachable!("handled above"),
                    }
                }
            }
        }
        Ok(())
    }

}
