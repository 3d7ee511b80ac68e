//! B-Tree node representation.

use serde::{Deserialize, Serialize};
use sop_core::{Item, Uid};

/// A B-Tree node: ordered item slots plus optional child links.
///
/// Nodes refer to children by logical ID only; there are no parent
/// back-pointers. All node loads and stores go through the node
/// repository, which resolves logical IDs to physical blobs via the
/// registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node<K, V> {
    /// Logical ID. Never changes for the lifetime of the node.
    pub id: Uid,
    /// Version, kept in sync with the registry handle's version.
    pub version: i32,
    /// Ordered items.
    pub slots: Vec<Item<K, V>>,
    /// Child logical IDs; `None` for leaves. When present, length is
    /// always `slots.len() + 1`.
    pub children: Option<Vec<Uid>>,
}

impl<K, V> Node<K, V> {
    /// Create an empty leaf with the given logical ID.
    pub fn new(id: Uid) -> Self {
        Node {
            id,
            version: 0,
            slots: Vec::new(),
            children: None,
        }
    }

    /// Whether this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }
}
