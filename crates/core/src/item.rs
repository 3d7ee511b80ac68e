//! Key/value items managed inside B-Tree nodes.

use crate::types::Uid;
use serde::{Deserialize, Serialize};

/// A key/value pair stored in a B-Tree node slot.
///
/// When a store keeps values in a separate segment, the in-node copy
/// carries `value: None` and `value_needs_fetch: true`; the item's `id`
/// doubles as the value blob's ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item<K, V> {
    /// Item identity; also the value blob ID for separate-segment
    /// stores.
    pub id: Uid,
    /// Ordering key.
    pub key: K,
    /// The value, when materialized.
    pub value: Option<V>,
    /// Version, used for optimistic conflict detection.
    pub version: i32,
    /// True when the value lives in the value segment and has not been
    /// fetched into `value` yet.
    pub value_needs_fetch: bool,
}

impl<K, V> Item<K, V> {
    /// Create a fresh item with a new ID and version zero.
    pub fn new(key: K, value: V) -> Self {
        Item {
            id: Uid::new(),
            key,
            value: Some(value),
            version: 0,
            value_needs_fetch: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_item_defaults() {
        let item = Item::new("k", 7);
        assert!(!item.id.is_nil());
        assert_eq!(item.value, Some(7));
        assert_eq!(item.version, 0);
        assert!(!item.value_needs_fetch);
    }
}
