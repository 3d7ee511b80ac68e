//! B-Tree store metadata.
//!
//! `StoreOptions` is what callers hand to `new_btree`; `StoreInfo` is
//! the persisted record the store repository keeps, including the
//! physical table names and the root node's logical ID. `CacheConfig`
//! carries the per-store cache durations and TTL flags the engine
//! applies when it mirrors registry handles, nodes, store info and
//! value blobs into the caches.

use crate::error::{Error, Result};
use crate::types::{now_millis, Uid};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Floor applied to every non-zero cache duration. Durations below this
/// are silently raised by the [`StoreInfo`] constructor.
pub const MIN_CACHE_DURATION: Duration = Duration::from_secs(15 * 60);

/// Per-store cache durations and TTL-extension flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long registry handles stay cached.
    pub registry_cache_duration: Duration,
    /// How long node blobs stay cached.
    pub node_cache_duration: Duration,
    /// How long store info records stay cached.
    pub store_info_cache_duration: Duration,
    /// How long item value blobs stay cached.
    pub value_data_cache_duration: Duration,
    /// Extend the registry cache entry's TTL on read.
    pub is_registry_cache_ttl: bool,
    /// Extend the node cache entry's TTL on read.
    pub is_node_cache_ttl: bool,
    /// Extend the store info cache entry's TTL on read.
    pub is_store_info_cache_ttl: bool,
    /// Extend the value data cache entry's TTL on read.
    pub is_value_data_cache_ttl: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            registry_cache_duration: MIN_CACHE_DURATION,
            node_cache_duration: Duration::from_secs(60 * 60),
            store_info_cache_duration: MIN_CACHE_DURATION,
            value_data_cache_duration: MIN_CACHE_DURATION,
            is_registry_cache_ttl: false,
            is_node_cache_ttl: false,
            is_store_info_cache_ttl: false,
            is_value_data_cache_ttl: false,
        }
    }
}

impl CacheConfig {
    /// Raise every non-zero duration below the floor up to
    /// [`MIN_CACHE_DURATION`]. Zero durations are left alone (zero means
    /// "do not cache").
    pub fn enforce_minimums(&mut self) {
        for d in [
            &mut self.registry_cache_duration,
            &mut self.node_cache_duration,
            &mut self.store_info_cache_duration,
            &mut self.value_data_cache_duration,
        ] {
            if !d.is_zero() && *d < MIN_CACHE_DURATION {
                *d = MIN_CACHE_DURATION;
            }
        }
    }
}

/// Options recognized when creating a B-Tree store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Store name. Required, non-empty, unique per repository.
    pub name: String,
    /// Number of item slots per node. Required, greater than zero.
    pub slot_length: usize,
    /// Reject adds of a key that already exists.
    pub is_unique: bool,
    /// Keep item values inline in the node segment. When false, values
    /// live in their own blobs and nodes only carry value IDs.
    pub is_value_data_in_node_segment: bool,
    /// Persist value blobs eagerly on add/update instead of at commit.
    pub is_value_data_actively_persisted: bool,
    /// Mirror value blobs into the shared cache.
    pub is_value_data_globally_cached: bool,
    /// Balance leaf occupancy on add. Accepted and recorded; balancing
    /// beyond node splitting is a B-Tree concern.
    pub leaf_load_balancing: bool,
    /// Free-form description.
    pub description: String,
    /// Cache durations; defaults applied when omitted.
    pub cache_config: Option<CacheConfig>,
}

impl StoreOptions {
    /// Convenience constructor with the common flags.
    pub fn new(name: &str, slot_length: usize, is_unique: bool, in_node_segment: bool) -> Self {
        StoreOptions {
            name: name.to_string(),
            slot_length,
            is_unique,
            is_value_data_in_node_segment: in_node_segment,
            is_value_data_actively_persisted: false,
            is_value_data_globally_cached: false,
            leaf_load_balancing: false,
            description: String::new(),
            cache_config: None,
        }
    }
}

/// Persisted description of a B-Tree store: identity, physical layout
/// and counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreInfo {
    /// Store name, unique per repository.
    pub name: String,
    /// Number of item slots per node.
    pub slot_length: usize,
    /// Reject duplicate keys on add.
    pub is_unique: bool,
    /// Free-form description.
    pub description: String,
    /// Registry (handle) table backing this store.
    pub registry_table: String,
    /// Blob table backing this store.
    pub blob_table: String,
    /// Logical ID of the root node.
    pub root_node_id: Uid,
    /// Total item count as of the last commit.
    pub count: i64,
    /// In-flight count adjustment; reconciled by the store repository on
    /// update (folded into `count`, then zeroed).
    pub count_delta: i64,
    /// Millisecond timestamp of the last update.
    pub timestamp: i64,
    /// Values inline in nodes (true) or in their own blob segment.
    pub is_value_data_in_node_segment: bool,
    /// Value blobs written eagerly on add/update.
    pub is_value_data_actively_persisted: bool,
    /// Value blobs mirrored into the shared cache.
    pub is_value_data_globally_cached: bool,
    /// Leaf load balancing requested at creation.
    pub leaf_load_balancing: bool,
    /// Cache durations and TTL flags.
    pub cache_config: CacheConfig,
}

impl StoreInfo {
    /// Build the persisted store record from creation options.
    ///
    /// Derives the registry and blob table names from the store name,
    /// assigns a fresh root node ID and applies the cache duration
    /// floor.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the name is empty or the slot
    /// length is zero.
    pub fn new(options: StoreOptions) -> Result<Self> {
        if options.name.is_empty() {
            return Err(Error::Config("store name cannot be empty".to_string()));
        }
        if options.slot_length == 0 {
            return Err(Error::Config(format!(
                "store {} has zero slot length",
                options.name
            )));
        }
        let mut cache_config = options.cache_config.unwrap_or_default();
        cache_config.enforce_minimums();
        Ok(StoreInfo {
            registry_table: format!("{}_r", options.name),
            blob_table: format!("{}_b", options.name),
            name: options.name,
            slot_length: options.slot_length,
            is_unique: options.is_unique,
            description: options.description,
            root_node_id: Uid::new(),
            count: 0,
            count_delta: 0,
            timestamp: now_millis(),
            is_value_data_in_node_segment: options.is_value_data_in_node_segment,
            is_value_data_actively_persisted: options.is_value_data_actively_persisted,
            is_value_data_globally_cached: options.is_value_data_globally_cached,
            leaf_load_balancing: options.leaf_load_balancing,
            cache_config,
        })
    }

    /// Whether an existing store's structural options match the ones a
    /// caller is (re-)opening it with.
    pub fn is_compatible_with(&self, options: &StoreOptions) -> bool {
        self.slot_length == options.slot_length
            && self.is_unique == options.is_unique
            && self.is_value_data_in_node_segment == options.is_value_data_in_node_segment
            && self.is_value_data_actively_persisted == options.is_value_data_actively_persisted
            && self.is_value_data_globally_cached == options.is_value_data_globally_cached
    }

    /// True when the store has never stored an item.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_info_derives_table_names() {
        let si = StoreInfo::new(StoreOptions::new("persondb", 100, false, true)).unwrap();
        assert_eq!(si.registry_table, "persondb_r");
        assert_eq!(si.blob_table, "persondb_b");
        assert!(!si.root_node_id.is_nil());
        assert_eq!(si.count, 0);
    }

    #[test]
    fn test_store_info_rejects_empty_name() {
        let err = StoreInfo::new(StoreOptions::new("", 100, false, true)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_store_info_rejects_zero_slot_length() {
        let err = StoreInfo::new(StoreOptions::new("s", 0, false, true)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_cache_duration_floor_applied() {
        let mut opts = StoreOptions::new("s", 10, false, true);
        opts.cache_config = Some(CacheConfig {
            registry_cache_duration: Duration::from_secs(60),
            node_cache_duration: Duration::ZERO,
            store_info_cache_duration: Duration::from_secs(3600),
            value_data_cache_duration: Duration::from_secs(1),
            ..CacheConfig::default()
        });
        let si = StoreInfo::new(opts).unwrap();
        assert_eq!(si.cache_config.registry_cache_duration, MIN_CACHE_DURATION);
        // Zero means "do not cache" and is preserved.
        assert_eq!(si.cache_config.node_cache_duration, Duration::ZERO);
        assert_eq!(
            si.cache_config.store_info_cache_duration,
            Duration::from_secs(3600)
        );
        assert_eq!(
            si.cache_config.value_data_cache_duration,
            MIN_CACHE_DURATION
        );
    }

    #[test]
    fn test_compatibility_check() {
        let opts = StoreOptions::new("s", 10, true, false);
        let si = StoreInfo::new(opts.clone()).unwrap();
        assert!(si.is_compatible_with(&opts));

        let mut other = opts;
        other.is_unique = false;
        assert!(!si.is_compatible_with(&other));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_floored_durations_are_zero_or_above_minimum(secs in 0u64..7200) {
                let mut cfg = CacheConfig {
                    node_cache_duration: Duration::from_secs(secs),
                    ..CacheConfig::default()
                };
                cfg.enforce_minimums();
                prop_assert!(
                    cfg.node_cache_duration.is_zero()
                        || cfg.node_cache_duration >= MIN_CACHE_DURATION
                );
            }
        }
    }

    #[test]
    fn test_store_info_round_trip_keeps_delta() {
        let mut si = StoreInfo::new(StoreOptions::new("s", 10, false, true)).unwrap();
        si.count_delta = 42;
        let bytes = bincode::serialize(&si).unwrap();
        let back: StoreInfo = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, si);
    }
}
