//! Shared (L2) cache abstraction and distributed lock keys.
//!
//! The shared cache is the sole owner of item and node locks. Every
//! lock write is a set-if-absent with a caller-supplied lock ID;
//! ownership is proven by matching the stored value on read-back
//! (`dual_lock` bundles the write and the verification).
//!
//! Key namespaces are disjoint by prefix: locks are `"L"+uuid`, cached
//! nodes are `"N"+uuid`, cached item values are `"V"+uuid`.

use crate::error::Result;
use crate::types::Uid;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// A distributed lock key plus the caller's claim on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKey {
    /// Formatted cache key (`"L"` + uuid).
    pub key: String,
    /// The ID this caller locks with; ownership means the cache holds
    /// exactly this value under `key`.
    pub lock_id: Uid,
    /// Whether this caller currently owns the lock.
    pub is_lock_owner: bool,
}

impl LockKey {
    /// Create an unowned lock key for a raw key string.
    pub fn new(raw_key: &str, lock_id: Uid) -> Self {
        LockKey {
            key: format_lock_key(raw_key),
            lock_id,
            is_lock_owner: false,
        }
    }
}

/// Format a raw key into the lock namespace.
pub fn format_lock_key(k: &str) -> String {
    format!("L{}", k)
}

/// Format a node's active physical ID into the node cache namespace.
pub fn format_node_key(id: Uid) -> String {
    format!("N{}", id)
}

/// Format an item's ID into the value blob cache namespace.
pub fn format_item_key(id: Uid) -> String {
    format!("V{}", id)
}

/// Create unowned lock keys for a set of raw key strings, all claimed
/// with the same lock ID.
pub fn create_lock_keys(lock_id: Uid, keys: &[String]) -> Vec<LockKey> {
    keys.iter().map(|k| LockKey::new(k, lock_id)).collect()
}

/// Create unowned lock keys for a set of IDs (their string form is the
/// raw key), all claimed with the same lock ID.
pub fn create_lock_keys_for_ids(lock_id: Uid, ids: &[Uid]) -> Vec<LockKey> {
    ids.iter()
        .map(|id| LockKey::new(&id.to_string(), lock_id))
        .collect()
}

/// Shared (L2) cache: byte key/value store with expirations, plus the
/// distributed lock protocol and a server info probe.
///
/// All methods must be safe to call concurrently (`Send + Sync`).
pub trait Cache: Send + Sync {
    /// Store a value, optionally expiring after `expiration`.
    ///
    /// # Errors
    ///
    /// Returns an error when the cache backend fails.
    fn set(&self, key: &str, value: &[u8], expiration: Option<Duration>) -> Result<()>;

    /// Store a value only when the key is absent. Returns whether the
    /// write happened. This is the primitive item lock records are
    /// built on.
    ///
    /// # Errors
    ///
    /// Returns an error when the cache backend fails.
    fn set_if_not_exist(
        &self,
        key: &str,
        value: &[u8],
        expiration: Option<Duration>,
    ) -> Result<bool>;

    /// Fetch a value. `None` when missing or expired.
    ///
    /// # Errors
    ///
    /// Returns an error when the cache backend fails.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Fetch a value and extend its expiration (TTL read).
    ///
    /// # Errors
    ///
    /// Returns an error when the cache backend fails.
    fn get_ex(&self, key: &str, expiration: Duration) -> Result<Option<Vec<u8>>>;

    /// Delete keys. Returns true when at least one existed.
    ///
    /// # Errors
    ///
    /// Returns an error when the cache backend fails.
    fn delete(&self, keys: &[String]) -> Result<bool>;

    /// Liveness probe.
    ///
    /// # Errors
    ///
    /// Returns an error when the cache backend is unreachable.
    fn ping(&self) -> Result<()>;

    /// Drop every entry.
    ///
    /// # Errors
    ///
    /// Returns an error when the cache backend fails.
    fn clear(&self) -> Result<()>;

    /// Server info text for a section. The `"server"` section contains a
    /// `run_id:<X>` line that changes when the cache restarts; the
    /// recovery sweep watches it.
    ///
    /// # Errors
    ///
    /// Returns an error when the cache backend fails.
    fn info(&self, section: &str) -> Result<String>;

    /// Try to take every key in one pass, writing each key's `lock_id`
    /// where the key is absent. Returns `(false, owner)` at the first
    /// key held by someone else; keys taken so far keep
    /// `is_lock_owner = true` and it is the caller's job to unlock them.
    ///
    /// # Errors
    ///
    /// Returns an error when the cache backend fails.
    fn lock(&self, duration: Duration, keys: &mut [LockKey]) -> Result<(bool, Option<Uid>)>;

    /// [`Cache::lock`] followed by a read-back verification of every
    /// key, detecting set-if-absent races. Returns the competing
    /// owner's transaction ID on failure.
    ///
    /// # Errors
    ///
    /// Returns an error when the cache backend fails.
    fn dual_lock(&self, duration: Duration, keys: &mut [LockKey]) -> Result<(bool, Option<Uid>)>;

    /// Whether every key is present and holds this caller's lock ID.
    ///
    /// # Errors
    ///
    /// Returns an error when the cache backend fails.
    fn is_locked(&self, keys: &[LockKey]) -> Result<bool>;

    /// [`Cache::is_locked`] that also extends each entry's expiration.
    ///
    /// # Errors
    ///
    /// Returns an error when the cache backend fails.
    fn is_locked_ttl(&self, duration: Duration, keys: &[LockKey]) -> Result<bool>;

    /// Whether any of the formatted keys is held, by anyone.
    ///
    /// # Errors
    ///
    /// Returns an error when the cache backend fails.
    fn is_locked_by_others(&self, keys: &[String]) -> Result<bool>;

    /// Delete only the keys this caller owns (`is_lock_owner`).
    ///
    /// # Errors
    ///
    /// Returns an error when the cache backend fails.
    fn unlock(&self, keys: &[LockKey]) -> Result<()>;
}

/// Typed convenience layer over the byte-valued [`Cache`], encoding with
/// bincode.
pub trait CacheExt: Cache {
    /// Store a serializable value.
    ///
    /// # Errors
    ///
    /// Returns an error on serialization or backend failure.
    fn set_struct<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expiration: Option<Duration>,
    ) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.set(key, &bytes, expiration)
    }

    /// Fetch and decode a value. `None` when missing.
    ///
    /// # Errors
    ///
    /// Returns an error on deserialization or backend failure.
    fn get_struct<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch and decode a value, extending its expiration.
    ///
    /// # Errors
    ///
    /// Returns an error on deserialization or backend failure.
    fn get_struct_ex<T: DeserializeOwned>(
        &self,
        key: &str,
        expiration: Duration,
    ) -> Result<Option<T>> {
        match self.get_ex(key, expiration)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}
