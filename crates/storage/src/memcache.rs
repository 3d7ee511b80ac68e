//! In-memory stand-in for the shared (L2) cache.
//!
//! Implements the byte KV surface, per-entry expirations, the
//! distributed lock protocol (set-if-absent with read-back
//! verification) and the `info("server")` probe whose `run_id` line the
//! recovery sweep watches for cache restarts. A single mutex over the
//! entry map makes every lock operation atomic, which is the strongest
//! behavior a real shared cache offers and what the engine assumes.

use parking_lot::Mutex;
use sop_core::{Cache, Error, LockKey, Result, Uid};
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at.map(|t| Instant::now() < t).unwrap_or(true)
    }
}

/// In-memory [`Cache`] implementation.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    run_id: Mutex<String>,
}

impl MemoryCache {
    /// Create an empty cache with a random run ID.
    pub fn new() -> Self {
        MemoryCache {
            entries: Mutex::new(HashMap::new()),
            run_id: Mutex::new(Uid::new().to_string()),
        }
    }

    /// Replace the run ID, simulating a cache restart. All entries are
    /// dropped, exactly as a real restart would drop them.
    pub fn restart(&self, run_id: &str) {
        *self.run_id.lock() = run_id.to_string();
        self.entries.lock().clear();
    }

    /// Set the run ID without dropping entries. Test hook.
    pub fn set_run_id(&self, run_id: &str) {
        *self.run_id.lock() = run_id.to_string();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().values().filter(|e| e.is_live()).count()
    }

    /// Whether no live entry exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str) -> Option<Vec<u8>> {
        match entries.get(key) {
            Some(e) if e.is_live() => Some(e.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn owner_of(value: &[u8]) -> Option<Uid> {
        std::str::from_utf8(value)
            .ok()
            .and_then(Uid::from_string)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for MemoryCache {
    fn set(&self, key: &str, value: &[u8], expiration: Option<Duration>) -> Result<()> {
        let expires_at = expiration
            .filter(|d| !d.is_zero())
            .map(|d| Instant::now() + d);
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    fn set_if_not_exist(
        &self,
        key: &str,
        value: &[u8],
        expiration: Option<Duration>,
    ) -> Result<bool> {
        let mut entries = self.entries.lock();
        if Self::live_value(&mut entries, key).is_some() {
            return Ok(false);
        }
        let expires_at = expiration
            .filter(|d| !d.is_zero())
            .map(|d| Instant::now() + d);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(true)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key))
    }

    fn get_ex(&self, key: &str, expiration: Duration) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock();
        let value = Self::live_value(&mut entries, key);
        if value.is_some() {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = if expiration.is_zero() {
                    None
                } else {
                    Some(Instant::now() + expiration)
                };
            }
        }
        Ok(value)
    }

    fn delete(&self, keys: &[String]) -> Result<bool> {
        let mut entries = self.entries.lock();
        let mut any = false;
        for key in keys {
            any |= entries.remove(key).is_some();
        }
        Ok(any)
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }

    fn info(&self, section: &str) -> Result<String> {
        if section != "server" {
            return Err(Error::Backend(format!("unknown info section: {}", section)));
        }
        Ok(format!(
            "# Server\r\nrun_id:{}\r\nmode:standalone\r\n",
            self.run_id.lock()
        ))
    }

    fn lock(&self, duration: Duration, keys: &mut [LockKey]) -> Result<(bool, Option<Uid>)> {
        let mut entries = self.entries.lock();
        for key in keys.iter_mut() {
            match Self::live_value(&mut entries, &key.key) {
                Some(value) => {
                    let owner = Self::owner_of(&value);
                    if owner == Some(key.lock_id) {
                        key.is_lock_owner = true;
                        continue;
                    }
                    return Ok((false, owner));
                }
                None => {
                    let expires_at = if duration.is_zero() {
                        None
                    } else {
                        Some(Instant::now() + duration)
                    };
                    entries.insert(
                        key.key.clone(),
                        Entry {
                            value: key.lock_id.to_string().into_bytes(),
                            expires_at,
                        },
                    );
                    key.is_lock_owner = true;
                }
            }
        }
        Ok((true, None))
    }

    fn dual_lock(&self, duration: Duration, keys: &mut [LockKey]) -> Result<(bool, Option<Uid>)> {
        let (ok, owner) = self.lock(duration, keys)?;
        if !ok {
            return Ok((false, owner));
        }
        // Read back every key to catch a racing set-if-absent.
        let mut entries = self.entries.lock();
        for key in keys.iter() {
            match Self::live_value(&mut entries, &key.key) {
                Some(value) if Self::owner_of(&value) == Some(key.lock_id) => {}
                Some(value) => return Ok((false, Self::owner_of(&value))),
                None => return Ok((false, None)),
            }
        }
        Ok((true, None))
    }

    fn is_locked(&self, keys: &[LockKey]) -> Result<bool> {
        let mut entries = self.entries.lock();
        for key in keys {
            match Self::live_value(&mut entries, &key.key) {
                Some(value) if Self::owner_of(&value) == Some(key.lock_id) => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn is_locked_ttl(&self, duration: Duration, keys: &[LockKey]) -> Result<bool> {
        let mut entries = self.entries.lock();
        for key in keys {
            match Self::live_value(&mut entries, &key.key) {
                Some(value) if Self::owner_of(&value) == Some(key.lock_id) => {
                    if let Some(entry) = entries.get_mut(&key.key) {
                        entry.expires_at = if duration.is_zero() {
                            None
                        } else {
                            Some(Instant::now() + duration)
                        };
                    }
                }
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn is_locked_by_others(&self, keys: &[String]) -> Result<bool> {
        let mut entries = self.entries.lock();
        for key in keys {
            if Self::live_value(&mut entries, key).is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn unlock(&self, keys: &[LockKey]) -> Result<()> {
        let mut entries = self.entries.lock();
        for key in keys {
            if key.is_lock_owner {
                entries.remove(&key.key);
            }
        }
        Ok(())
    }
}
