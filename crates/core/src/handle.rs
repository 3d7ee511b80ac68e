//! Virtual ID handles.
//!
//! A `Handle` maps a logical ID (the ID a B-Tree node keeps for its
//! whole lifetime) to two physical blob IDs: the active one readers
//! resolve, and an inactive slot that a committing transaction stages
//! its update into. Flipping the active slot is the single atomic
//! publish action for an updated node, which is what makes node updates
//! atomic at the registry layer.

use crate::types::{now_millis, Uid};
use serde::{Deserialize, Serialize};

/// How long a staged (inactive) physical ID may sit with a
/// work-in-progress timestamp before another transaction is allowed to
/// reclaim it. Matches the longest commit window a live writer can hold.
pub const DEFAULT_INACTIVE_EXPIRY_MS: i64 = 15 * 60 * 1000;

/// Virtual ID: logical ID plus active/inactive physical IDs, version and
/// deletion metadata.
///
/// Exactly one of `physical_id_a` / `physical_id_b` is "active" at any
/// time. The other slot is either empty (nil) or holds a staged update
/// written by an in-flight transaction, stamped with
/// `work_in_progress_timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handle {
    /// The ID the B-Tree knows the node by. Never changes.
    pub logical_id: Uid,
    /// First physical ID slot.
    pub physical_id_a: Uid,
    /// Second physical ID slot.
    pub physical_id_b: Uid,
    /// True when `physical_id_b` is the active slot.
    pub is_active_id_b: bool,
    /// Version, incremented by exactly one on each committed update.
    pub version: i32,
    /// Marked by a committing remove; finalized in phase two.
    pub is_deleted: bool,
    /// Millisecond timestamp stamped when the inactive slot was
    /// allocated or the handle was marked deleted. Zero when idle.
    pub work_in_progress_timestamp: i64,
}

impl Handle {
    /// Create a handle for a freshly added node.
    ///
    /// The active slot starts out equal to the logical ID, which is the
    /// physical ID the node's first blob is written under.
    pub fn new(logical_id: Uid) -> Self {
        Handle {
            logical_id,
            physical_id_a: logical_id,
            physical_id_b: Uid::NIL,
            is_active_id_b: false,
            version: 0,
            is_deleted: false,
            work_in_progress_timestamp: 0,
        }
    }

    /// The physical ID readers should resolve.
    pub fn get_active_id(&self) -> Uid {
        if self.is_active_id_b {
            self.physical_id_b
        } else {
            self.physical_id_a
        }
    }

    /// The staging slot's physical ID (nil when no update is in flight).
    pub fn get_inactive_id(&self) -> Uid {
        if self.is_active_id_b {
            self.physical_id_a
        } else {
            self.physical_id_b
        }
    }

    /// Fill the inactive slot with a fresh ID and stamp the
    /// work-in-progress timestamp.
    ///
    /// Returns `Uid::NIL` when both slots are occupied, meaning another
    /// writer has an update in flight. Callers observing nil may consult
    /// [`Handle::is_expired_inactive`] and, when the other writer is
    /// provably dead, [`Handle::clear_inactive_id`] and retry once.
    pub fn allocate_id(&mut self) -> Uid {
        if !self.get_inactive_id().is_nil() {
            return Uid::NIL;
        }
        let id = Uid::new();
        if self.is_active_id_b {
            self.physical_id_a = id;
        } else {
            self.physical_id_b = id;
        }
        self.work_in_progress_timestamp = now_millis();
        id
    }

    /// Toggle which slot is active. This is the atomic publish of a
    /// staged node update.
    pub fn flip_active_id(&mut self) {
        self.is_active_id_b = !self.is_active_id_b;
    }

    /// Empty the inactive slot and reset the work-in-progress timestamp.
    pub fn clear_inactive_id(&mut self) {
        if self.is_active_id_b {
            self.physical_id_a = Uid::NIL;
        } else {
            self.physical_id_b = Uid::NIL;
        }
        self.work_in_progress_timestamp = 0;
    }

    /// Whether the work-in-progress timestamp is older than the default
    /// reclaim threshold.
    pub fn is_expired_inactive(&self) -> bool {
        self.is_expired_inactive_at(now_millis(), DEFAULT_INACTIVE_EXPIRY_MS)
    }

    /// Threshold-explicit variant of [`Handle::is_expired_inactive`].
    pub fn is_expired_inactive_at(&self, now_ms: i64, max_age_ms: i64) -> bool {
        self.work_in_progress_timestamp > 0
            && now_ms - self.work_in_progress_timestamp > max_age_ms
    }

    /// Whether the given physical ID occupies either slot.
    pub fn has_id(&self, id: Uid) -> bool {
        self.physical_id_a == id || self.physical_id_b == id
    }

    /// True when neither slot holds a physical ID.
    pub fn is_empty(&self) -> bool {
        self.physical_id_a.is_nil() && self.physical_id_b.is_nil()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_handle_active_is_logical() {
        let id = Uid::new();
        let h = Handle::new(id);
        assert_eq!(h.get_active_id(), id);
        assert!(h.get_inactive_id().is_nil());
        assert_eq!(h.version, 0);
        assert!(!h.is_deleted);
    }

    #[test]
    fn test_allocate_id_fills_inactive_slot() {
        let mut h = Handle::new(Uid::new());
        let staged = h.allocate_id();
        assert!(!staged.is_nil());
        assert_eq!(h.get_inactive_id(), staged);
        assert!(h.work_in_progress_timestamp > 0);
        // Active slot untouched.
        assert_eq!(h.get_active_id(), h.logical_id);
    }

    #[test]
    fn test_allocate_id_returns_nil_when_both_occupied() {
        let mut h = Handle::new(Uid::new());
        assert!(!h.allocate_id().is_nil());
        assert!(h.allocate_id().is_nil());
    }

    #[test]
    fn test_clear_inactive_allows_reallocation() {
        let mut h = Handle::new(Uid::new());
        let first = h.allocate_id();
        h.clear_inactive_id();
        assert_eq!(h.work_in_progress_timestamp, 0);
        let second = h.allocate_id();
        assert!(!second.is_nil());
        assert_ne!(first, second);
    }

    #[test]
    fn test_flip_active_id_publishes_staged_slot() {
        let mut h = Handle::new(Uid::new());
        let staged = h.allocate_id();
        h.flip_active_id();
        assert_eq!(h.get_active_id(), staged);
        assert_eq!(h.get_inactive_id(), h.logical_id);
    }

    #[test]
    fn test_is_expired_inactive_threshold() {
        let mut h = Handle::new(Uid::new());
        assert!(!h.is_expired_inactive_at(now_millis(), 1000));

        h.allocate_id();
        let now = h.work_in_progress_timestamp;
        assert!(!h.is_expired_inactive_at(now + 500, 1000));
        assert!(h.is_expired_inactive_at(now + 1500, 1000));
    }

    #[test]
    fn test_has_id_checks_both_slots() {
        let mut h = Handle::new(Uid::new());
        let staged = h.allocate_id();
        assert!(h.has_id(h.logical_id));
        assert!(h.has_id(staged));
        assert!(!h.has_id(Uid::new()));
    }
}
