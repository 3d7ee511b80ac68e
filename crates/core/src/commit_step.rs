//! Commit step enumeration for the transaction write-ahead log.
//!
//! Discriminants are part of the on-disk/wire contract and must never
//! change: recovery replays logs written by other (possibly older)
//! processes.

use serde::{Deserialize, Serialize};

/// A step in the two-phase commit protocol, logged ahead of the action
/// it describes so a dead transaction can be deterministically replayed
/// or undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum CommitStep {
    /// Placeholder for unrecognized step values.
    Unknown = 0,
    /// Tracked item locks are about to be taken.
    LockTrackedItems = 1,
    /// Item value blobs are about to be persisted.
    CommitTrackedItemsValues = 2,
    /// New root node handles are about to be registered.
    CommitNewRootNodes = 3,
    /// Fetched node versions are about to be validated.
    AreFetchedItemsIntact = 4,
    /// Updated node blobs are about to be staged into inactive slots.
    CommitUpdatedNodes = 5,
    /// Removed node handles are about to be marked deleted.
    CommitRemovedNodes = 6,
    /// Added node handles are about to be registered.
    CommitAddedNodes = 7,
    /// Store counters are about to be reconciled.
    CommitStoreInfo = 8,
    /// All staging done; phase two not yet started.
    BeforeFinalize = 9,
    /// Phase two: registry publish and cleanup are about to run.
    FinalizeCommit = 10,
    /// Obsolete node blobs are about to be deleted.
    DeleteObsoleteEntries = 11,
    /// Obsolete item value blobs are about to be deleted.
    DeleteTrackedItemsValues = 12,
    /// Registry handle changes about to be applied; routed to the
    /// priority log for fast-path recovery.
    CommitUpdatedAndRemovedHandles = 77,
    /// Pre-commit record of an eagerly persisted item value blob.
    AddActivelyPersistedItem = 99,
}

impl CommitStep {
    /// Numeric form, as stored in logs.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Parse the numeric form; unrecognized values map to `Unknown`.
    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => CommitStep::LockTrackedItems,
            2 => CommitStep::CommitTrackedItemsValues,
            3 => CommitStep::CommitNewRootNodes,
            4 => CommitStep::AreFetchedItemsIntact,
            5 => CommitStep::CommitUpdatedNodes,
            6 => CommitStep::CommitRemovedNodes,
            7 => CommitStep::CommitAddedNodes,
            8 => CommitStep::CommitStoreInfo,
            9 => CommitStep::BeforeFinalize,
            10 => CommitStep::FinalizeCommit,
            11 => CommitStep::DeleteObsoleteEntries,
            12 => CommitStep::DeleteTrackedItemsValues,
            77 => CommitStep::CommitUpdatedAndRemovedHandles,
            99 => CommitStep::AddActivelyPersistedItem,
            _ => CommitStep::Unknown,
        }
    }
}

// Ordering follows the numeric protocol order, not declaration order.
impl PartialOrd for CommitStep {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CommitStep {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_i32().cmp(&other.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discriminants_are_bit_exact() {
        assert_eq!(CommitStep::Unknown.as_i32(), 0);
        assert_eq!(CommitStep::LockTrackedItems.as_i32(), 1);
        assert_eq!(CommitStep::CommitTrackedItemsValues.as_i32(), 2);
        assert_eq!(CommitStep::CommitNewRootNodes.as_i32(), 3);
        assert_eq!(CommitStep::AreFetchedItemsIntact.as_i32(), 4);
        assert_eq!(CommitStep::CommitUpdatedNodes.as_i32(), 5);
        assert_eq!(CommitStep::CommitRemovedNodes.as_i32(), 6);
        assert_eq!(CommitStep::CommitAddedNodes.as_i32(), 7);
        assert_eq!(CommitStep::CommitStoreInfo.as_i32(), 8);
        assert_eq!(CommitStep::BeforeFinalize.as_i32(), 9);
        assert_eq!(CommitStep::FinalizeCommit.as_i32(), 10);
        assert_eq!(CommitStep::DeleteObsoleteEntries.as_i32(), 11);
        assert_eq!(CommitStep::DeleteTrackedItemsValues.as_i32(), 12);
        assert_eq!(CommitStep::CommitUpdatedAndRemovedHandles.as_i32(), 77);
        assert_eq!(CommitStep::AddActivelyPersistedItem.as_i32(), 99);
    }

    #[test]
    fn test_round_trip() {
        for v in [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 77, 99] {
            assert_eq!(CommitStep::from_i32(v).as_i32(), v);
        }
        assert_eq!(CommitStep::from_i32(42), CommitStep::Unknown);
    }

    #[test]
    fn test_ordering_is_numeric() {
        assert!(CommitStep::LockTrackedItems < CommitStep::FinalizeCommit);
        assert!(CommitStep::FinalizeCommit < CommitStep::CommitUpdatedAndRemovedHandles);
        assert!(CommitStep::CommitUpdatedAndRemovedHandles < CommitStep::AddActivelyPersistedItem);
    }
}
