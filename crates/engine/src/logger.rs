//! Per-transaction write-ahead logging.
//!
//! Every externally visible commit action is logged before (or, where
//! the payload only exists afterwards, immediately after) it runs. The
//! logger keeps an in-memory copy of the tail for the live rollback
//! path and mirrors entries to the log backend when logging is enabled,
//! so the recovery sweep can undo the transaction if this process dies.

use parking_lot::Mutex;
use sop_core::{CommitLogEntry, CommitStep, PriorityLog, Result, TransactionLog, Uid};
use std::sync::Arc;
use tracing::warn;

/// Shared handle to a transaction's logger.
pub(crate) type SharedLogger = Arc<Mutex<TransactionLogger>>;

/// Write-ahead logger bound to one transaction ID.
pub(crate) struct TransactionLogger {
    log: Arc<dyn TransactionLog>,
    /// Current transaction ID. Rotated at phase one when pre-commit
    /// entries were written under the original ID.
    pub tid: Uid,
    /// Mirror entries to the backend log.
    pub enabled: bool,
    /// Furthest protocol step logged (pre-commit and priority-routed
    /// steps excluded).
    pub committed_state: CommitStep,
    /// In-memory tail, in append order.
    pub entries: Vec<CommitLogEntry>,
    /// The original ID eagerly persisted value records were logged
    /// under, once the main ID has rotated away from it.
    pub pre_commit_tid: Option<Uid>,
    pre_commit_logged: bool,
}

impl TransactionLogger {
    pub fn new(log: Arc<dyn TransactionLog>, enabled: bool) -> Self {
        let tid = log.new_uuid();
        TransactionLogger {
            log,
            tid,
            enabled,
            committed_state: CommitStep::Unknown,
            entries: Vec::new(),
            pre_commit_tid: None,
            pre_commit_logged: false,
        }
    }

    /// Append a protocol step ahead of the action it describes.
    pub fn log(&mut self, step: CommitStep, payload: Vec<u8>) -> Result<()> {
        if step != CommitStep::AddActivelyPersistedItem
            && step != CommitStep::CommitUpdatedAndRemovedHandles
        {
            self.committed_state = step;
        }
        self.entries.push(CommitLogEntry {
            step,
            payload: payload.clone(),
        });
        if self.enabled {
            self.log.add(self.tid, step, payload)?;
        }
        Ok(())
    }

    /// Append a pre-commit record (eagerly persisted value blob).
    /// These are written before phase one begins, under the
    /// transaction's original ID.
    pub fn log_pre_commit(&mut self, payload: Vec<u8>) -> Result<()> {
        self.pre_commit_logged = true;
        self.log(CommitStep::AddActivelyPersistedItem, payload)
    }

    /// Whether pre-commit entries were written.
    pub fn has_pre_commit(&self) -> bool {
        self.pre_commit_logged
    }

    /// Rotate to a fresh transaction ID for the commit proper, keeping
    /// the pre-commit ID around so its backend log can be removed once
    /// the tracked values are finalized.
    pub fn rotate_for_commit(&mut self) {
        if self.pre_commit_logged && self.pre_commit_tid.is_none() {
            self.pre_commit_tid = Some(self.tid);
            self.tid = self.log.new_uuid();
        }
    }

    /// Remove the pre-commit backend log; its blobs are now covered by
    /// the main transaction's log.
    pub fn remove_pre_commit_log(&mut self) {
        if let Some(tid) = self.pre_commit_tid.take() {
            if self.enabled {
                if let Err(e) = self.log.remove(tid) {
                    warn!(target: "sop::txn", %tid, error = %e, "pre-commit log removal failed");
                }
            }
        }
    }

    /// Remove every backend log for this transaction. Failure is
    /// non-fatal: the recovery sweep collects leftovers.
    pub fn remove_logs(&mut self) {
        if !self.enabled {
            return;
        }
        for tid in [Some(self.tid), self.pre_commit_tid.take()].into_iter().flatten() {
            if let Err(e) = self.log.remove(tid) {
                warn!(target: "sop::txn", %tid, error = %e, "transaction log removal failed");
            }
        }
    }

    /// The backend's priority log.
    pub fn priority_log(&self) -> Arc<dyn PriorityLog> {
        self.log.priority_log()
    }

    /// Mint a fresh ID from the log backend.
    pub fn new_uuid(&self) -> Uid {
        self.log.new_uuid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sop_durability::MemoryTransactionLog;

    #[test]
    fn test_log_tracks_committed_state() {
        let backend = Arc::new(MemoryTransactionLog::new());
        let mut logger = TransactionLogger::new(backend.clone(), true);

        logger.log(CommitStep::LockTrackedItems, vec![]).unwrap();
        logger.log(CommitStep::CommitNewRootNodes, vec![]).unwrap();
        assert_eq!(logger.committed_state, CommitStep::CommitNewRootNodes);
        assert_eq!(logger.entries.len(), 2);
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_pre_commit_does_not_advance_state() {
        let backend = Arc::new(MemoryTransactionLog::new());
        let mut logger = TransactionLogger::new(backend, true);
        logger.log_pre_commit(vec![1]).unwrap();
        assert_eq!(logger.committed_state, CommitStep::Unknown);
        assert!(logger.has_pre_commit());
    }

    #[test]
    fn test_rotation_keeps_pre_commit_tid() {
        let backend = Arc::new(MemoryTransactionLog::new());
        let mut logger = TransactionLogger::new(backend.clone(), true);
        let original = logger.tid;
        logger.log_pre_commit(vec![1]).unwrap();

        logger.rotate_for_commit();
        assert_ne!(logger.tid, original);
        assert_eq!(logger.pre_commit_tid, Some(original));

        logger.remove_pre_commit_log();
        assert_eq!(logger.pre_commit_tid, None);
        assert_eq!(backend.len(), 0);
    }

    #[test]
    fn test_rotation_is_noop_without_pre_commit() {
        let backend = Arc::new(MemoryTransactionLog::new());
        let mut logger = TransactionLogger::new(backend, true);
        let original = logger.tid;
        logger.rotate_for_commit();
        assert_eq!(logger.tid, original);
    }

    #[test]
    fn test_disabled_logger_keeps_memory_tail_only() {
        let backend = Arc::new(MemoryTransactionLog::new());
        let mut logger = TransactionLogger::new(backend.clone(), false);
        logger.log(CommitStep::LockTrackedItems, vec![]).unwrap();
        assert_eq!(logger.entries.len(), 1);
        assert_eq!(backend.len(), 0);
    }
}
