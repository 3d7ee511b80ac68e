//! In-memory transaction log and priority log.
//!
//! Entries are grouped per transaction ID and stamped with the
//! transaction's start time. The recovery sweep asks for "one expired
//! transaction" and then drains that transaction's hour bucket before
//! moving on, so `get_one` / `get_one_of_hour` must be deterministic:
//! both return the oldest matching transaction (ties broken by ID).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sop_core::{
    CommitLogEntry, CommitStep, Error, ExpiredTransaction, Handle, PriorityLog, RegistryPayload,
    Result, StoreInfo, TransactionLog, Uid,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How old a transaction's log must be before the sweep considers its
/// owner dead.
pub const DEFAULT_LOG_EXPIRY: Duration = Duration::from_secs(60 * 60);

/// How old a priority record must be before `get_batch` surfaces it,
/// unless the caller ignores age.
const DEFAULT_PRIORITY_MIN_AGE: Duration = Duration::from_secs(2 * 60);

/// Format a timestamp into its hour bucket (`YYYYMMDDHH`).
pub fn format_hour(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H").to_string()
}

struct LogRecord {
    started_at: DateTime<Utc>,
    entries: Vec<CommitLogEntry>,
}

/// In-memory [`TransactionLog`] backend.
///
/// Steps logged with [`CommitStep::CommitUpdatedAndRemovedHandles`] are
/// routed into the paired priority log: that step's payload is exactly
/// the registry restore images the fast-path rollback needs.
pub struct MemoryTransactionLog {
    records: Mutex<HashMap<Uid, LogRecord>>,
    expiry: Duration,
    priority: Arc<MemoryPriorityLog>,
}

impl MemoryTransactionLog {
    /// Create a log with the default one-hour expiry.
    pub fn new() -> Self {
        Self::with_expiry(DEFAULT_LOG_EXPIRY)
    }

    /// Create a log with an explicit expiry (tests shrink it).
    pub fn with_expiry(expiry: Duration) -> Self {
        MemoryTransactionLog {
            records: Mutex::new(HashMap::new()),
            expiry,
            priority: Arc::new(MemoryPriorityLog::new()),
        }
    }

    /// Number of transactions currently holding log entries.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no transaction holds log entries.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Backdate a transaction's start time. Test hook for expiry paths.
    pub fn backdate(&self, tid: Uid, by: Duration) {
        if let Some(rec) = self.records.lock().get_mut(&tid) {
            rec.started_at = rec.started_at
                - chrono::TimeDelta::from_std(by).unwrap_or_else(|_| chrono::TimeDelta::zero());
        }
    }

    fn expired_candidates(&self) -> Vec<(Uid, DateTime<Utc>)> {
        let cutoff = Utc::now()
            - chrono::TimeDelta::from_std(self.expiry).unwrap_or_else(|_| chrono::TimeDelta::zero());
        let records = self.records.lock();
        let mut out: Vec<(Uid, DateTime<Utc>)> = records
            .iter()
            .filter(|(_, rec)| rec.started_at < cutoff)
            .map(|(tid, rec)| (*tid, rec.started_at))
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        out
    }
}

impl Default for MemoryTransactionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionLog for MemoryTransactionLog {
    fn add(&self, tid: Uid, step: CommitStep, payload: Vec<u8>) -> Result<()> {
        if step == CommitStep::CommitUpdatedAndRemovedHandles {
            let handles: Vec<RegistryPayload<Handle>> = bincode::deserialize(&payload)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            self.priority.add(tid, handles)?;
        }
        let mut records = self.records.lock();
        let rec = records.entry(tid).or_insert_with(|| LogRecord {
            started_at: Utc::now(),
            entries: Vec::new(),
        });
        let entry = CommitLogEntry { step, payload };
        // Tolerate re-logging of an identical step.
        if rec.entries.last() != Some(&entry) {
            rec.entries.push(entry);
        }
        Ok(())
    }

    fn remove(&self, tid: Uid) -> Result<()> {
        self.records.lock().remove(&tid);
        self.priority.remove(tid)?;
        Ok(())
    }

    fn get_one(&self) -> Result<Option<ExpiredTransaction>> {
        let candidates = self.expired_candidates();
        let Some((tid, started_at)) = candidates.into_iter().next() else {
            return Ok(None);
        };
        let records = self.records.lock();
        let rec = match records.get(&tid) {
            Some(rec) => rec,
            None => return Ok(None),
        };
        Ok(Some(ExpiredTransaction {
            tid,
            hour: format_hour(started_at),
            entries: rec.entries.clone(),
        }))
    }

    fn get_one_of_hour(&self, hour: &str) -> Result<Option<(Uid, Vec<CommitLogEntry>)>> {
        if hour.is_empty() {
            return Ok(None);
        }
        for (tid, started_at) in self.expired_candidates() {
            if format_hour(started_at) == hour {
                let records = self.records.lock();
                if let Some(rec) = records.get(&tid) {
                    return Ok(Some((tid, rec.entries.clone())));
                }
            }
        }
        Ok(None)
    }

    fn priority_log(&self) -> Arc<dyn PriorityLog> {
        self.priority.clone() as Arc<dyn PriorityLog>
    }
}

struct PriorityRecord {
    added_at: DateTime<Utc>,
    handles: Vec<RegistryPayload<Handle>>,
}

/// In-memory [`PriorityLog`] backend.
pub struct MemoryPriorityLog {
    records: Mutex<HashMap<Uid, PriorityRecord>>,
    min_age: Mutex<Duration>,
    commit_changes_logged: AtomicUsize,
    sector_claims_cleared: AtomicUsize,
}

impl MemoryPriorityLog {
    /// Create a priority log with the default minimum age.
    pub fn new() -> Self {
        MemoryPriorityLog {
            records: Mutex::new(HashMap::new()),
            min_age: Mutex::new(DEFAULT_PRIORITY_MIN_AGE),
            commit_changes_logged: AtomicUsize::new(0),
            sector_claims_cleared: AtomicUsize::new(0),
        }
    }

    /// Override the minimum age (tests shrink it).
    pub fn set_min_age(&self, min_age: Duration) {
        *self.min_age.lock() = min_age;
    }

    /// Number of recorded transactions.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no transaction is recorded.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// How many commit change sets were logged. Test observability.
    pub fn commit_changes_logged(&self) -> usize {
        self.commit_changes_logged.load(Ordering::Relaxed)
    }
}

impl Default for MemoryPriorityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityLog for MemoryPriorityLog {
    fn add(&self, tid: Uid, handles: Vec<RegistryPayload<Handle>>) -> Result<()> {
        self.records.lock().insert(
            tid,
            PriorityRecord {
                added_at: Utc::now(),
                handles,
            },
        );
        Ok(())
    }

    fn remove(&self, tid: Uid) -> Result<()> {
        self.records.lock().remove(&tid);
        Ok(())
    }

    fn get(&self, tid: Uid) -> Result<Option<Vec<RegistryPayload<Handle>>>> {
        Ok(self.records.lock().get(&tid).map(|r| r.handles.clone()))
    }

    fn get_batch(
        &self,
        batch_size: usize,
        ignore_age: bool,
    ) -> Result<Vec<(Uid, Vec<RegistryPayload<Handle>>)>> {
        let min_age = *self.min_age.lock();
        let cutoff =
            Utc::now() - chrono::TimeDelta::from_std(min_age).unwrap_or_else(|_| chrono::TimeDelta::zero());
        let records = self.records.lock();
        let mut out: Vec<(Uid, DateTime<Utc>, Vec<RegistryPayload<Handle>>)> = records
            .iter()
            .filter(|(_, rec)| ignore_age || rec.added_at < cutoff)
            .map(|(tid, rec)| (*tid, rec.added_at, rec.handles.clone()))
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        Ok(out
            .into_iter()
            .take(batch_size)
            .map(|(tid, _, handles)| (tid, handles))
            .collect())
    }

    fn log_commit_changes(
        &self,
        stores: Vec<StoreInfo>,
        _new_root_nodes: Vec<RegistryPayload<Handle>>,
        _added_nodes: Vec<RegistryPayload<Handle>>,
        _updated_nodes: Vec<RegistryPayload<Handle>>,
        _removed_nodes: Vec<RegistryPayload<Handle>>,
    ) -> Result<()> {
        self.commit_changes_logged.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "sop::log",
            stores = stores.len(),
            "commit change set recorded"
        );
        Ok(())
    }

    fn clear_registry_sector_claims(&self) -> Result<()> {
        self.sector_claims_cleared.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
