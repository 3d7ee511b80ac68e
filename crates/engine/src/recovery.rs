//! Idle-time recovery: dead-transaction cleanup and cache-restart
//! detection.
//!
//! Runs opportunistically at the start of each phase one (and from any
//! background ticker an embedding application cares to run). Two
//! independent sub-tasks, each behind its own minimum interval:
//!
//! 1. Cache restart detection: the shared cache's `info("server")`
//!    probe carries a `run_id` line. A changed run ID means every
//!    distributed lock evaporated, so transactions whose coordinator
//!    died mid-publish must be recovered right now via the priority
//!    log, ignoring its usual age filter. Exactly one sweep completes
//!    per observed change; a failed or contended attempt leaves the
//!    restart pending and is retried on the next idle tick.
//! 2. Expired-log cleanup: transactions whose log is older than the
//!    backend's expiry are dead; their logged steps are undone (or,
//!    past the finalize point, completed) one hour bucket at a time.

use crate::node_repository::{
    remove_nodes, rollback_added_nodes, rollback_new_root_nodes, rollback_removed_nodes,
    rollback_updated_nodes, HandlesPayload, NodesPayload, StorageServices,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sop_core::{
    create_lock_keys_for_ids, format_item_key, BlobStore, BlobsIds, Cache, CommitLogEntry,
    CommitStep, Error, LockKey, Registry, RegistryPayload, Result, SectorClaim, StoreInfo,
    StoreRepository, TransactionLog, Uid,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Handles pulled from the priority log per sweep batch.
pub const PRIORITY_BATCH_SIZE: usize = 25;

/// How long sweep-held locks live.
const SWEEP_LOCK_DURATION: Duration = Duration::from_secs(30);

/// The single-sweeper guard key for priority rollback batches.
const PRIORITY_SWEEP_GUARD: &str = "Prbs";

/// Everything the recovery paths need to reach.
#[derive(Clone)]
pub struct RecoveryServices {
    /// Handle registry.
    pub registry: Arc<dyn Registry>,
    /// Blob storage.
    pub blob_store: Arc<dyn BlobStore>,
    /// Shared (L2) cache.
    pub cache: Arc<dyn Cache>,
    /// Store metadata repository.
    pub store_repository: Arc<dyn StoreRepository>,
    /// Transaction log backend.
    pub log: Arc<dyn TransactionLog>,
}

impl RecoveryServices {
    fn storage(&self) -> StorageServices {
        StorageServices {
            registry: self.registry.clone(),
            blob_store: self.blob_store.clone(),
            cache: self.cache.clone(),
        }
    }
}

/// Cadence state for the idle-time tasks.
///
/// Deliberately not process-global state: transactions hold a shared
/// instance (the default one, unless a test installs its own), so tests
/// can construct a fresh scheduler and tighten its intervals without
/// fighting other tests.
pub struct IdleScheduler {
    on_idle_interval: Mutex<Duration>,
    restart_check_interval: Mutex<Duration>,
    info_every_n: AtomicU64,
    last_on_idle: Mutex<Option<Instant>>,
    last_restart_check: Mutex<Option<Instant>>,
    restart_check_counter: AtomicU64,
    last_run_id: Mutex<Option<String>>,
    hour_being_processed: Mutex<Option<String>>,
    priority_sweeps: AtomicU64,
}

impl IdleScheduler {
    /// Create a scheduler with production cadence.
    pub fn new() -> Self {
        IdleScheduler {
            on_idle_interval: Mutex::new(Duration::from_secs(60)),
            restart_check_interval: Mutex::new(Duration::from_secs(15)),
            info_every_n: AtomicU64::new(5),
            last_on_idle: Mutex::new(None),
            last_restart_check: Mutex::new(None),
            restart_check_counter: AtomicU64::new(0),
            last_run_id: Mutex::new(None),
            hour_being_processed: Mutex::new(None),
            priority_sweeps: AtomicU64::new(0),
        }
    }

    /// Shrink the expired-log cleanup interval.
    pub fn set_on_idle_interval(&self, interval: Duration) {
        *self.on_idle_interval.lock() = interval;
    }

    /// Shrink the restart-check interval.
    pub fn set_restart_check_interval(&self, interval: Duration) {
        *self.restart_check_interval.lock() = interval;
    }

    /// Probe the cache info only every Nth eligible check.
    pub fn set_info_every_n(&self, n: u64) {
        self.info_every_n.store(n.max(1), Ordering::Relaxed);
    }

    /// How many priority sweeps ran since creation.
    pub fn priority_sweeps(&self) -> u64 {
        self.priority_sweeps.load(Ordering::Relaxed)
    }

    /// Run both idle tasks, interval-gated. Failures are logged, never
    /// surfaced: idle work must not fail a commit.
    pub fn on_idle(&self, services: &RecoveryServices) {
        if let Err(e) = self.check_cache_restart(services) {
            warn!(target: "sop::recovery", error = %e, "cache restart check failed");
        }
        if let Err(e) = self.process_expired_logs(services) {
            warn!(target: "sop::recovery", error = %e, "expired log processing failed");
        }
    }

    fn check_cache_restart(&self, services: &RecoveryServices) -> Result<()> {
        {
            let interval = *self.restart_check_interval.lock();
            let mut last = self.last_restart_check.lock();
            if let Some(at) = *last {
                if at.elapsed() < interval {
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }
        let every_n = self.info_every_n.load(Ordering::Relaxed).max(1);
        let count = self.restart_check_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if count % every_n != 0 {
            return Ok(());
        }
        let info = services.cache.info("server")?;
        let Some(run_id) = parse_run_id(&info) else {
            return Err(Error::Backend("cache info carries no run_id".to_string()));
        };
        let changed = {
            let mut last_run = self.last_run_id.lock();
            match last_run.as_deref() {
                Some(prev) if prev == run_id => false,
                Some(_) => true,
                None => {
                    *last_run = Some(run_id.to_string());
                    false
                }
            }
        };
        if changed {
            debug!(target: "sop::recovery", run_id, "cache restart detected");
            services.log.priority_log().clear_registry_sector_claims()?;
            if !do_priority_rollbacks(services, PRIORITY_BATCH_SIZE, true)? {
                // Another coordinator holds the sweep guard; leave the
                // restart pending and retry on the next idle tick.
                return Ok(());
            }
            self.priority_sweeps.fetch_add(1, Ordering::Relaxed);
            // The run ID is committed only after a completed sweep; a
            // failed attempt leaves the restart pending for retry.
            *self.last_run_id.lock() = Some(run_id.to_string());
        }
        Ok(())
    }

    fn process_expired_logs(&self, services: &RecoveryServices) -> Result<()> {
        {
            let interval = *self.on_idle_interval.lock();
            let mut last = self.last_on_idle.lock();
            if let Some(at) = *last {
                if at.elapsed() < interval {
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }
        let hour = self.hour_being_processed.lock().clone();
        match hour {
            Some(hour) => match services.log.get_one_of_hour(&hour)? {
                Some((tid, entries)) => rollback_dead_transaction(services, tid, &entries)?,
                None => {
                    // Hour drained; next idle round asks for a new one.
                    *self.hour_being_processed.lock() = None;
                }
            },
            None => {
                if let Some(expired) = services.log.get_one()? {
                    *self.hour_being_processed.lock() = Some(expired.hour.clone());
                    rollback_dead_transaction(services, expired.tid, &expired.entries)?;
                }
            }
        }
        Ok(())
    }
}

impl Default for IdleScheduler {
    fn default() -> Self {
        Self::new()
    }
}

static DEFAULT_SCHEDULER: Lazy<Arc<IdleScheduler>> = Lazy::new(|| Arc::new(IdleScheduler::new()));

/// The process-wide scheduler transactions use unless given their own.
pub fn default_scheduler() -> Arc<IdleScheduler> {
    DEFAULT_SCHEDULER.clone()
}

fn parse_run_id(info: &str) -> Option<&str> {
    info.lines()
        .map(|l| l.trim())
        .find_map(|l| l.strip_prefix("run_id:"))
        .map(|v| v.trim())
}

/// Process a batch of priority-log records: transactions that died with
/// registry changes staged or half-applied. Returns false when another
/// coordinator holds the sweep guard.
///
/// # Errors
///
/// Surfaces a registry sector failure when a recorded transaction's
/// handles have been overwritten by a later committer; the upper layer
/// must fail over.
pub fn do_priority_rollbacks(
    services: &RecoveryServices,
    batch_size: usize,
    ignore_age: bool,
) -> Result<bool> {
    let priority_log = services.log.priority_log();
    if !priority_log.is_enabled() {
        return Ok(true);
    }
    // One sweeper at a time, cluster-wide.
    let mut guard = vec![LockKey::new(PRIORITY_SWEEP_GUARD, Uid::new())];
    let (ok, _) = services.cache.lock(SWEEP_LOCK_DURATION, &mut guard)?;
    if !ok {
        return Ok(false);
    }
    let outcome = run_priority_batch(services, batch_size, ignore_age);
    if let Err(e) = services.cache.unlock(&guard) {
        warn!(target: "sop::recovery", error = %e, "sweep guard unlock failed");
    }
    outcome.map(|_| true)
}

fn run_priority_batch(
    services: &RecoveryServices,
    batch_size: usize,
    ignore_age: bool,
) -> Result<()> {
    let priority_log = services.log.priority_log();
    let batch = priority_log.get_batch(batch_size, ignore_age)?;
    for (tid, payloads) in batch {
        let keys: Vec<RegistryPayload<Uid>> = payloads
            .iter()
            .map(|p| {
                RegistryPayload::new(
                    p.registry_table.clone(),
                    p.items.iter().map(|h| h.logical_id).collect(),
                )
            })
            .collect();
        let current = services.registry.get(keys)?;
        let current_by_id: HashMap<Uid, i32> = current
            .iter()
            .flat_map(|p| p.items.iter())
            .map(|h| (h.logical_id, h.version))
            .collect();
        let progressed = payloads.iter().flat_map(|p| p.items.iter()).any(|h| {
            current_by_id
                .get(&h.logical_id)
                .map(|v| *v > h.version)
                .unwrap_or(false)
        });
        if progressed {
            // A later committer built on top of this sector; restore the
            // recorded handles and signal the upper layer to fail over.
            services.registry.update_no_locks(payloads)?;
            return Err(Error::sector_tid(tid));
        }
        priority_rollback(services, tid)?;
        priority_log.remove(tid)?;
    }
    Ok(())
}

/// Re-apply (and thereby make consistent) the registry-handle changes a
/// dead transaction recorded before its publish.
///
/// # Errors
///
/// A registry failure surfaces as a sector failure carrying the dead
/// transaction's ID.
pub fn priority_rollback(services: &RecoveryServices, tid: Uid) -> Result<()> {
    let priority_log = services.log.priority_log();
    let Some(payloads) = priority_log.get(tid)? else {
        return Ok(());
    };
    services
        .registry
        .update_no_locks(payloads)
        .map_err(|_| Error::sector_tid(tid))?;
    priority_log.remove(tid)?;
    Ok(())
}

/// Acquire node locks on behalf of a (possibly resurrected)
/// transaction. When the keys are already held under the same
/// transaction ID, ownership is taken over; a different live owner is a
/// registry sector failure the upper layer resolves via
/// [`handle_registry_sector_lock_timeout`].
///
/// # Errors
///
/// Returns a sector failure carrying the contested lock key and the
/// competing owner.
pub fn acquire_locks(
    cache: &Arc<dyn Cache>,
    tid: Uid,
    ids: &[Uid],
    duration: Duration,
) -> Result<Vec<LockKey>> {
    let mut keys = create_lock_keys_for_ids(tid, ids);
    let (ok, owner) = cache.dual_lock(duration, &mut keys)?;
    if ok {
        return Ok(keys);
    }
    if owner == Some(tid) {
        // Our own prior incarnation holds them; resurrect the claim.
        for key in &mut keys {
            key.lock_id = tid;
            key.is_lock_owner = true;
        }
        return Ok(keys);
    }
    cache.unlock(&keys)?;
    let key = keys.first().map(|k| k.key.clone()).unwrap_or_default();
    Err(Error::sector_lock(key, owner))
}

/// Resolve a sector lock held by a dead transaction by rolling its
/// recorded registry changes forward, after which the original
/// operation may be retried.
///
/// # Errors
///
/// Propagates the failure when the claim does not identify a
/// transaction to recover.
pub fn handle_registry_sector_lock_timeout(
    services: &RecoveryServices,
    failure: &Error,
) -> Result<()> {
    match failure.sector_claim() {
        Some(SectorClaim::LockKey {
            owner: Some(owner), ..
        }) => priority_rollback(services, *owner),
        Some(SectorClaim::Tid(tid)) => priority_rollback(services, *tid),
        _ => Err(Error::Backend(format!(
            "sector failure has no recoverable owner: {}",
            failure
        ))),
    }
}

/// Undo (or, past the finalize point, complete) a dead transaction from
/// its logged steps, then drop its logs.
pub(crate) fn rollback_dead_transaction(
    services: &RecoveryServices,
    tid: Uid,
    entries: &[CommitLogEntry],
) -> Result<()> {
    let committed_state = entries
        .iter()
        .map(|e| e.step)
        .filter(|s| {
            *s != CommitStep::AddActivelyPersistedItem
                && *s != CommitStep::CommitUpdatedAndRemovedHandles
        })
        .max()
        .unwrap_or(CommitStep::Unknown);

    if committed_state >= CommitStep::FinalizeCommit {
        // The commit is durable (or one registry write away from it):
        // complete the publish and the cleanup instead of undoing.
        priority_rollback(services, tid)?;
        if let Some(entry) = entries
            .iter()
            .rev()
            .find(|e| e.step == CommitStep::FinalizeCommit)
        {
            let (obsolete_nodes, obsolete_values): (Vec<BlobsIds>, Vec<BlobsIds>) =
                bincode::deserialize(&entry.payload)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
            remove_value_blobs(&services.storage(), &obsolete_values)?;
            remove_nodes(&services.blob_store, &services.cache, &obsolete_nodes)?;
        }
        services.log.remove(tid)?;
        debug!(target: "sop::recovery", %tid, "dead transaction rolled forward");
        return Ok(());
    }

    // Take over the dead transaction's node locks before touching the
    // registry; a live competitor surfaces as a sector failure and this
    // round is retried later.
    let ids = affected_node_ids(entries);
    let locks = acquire_locks(&services.cache, tid, &ids, SWEEP_LOCK_DURATION)?;
    let result = rollback_logged_steps(
        &services.storage(),
        &services.store_repository,
        entries,
        committed_state,
        true,
    );
    if let Err(e) = services.cache.unlock(&locks) {
        warn!(target: "sop::recovery", error = %e, "dead transaction lock release failed");
    }
    services.log.remove(tid)?;
    debug!(target: "sop::recovery", %tid, "dead transaction rolled back");
    result
}

fn affected_node_ids(entries: &[CommitLogEntry]) -> Vec<Uid> {
    let mut ids = Vec::new();
    for entry in entries {
        match entry.step {
            CommitStep::CommitUpdatedNodes => {
                if let Ok(payloads) = bincode::deserialize::<Vec<HandlesPayload>>(&entry.payload) {
                    ids.extend(payloads.iter().flat_map(|p| p.logical_ids()));
                }
            }
            CommitStep::CommitRemovedNodes => {
                if let Ok(payloads) = bincode::deserialize::<Vec<NodesPayload>>(&entry.payload) {
                    ids.extend(payloads.iter().flat_map(|p| p.ids.iter().copied()));
                }
            }
            _ => {}
        }
    }
    ids.sort();
    ids.dedup();
    ids
}

/// Dispatch each logged step, newest to oldest, to its inverse.
/// Idempotent: missing blobs and keys are not errors, and re-running
/// against the same log yields the same end state.
pub(crate) fn rollback_logged_steps(
    services: &StorageServices,
    store_repository: &Arc<dyn StoreRepository>,
    entries: &[CommitLogEntry],
    committed_state: CommitStep,
    nodes_are_locked: bool,
) -> Result<()> {
    let mut first_err: Option<Error> = None;
    for entry in entries.iter().rev() {
        let outcome = match entry.step {
            CommitStep::CommitTrackedItemsValues | CommitStep::AddActivelyPersistedItem => {
                bincode::deserialize::<Vec<BlobsIds>>(&entry.payload)
                    .map_err(|e| Error::Serialization(e.to_string()))
                    .and_then(|blobs| remove_value_blobs(services, &blobs))
            }
            CommitStep::CommitNewRootNodes => {
                bincode::deserialize::<Vec<NodesPayload>>(&entry.payload)
                    .map_err(|e| Error::Serialization(e.to_string()))
                    .and_then(|payloads| {
                        rollback_new_root_nodes(
                            services,
                            &payloads,
                            committed_state > CommitStep::CommitNewRootNodes,
                        )
                    })
            }
            CommitStep::CommitUpdatedNodes => {
                bincode::deserialize::<Vec<HandlesPayload>>(&entry.payload)
                    .map_err(|e| Error::Serialization(e.to_string()))
                    .and_then(|payloads| {
                        rollback_updated_nodes(services, &payloads, nodes_are_locked)
                    })
            }
            CommitStep::CommitRemovedNodes => {
                bincode::deserialize::<Vec<NodesPayload>>(&entry.payload)
                    .map_err(|e| Error::Serialization(e.to_string()))
                    .and_then(|payloads| {
                        rollback_removed_nodes(services, &payloads, nodes_are_locked)
                    })
            }
            CommitStep::CommitAddedNodes => {
                bincode::deserialize::<Vec<NodesPayload>>(&entry.payload)
                    .map_err(|e| Error::Serialization(e.to_string()))
                    .and_then(|payloads| rollback_added_nodes(services, &payloads))
            }
            CommitStep::CommitStoreInfo => {
                bincode::deserialize::<Vec<StoreInfo>>(&entry.payload)
                    .map_err(|e| Error::Serialization(e.to_string()))
                    .and_then(|stores| store_repository.update(stores).map(|_| ()))
            }
            _ => Ok(()),
        };
        if let Err(e) = outcome {
            warn!(
                target: "sop::recovery",
                step = entry.step.as_i32(),
                error = %e,
                "rollback step failed"
            );
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Delete value blobs and their shared-cache mirrors.
pub(crate) fn remove_value_blobs(services: &StorageServices, blobs: &[BlobsIds]) -> Result<()> {
    for payload in blobs {
        if payload.ids.is_empty() {
            continue;
        }
        services.blob_store.remove(vec![payload.clone()])?;
        let keys: Vec<String> = payload.ids.iter().map(|id| format_item_key(*id)).collect();
        services.cache.delete(&keys)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sop_core::Handle;
    use sop_durability::MemoryTransactionLog;
    use sop_storage::{MemoryBlobStore, MemoryCache, MemoryRegistry, MemoryStoreRepository};

    fn services() -> (
        RecoveryServices,
        Arc<MemoryRegistry>,
        Arc<MemoryCache>,
        Arc<MemoryTransactionLog>,
    ) {
        let registry = Arc::new(MemoryRegistry::new());
        let cache = Arc::new(MemoryCache::new());
        let log = Arc::new(MemoryTransactionLog::new());
        let svc = RecoveryServices {
            registry: registry.clone(),
            blob_store: Arc::new(MemoryBlobStore::new()),
            cache: cache.clone(),
            store_repository: Arc::new(MemoryStoreRepository::new()),
            log: log.clone(),
        };
        (svc, registry, cache, log)
    }

    #[test]
    fn test_parse_run_id() {
        let info = "# Server\r\nrun_id:abc123\r\nmode:standalone\r\n";
        assert_eq!(parse_run_id(info), Some("abc123"));
        assert_eq!(parse_run_id("# Server\r\nuptime:1\r\n"), None);
    }

    #[test]
    fn test_acquire_locks_takes_over_own_tid() {
        let (_, _, cache, _) = services();
        let cache: Arc<dyn Cache> = cache;
        let tid = Uid::new();
        let ids = vec![Uid::new()];

        // Simulate the dead incarnation's leftover lock.
        let mut stale = create_lock_keys_for_ids(tid, &ids);
        assert!(cache
            .dual_lock(Duration::from_secs(30), &mut stale)
            .unwrap()
            .0);

        // Resurrection under the same transaction ID succeeds.
        let keys = acquire_locks(&cache, tid, &ids, Duration::from_secs(30)).unwrap();
        assert!(keys.iter().all(|k| k.is_lock_owner && k.lock_id == tid));

        // A different transaction gets a sector failure naming the
        // holder.
        let other = Uid::new();
        let err = acquire_locks(&cache, other, &ids, Duration::from_secs(30)).unwrap_err();
        assert!(err.is_sector_failure());
        match err.sector_claim() {
            Some(SectorClaim::LockKey { owner, .. }) => assert_eq!(*owner, Some(tid)),
            other => panic!("unexpected claim: {:?}", other),
        }
    }

    #[test]
    fn test_priority_rollback_applies_recorded_handles() {
        let (svc, registry, _, log) = services();
        let tid = Uid::new();
        let mut handle = Handle::new(Uid::new());
        handle.version = 3;
        log.priority_log()
            .add(tid, vec![RegistryPayload::new("s_r", vec![handle])])
            .unwrap();

        priority_rollback(&svc, tid).unwrap();
        assert_eq!(registry.get_handle("s_r", handle.logical_id), Some(handle));
        assert!(log.priority_log().get(tid).unwrap().is_none());

        // Unknown transactions are a no-op.
        priority_rollback(&svc, Uid::new()).unwrap();
    }

    #[test]
    fn test_do_priority_rollbacks_detects_progressed_sector() {
        let (svc, registry, _, log) = services();
        let tid = Uid::new();
        let mut stored = Handle::new(Uid::new());
        stored.version = 2;

        // The registry has moved past the recorded version.
        let mut current = stored;
        current.version = 4;
        registry
            .add(vec![RegistryPayload::new("s_r", vec![current])])
            .unwrap();
        log.priority_log()
            .add(tid, vec![RegistryPayload::new("s_r", vec![stored])])
            .unwrap();

        let err = do_priority_rollbacks(&svc, 10, true).unwrap_err();
        assert!(err.is_sector_failure());
        // The recorded handles were restored for the failover layer.
        assert_eq!(
            registry.get_handle("s_r", stored.logical_id).unwrap().version,
            2
        );
    }

    #[test]
    fn test_do_priority_rollbacks_respects_guard() {
        let (svc, _, cache, _) = services();
        // Another coordinator holds the sweep guard.
        let mut guard = vec![LockKey::new(PRIORITY_SWEEP_GUARD, Uid::new())];
        assert!(cache
            .lock(Duration::from_secs(30), &mut guard)
            .unwrap()
            .0);
        assert!(!do_priority_rollbacks(&svc, 10, true).unwrap());
    }

    #[test]
    fn test_restart_sweep_runs_once_per_run_id_change() {
        let (svc, _, cache, log) = services();
        let scheduler = IdleScheduler::new();
        scheduler.set_restart_check_interval(Duration::from_millis(10));
        scheduler.set_info_every_n(1);

        // Seed a fresh priority record; only an ignore-age sweep picks
        // it up.
        let tid = Uid::new();
        log.priority_log().add(tid, vec![]).unwrap();

        cache.set_run_id("r1");
        scheduler.on_idle(&svc);
        assert_eq!(scheduler.priority_sweeps(), 0);
        assert!(log.priority_log().get(tid).unwrap().is_some());

        cache.set_run_id("r2");
        std::thread::sleep(Duration::from_millis(15));
        scheduler.on_idle(&svc);
        assert_eq!(scheduler.priority_sweeps(), 1);
        // The batch ran with the age filter bypassed.
        assert!(log.priority_log().get(tid).unwrap().is_none());

        std::thread::sleep(Duration::from_millis(15));
        scheduler.on_idle(&svc);
        assert_eq!(scheduler.priority_sweeps(), 1, "unchanged run_id sweeps nothing");
    }

    #[test]
    fn test_restart_sweep_retries_until_batch_succeeds() {
        let (svc, registry, cache, log) = services();
        let scheduler = IdleScheduler::new();
        scheduler.set_restart_check_interval(Duration::ZERO);
        scheduler.set_info_every_n(1);

        cache.set_run_id("r1");
        scheduler.on_idle(&svc);
        assert_eq!(scheduler.priority_sweeps(), 0);

        // A record whose sector has already progressed past it makes
        // the sweep batch fail with a sector failure.
        let tid = Uid::new();
        let mut stored = Handle::new(Uid::new());
        stored.version = 2;
        let mut current = stored;
        current.version = 4;
        registry
            .add(vec![RegistryPayload::new("s_r", vec![current])])
            .unwrap();
        log.priority_log()
            .add(tid, vec![RegistryPayload::new("s_r", vec![stored])])
            .unwrap();

        cache.set_run_id("r2");
        scheduler.on_idle(&svc);
        // The failed attempt is not counted and the restart stays
        // pending rather than being dropped.
        assert_eq!(scheduler.priority_sweeps(), 0);

        // Once the failover layer resolves the record, the next idle
        // tick retries the same restart and completes its one sweep.
        log.priority_log().remove(tid).unwrap();
        scheduler.on_idle(&svc);
        assert_eq!(scheduler.priority_sweeps(), 1);

        // The run ID is now committed; further ticks sweep nothing.
        scheduler.on_idle(&svc);
        assert_eq!(scheduler.priority_sweeps(), 1);
    }

    #[test]
    fn test_expired_log_rollback_removes_transaction() {
        let (svc, registry, _, _) = services();
        let log = Arc::new(MemoryTransactionLog::with_expiry(Duration::ZERO));
        let svc = RecoveryServices {
            log: log.clone(),
            ..svc
        };
        let scheduler = IdleScheduler::new();
        scheduler.set_on_idle_interval(Duration::ZERO);

        // A dead transaction that registered an added node.
        let tid = log.new_uuid();
        let node_id = Uid::new();
        registry
            .add(vec![RegistryPayload::new("s_r", vec![Handle::new(node_id)])])
            .unwrap();
        let payload = vec![NodesPayload {
            registry_table: "s_r".to_string(),
            blob_table: "s_b".to_string(),
            ids: vec![node_id],
        }];
        log.add(
            tid,
            CommitStep::CommitAddedNodes,
            bincode::serialize(&payload).unwrap(),
        )
        .unwrap();
        log.backdate(tid, Duration::from_secs(10));

        scheduler.on_idle(&svc);

        // Undone and collected: the handle is gone, and so is the log.
        assert!(registry.get_handle("s_r", node_id).is_none());
        assert!(log.is_empty());
        assert!(log.get_one().unwrap().is_none());
    }
}
