//! Two-phase commit transaction coordinator.
//!
//! Phase one stages everything reversible: item value blobs, new root
//! and added node registrations, updated node bytes written into the
//! handles' INACTIVE slots, deletion marks on removed nodes. Node-level
//! conflicts inside the retry loop trigger refetch-and-merge: local
//! caches are dropped and the session's intent is replayed against a
//! fresh read, bounded by the transaction's maximum time.
//!
//! Phase two is one atomic registry batch (flip active slots, bump
//! versions, finalize deletes) followed by best-effort replication and
//! cleanup. A write-ahead record precedes every step, so a coordinator
//! death at any point leaves a log the recovery sweep can
//! deterministically undo - or, past the finalize record, complete.

use crate::backend::CommitBackend;
use crate::logger::{SharedLogger, TransactionLogger};
use crate::node_repository::{
    activate_inactive_nodes, remove_nodes, rollback_new_root_nodes, rollback_removed_nodes,
    rollback_updated_nodes, touch_nodes, HandlesPayload, NodesPayload, StorageServices,
};
use crate::recovery::{
    default_scheduler, remove_value_blobs, rollback_logged_steps, IdleScheduler, RecoveryServices,
};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use sop_core::{
    create_lock_keys_for_ids, BlobStore, BlobsIds, Cache, CommitStep, Error, Handle, LockKey,
    Registry, RegistryPayload, Result, StoreInfo, StoreRepository, TransactionLog, Uid,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default commit window when the caller passes none.
pub const DEFAULT_MAX_TIME: Duration = Duration::from_secs(15 * 60);

/// Hard cap on the commit window.
pub const MAX_MAX_TIME: Duration = Duration::from_secs(60 * 60);

/// Transaction modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// No conflict checks; phase one is a no-op. For bulk tooling that
    /// manages its own consistency.
    NoCheck,
    /// Read-only: commit verifies that every fetched node is still
    /// current.
    ForReading,
    /// Read-write: the full two-phase protocol.
    ForWriting,
}

/// Transaction lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    New,
    Begun,
    Phase1Done,
    Done,
}

/// Hook fired after a successful phase two (never after rollback).
pub type CommitHook = Box<dyn Fn() + Send>;

type ReplicationErrorHook = Box<dyn Fn(&Error, bool) + Send + Sync>;

static REPLICATION_ERROR_HOOK: Lazy<RwLock<Option<ReplicationErrorHook>>> =
    Lazy::new(|| RwLock::new(None));

/// Install the process-wide replication failure hook. It receives the
/// causing error and whether rollback (when one ran) succeeded, so an
/// embedding layer can initiate failover.
pub fn set_replication_error_handler(hook: impl Fn(&Error, bool) + Send + Sync + 'static) {
    *REPLICATION_ERROR_HOOK.write() = Some(Box::new(hook));
}

pub(crate) fn notify_replication_error(cause: &Error, rollback_succeeded: bool) {
    if let Some(hook) = &*REPLICATION_ERROR_HOOK.read() {
        hook(cause, rollback_succeeded);
    }
}

/// Which node class a per-backend commit call belongs to; selects the
/// matching inverse on partial failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeClass {
    Root,
    Updated,
    Removed,
}

#[derive(Default)]
struct StagedCommit {
    has_changes: bool,
    root_handles: Vec<HandlesPayload>,
    added_handles: Vec<HandlesPayload>,
    updated_final: Vec<HandlesPayload>,
    removed_final: Vec<HandlesPayload>,
    commit_stores: Vec<StoreInfo>,
    obsolete_value_blobs: Vec<BlobsIds>,
}

struct TxInner {
    mode: TransactionMode,
    max_time: Duration,
    state: Mutex<TransactionState>,
    backends: Mutex<Vec<Arc<dyn CommitBackend>>>,
    registry: Arc<dyn Registry>,
    blob_store: Arc<dyn BlobStore>,
    cache: Arc<dyn Cache>,
    store_repository: Arc<dyn StoreRepository>,
    log: Arc<dyn TransactionLog>,
    logger: SharedLogger,
    scheduler: Mutex<Arc<IdleScheduler>>,
    nodes_keys: Mutex<Vec<LockKey>>,
    staged: Mutex<StagedCommit>,
    on_commit: Mutex<Vec<CommitHook>>,
}

/// A two-phase commit transaction over one set of storage backends.
///
/// Cheap to clone; clones share the same transaction. B-Trees bound via
/// `new_btree`/`open_btree` hold a clone.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

/// Create a transaction. `max_time` of `None` (or zero) defaults to
/// fifteen minutes; anything above one hour is capped.
#[allow(clippy::too_many_arguments)]
pub fn new_two_phase_commit_transaction(
    mode: TransactionMode,
    max_time: Option<Duration>,
    logging_enabled: bool,
    blob_store: Arc<dyn BlobStore>,
    store_repository: Arc<dyn StoreRepository>,
    registry: Arc<dyn Registry>,
    l2_cache: Arc<dyn Cache>,
    transaction_log: Arc<dyn TransactionLog>,
) -> Transaction {
    let max_time = match max_time {
        Some(d) if !d.is_zero() => d.min(MAX_MAX_TIME),
        _ => DEFAULT_MAX_TIME,
    };
    let logger = Arc::new(Mutex::new(TransactionLogger::new(
        transaction_log.clone(),
        logging_enabled,
    )));
    Transaction {
        inner: Arc::new(TxInner {
            mode,
            max_time,
            state: Mutex::new(TransactionState::New),
            backends: Mutex::new(Vec::new()),
            registry,
            blob_store,
            cache: l2_cache,
            store_repository,
            log: transaction_log,
            logger,
            scheduler: Mutex::new(default_scheduler()),
            nodes_keys: Mutex::new(Vec::new()),
            staged: Mutex::new(StagedCommit::default()),
            on_commit: Mutex::new(Vec::new()),
        }),
    }
}

impl Transaction {
    /// Begin the transaction. Must run before any B-Tree is bound.
    pub fn begin(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        match *state {
            TransactionState::New => {
                *state = TransactionState::Begun;
                debug!(target: "sop::txn", tid = %self.id(), "transaction begun");
                Ok(())
            }
            TransactionState::Begun => Err(Error::InvalidState(
                "transaction already begun".to_string(),
            )),
            _ => Err(Error::InvalidState("transaction has ended".to_string())),
        }
    }

    /// Whether `begin` has run and the transaction has not ended.
    pub fn has_begun(&self) -> bool {
        matches!(
            *self.inner.state.lock(),
            TransactionState::Begun | TransactionState::Phase1Done
        )
    }

    /// The transaction mode.
    pub fn mode(&self) -> TransactionMode {
        self.inner.mode
    }

    /// The transaction ID.
    pub fn id(&self) -> Uid {
        self.inner.logger.lock().tid
    }

    /// The commit window.
    pub fn max_time(&self) -> Duration {
        self.inner.max_time
    }

    /// Names of every store in the repository.
    pub fn get_stores(&self) -> Result<Vec<String>> {
        self.inner.store_repository.get_all()
    }

    /// The store repository backing this transaction.
    pub fn store_repository(&self) -> Arc<dyn StoreRepository> {
        self.inner.store_repository.clone()
    }

    /// Register a hook fired after a successful commit (never after a
    /// rollback).
    pub fn on_commit(&self, hook: impl Fn() + Send + 'static) {
        self.inner.on_commit.lock().push(Box::new(hook));
    }

    /// Install a scheduler instance (tests tighten its cadence).
    pub fn set_scheduler(&self, scheduler: Arc<IdleScheduler>) {
        *self.inner.scheduler.lock() = scheduler;
    }

    /// Run phase one and phase two, rolling back on any failure.
    pub fn commit(&self) -> Result<()> {
        match self.phase_1_commit().and_then(|_| self.phase_2_commit()) {
            Ok(()) => Ok(()),
            Err(cause) => {
                let rollback_outcome = self.rollback(None);
                if matches!(cause, Error::Backend(_)) {
                    notify_replication_error(&cause, rollback_outcome.is_ok());
                }
                if let Err(e) = rollback_outcome {
                    warn!(target: "sop::txn", tid = %self.id(), error = %e, "rollback after failed commit");
                }
                Err(cause)
            }
        }
    }

    /// Stage the transaction's changes. On success the transaction is
    /// one `phase_2_commit` away from durability.
    pub fn phase_1_commit(&self) -> Result<()> {
        self.expect_state(TransactionState::Begun, "phase one commit")?;
        match self.inner.mode {
            TransactionMode::NoCheck => {
                self.set_state(TransactionState::Phase1Done);
                Ok(())
            }
            TransactionMode::ForReading => {
                self.commit_for_reader_transaction()?;
                self.set_state(TransactionState::Phase1Done);
                Ok(())
            }
            TransactionMode::ForWriting => {
                self.phase_1_writer()?;
                self.set_state(TransactionState::Phase1Done);
                Ok(())
            }
        }
    }

    /// Publish the staged changes: the single atomic registry batch,
    /// replication fan-out, cache population and cleanup.
    pub fn phase_2_commit(&self) -> Result<()> {
        self.expect_state(TransactionState::Phase1Done, "phase two commit")?;
        let staged = std::mem::take(&mut *self.inner.staged.lock());
        if !staged.has_changes {
            self.release_all_locks();
            self.end_session();
            self.inner.logger.lock().remove_logs();
            self.set_state(TransactionState::Done);
            self.fire_commit_hooks();
            return Ok(());
        }

        // Everything that can be physically deleted once the publish
        // holds: pre-flip active blobs of updated nodes, blobs of
        // removed nodes, retired item values.
        let mut obsolete_nodes: Vec<NodesPayload> = Vec::new();
        for payload in &staged.updated_final {
            obsolete_nodes.push(NodesPayload {
                registry_table: payload.registry_table.clone(),
                blob_table: payload.blob_table.clone(),
                ids: payload
                    .handles
                    .iter()
                    .map(|h| h.get_inactive_id())
                    .filter(|id| !id.is_nil())
                    .collect(),
            });
        }
        for payload in &staged.removed_final {
            obsolete_nodes.push(NodesPayload {
                registry_table: payload.registry_table.clone(),
                blob_table: payload.blob_table.clone(),
                ids: payload.handles.iter().map(|h| h.get_active_id()).collect(),
            });
        }
        let obsolete_node_blobs: Vec<BlobsIds> = obsolete_nodes
            .iter()
            .map(|p| BlobsIds {
                blob_table: p.blob_table.clone(),
                ids: p.ids.clone(),
            })
            .collect();

        let publish_outcome = (|| -> Result<()> {
            self.log(
                CommitStep::FinalizeCommit,
                bincode::serialize(&(
                    obsolete_node_blobs.clone(),
                    staged.obsolete_value_blobs.clone(),
                ))?,
            )?;

            // Record the handle changes about to apply; the log backend
            // routes this step into the priority log for fast-path
            // recovery.
            let publish: Vec<RegistryPayload<Handle>> = staged
                .updated_final
                .iter()
                .chain(staged.removed_final.iter())
                .map(|p| p.registry_payload())
                .collect();
            self.log(
                CommitStep::CommitUpdatedAndRemovedHandles,
                bincode::serialize(&publish)?,
            )?;

            // THE atomic publish: flips, version bumps and deletion
            // marks take effect in one batch.
            self.inner.registry.update_no_locks(publish)
        })();
        if let Err(e) = publish_outcome {
            // The staged state stays for the recovery sweep; locks must
            // not outlive this coordinator though.
            self.release_all_locks();
            self.set_state(TransactionState::Done);
            return Err(e);
        }

        self.replicate_fan_out(&staged);

        // Refresh the in-process MRU with the published nodes.
        let all_handles: Vec<Handle> = staged
            .root_handles
            .iter()
            .chain(staged.added_handles.iter())
            .chain(staged.updated_final.iter())
            .flat_map(|p| p.handles.iter().copied())
            .collect();
        for backend in self.backends() {
            if let Err(e) = backend.populate_mru(&all_handles) {
                warn!(target: "sop::txn", error = %e, "node cache population failed");
            }
        }

        self.release_all_locks();

        // Cleanup, each wave logged ahead of the deletes.
        let services = self.storage_services();
        if let Err(e) = self
            .log(
                CommitStep::DeleteTrackedItemsValues,
                bincode::serialize(&staged.obsolete_value_blobs)?,
            )
            .and_then(|_| remove_value_blobs(&services, &staged.obsolete_value_blobs))
        {
            warn!(target: "sop::txn", error = %e, "obsolete value cleanup failed");
        }
        if let Err(e) = self
            .log(
                CommitStep::DeleteObsoleteEntries,
                bincode::serialize(&obsolete_node_blobs)?,
            )
            .and_then(|_| {
                remove_nodes(
                    &self.inner.blob_store,
                    &self.inner.cache,
                    &obsolete_node_blobs,
                )
            })
        {
            warn!(target: "sop::txn", error = %e, "obsolete node cleanup failed");
        }

        {
            let mut logger = self.inner.logger.lock();
            if let Err(e) = logger.priority_log().remove(logger.tid) {
                warn!(target: "sop::txn", error = %e, "priority record removal failed");
            }
            logger.remove_logs();
        }
        self.end_session();
        self.set_state(TransactionState::Done);
        debug!(target: "sop::txn", tid = %self.id(), "transaction committed");
        self.fire_commit_hooks();
        Ok(())
    }

    /// Undo the staged changes and end the transaction.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when the transaction already ended or its
    /// finalize record is logged (commit is durable; the recovery sweep
    /// completes it).
    pub fn rollback(&self, cause: Option<Error>) -> Result<()> {
        {
            let state = self.inner.state.lock();
            if *state == TransactionState::Done {
                return Err(Error::InvalidState("transaction has ended".to_string()));
            }
        }
        if let Some(cause) = &cause {
            warn!(target: "sop::txn", tid = %self.id(), cause = %cause, "rolling back");
        }
        let (entries, committed_state) = {
            let logger = self.inner.logger.lock();
            (logger.entries.clone(), logger.committed_state)
        };
        if committed_state >= CommitStep::FinalizeCommit {
            self.set_state(TransactionState::Done);
            return Err(Error::InvalidState(
                "commit is finalized; recovery will complete it".to_string(),
            ));
        }
        let services = self.storage_services();
        let result = rollback_logged_steps(
            &services,
            &self.inner.store_repository,
            &entries,
            committed_state,
            true,
        );
        self.release_all_locks();
        self.end_session();
        {
            let mut logger = self.inner.logger.lock();
            if let Err(e) = logger.priority_log().remove(logger.tid) {
                warn!(target: "sop::txn", error = %e, "priority record removal failed");
            }
            logger.remove_logs();
        }
        self.set_state(TransactionState::Done);
        result
    }

    /// End the transaction, rolling back anything in flight.
    pub fn close(&self) -> Result<()> {
        let state = *self.inner.state.lock();
        match state {
            TransactionState::Begun | TransactionState::Phase1Done => self.rollback(None),
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------
    // Phase one
    // -----------------------------------------------------------------

    fn phase_1_writer(&self) -> Result<()> {
        self.scheduler().on_idle(&self.recovery_services());

        let backends = self.backends();
        if !backends.iter().any(|b| b.has_tracked_items()) {
            return Ok(());
        }

        // Eagerly persisted values were logged under the original ID;
        // the commit proper runs under a fresh one.
        self.inner.logger.lock().rotate_for_commit();

        self.log(CommitStep::LockTrackedItems, Vec::new())?;
        for backend in &backends {
            backend.lock_tracked_items(self.inner.max_time)?;
        }

        for backend in &backends {
            backend.classify();
        }
        let mut nodes_keys = self.build_node_lock_keys(&backends);

        let deadline = Instant::now() + self.inner.max_time;
        let mut needs_refetch = false;
        let (roots, updated, removed) = loop {
            if Instant::now() >= deadline {
                return Err(Error::timeout(self.inner.max_time, "node lock acquisition"));
            }
            let (ok, _) = self
                .inner
                .cache
                .dual_lock(self.inner.max_time, &mut nodes_keys)?;
            if !ok {
                self.inner.cache.unlock(&nodes_keys)?;
                for key in &mut nodes_keys {
                    key.is_lock_owner = false;
                }
                needs_refetch = true;
                self.random_sleep(deadline);
                continue;
            }
            if !self.inner.cache.is_locked(&nodes_keys)? {
                self.random_sleep(deadline);
                continue;
            }
            if needs_refetch {
                self.inner.cache.unlock(&nodes_keys)?;
                for backend in &backends {
                    // Drop the item locks before the tracker state is
                    // snapshotted away, then replay and re-lock.
                    backend.unlock_tracked_items()?;
                    backend.refetch_and_merge()?;
                    backend.lock_tracked_items(self.inner.max_time)?;
                    backend.classify();
                }
                nodes_keys = self.build_node_lock_keys(&backends);
                needs_refetch = false;
                continue;
            }

            // Item values first: their blobs are addressed by item ID
            // and carry no conflict risk of their own.
            let value_rollback: Vec<BlobsIds> = backends
                .iter()
                .flat_map(|b| b.rollback_tracked_items_values())
                .collect();
            self.log(
                CommitStep::CommitTrackedItemsValues,
                bincode::serialize(&value_rollback)?,
            )?;
            for backend in &backends {
                backend.commit_tracked_items_values()?;
            }
            self.inner.logger.lock().remove_pre_commit_log();

            // New roots.
            let root_ids: Vec<NodesPayload> =
                backends.iter().map(|b| b.new_root_ids()).collect();
            self.log(CommitStep::CommitNewRootNodes, bincode::serialize(&root_ids)?)?;
            let Some(roots) = self.commit_class(&backends, NodeClass::Root)? else {
                needs_refetch = true;
                continue;
            };

            // Fetched node versions.
            self.log(CommitStep::AreFetchedItemsIntact, Vec::new())?;
            let mut intact = true;
            for backend in &backends {
                if !backend.are_fetched_items_intact()? {
                    intact = false;
                    break;
                }
            }
            if !intact {
                self.undo_staged_roots(&roots)?;
                needs_refetch = true;
                continue;
            }

            // Updated nodes; logged after the call, once the staged
            // (inactive) blob IDs exist.
            let updated = match self.commit_class(&backends, NodeClass::Updated)? {
                Some(updated) => updated,
                None => {
                    self.undo_staged_roots(&roots)?;
                    needs_refetch = true;
                    continue;
                }
            };
            self.log(CommitStep::CommitUpdatedNodes, bincode::serialize(&updated)?)?;

            // Removed nodes.
            let removed_ids: Vec<NodesPayload> =
                backends.iter().map(|b| b.removed_node_ids()).collect();
            self.log(CommitStep::CommitRemovedNodes, bincode::serialize(&removed_ids)?)?;
            match self.commit_class(&backends, NodeClass::Removed)? {
                Some(removed) => break (roots, updated, removed),
                None => {
                    rollback_updated_nodes(&self.storage_services(), &updated, true)?;
                    self.undo_staged_roots(&roots)?;
                    needs_refetch = true;
                    continue;
                }
            }
        };

        // Added nodes carry fresh IDs; no conflict path, no retry.
        let added_ids: Vec<NodesPayload> = backends.iter().map(|b| b.added_node_ids()).collect();
        self.log(CommitStep::CommitAddedNodes, bincode::serialize(&added_ids)?)?;
        let mut added = Vec::with_capacity(backends.len());
        for backend in &backends {
            added.push(backend.commit_added_nodes()?);
        }

        // Store counters, logged with the inverse deltas for rollback.
        let mut commit_stores = Vec::with_capacity(backends.len());
        let mut rollback_stores = Vec::with_capacity(backends.len());
        for backend in &backends {
            let (commit, rollback) = backend.store_info_for_commit();
            commit_stores.push(commit);
            rollback_stores.push(rollback);
        }
        self.log(CommitStep::CommitStoreInfo, bincode::serialize(&rollback_stores)?)?;
        self.inner.store_repository.update(commit_stores.clone())?;

        self.log(CommitStep::BeforeFinalize, Vec::new())?;

        // Prepare the publish images.
        let updated_final = activate_inactive_nodes(&updated);
        let removed_final = touch_nodes(&removed);

        // Last look at the item locks before we promise durability.
        for backend in &backends {
            backend.check_tracked_items()?;
        }

        let obsolete_value_blobs: Vec<BlobsIds> = backends
            .iter()
            .flat_map(|b| b.obsolete_tracked_items_values())
            .collect();
        *self.inner.staged.lock() = StagedCommit {
            has_changes: true,
            root_handles: roots,
            added_handles: added,
            updated_final,
            removed_final,
            commit_stores,
            obsolete_value_blobs,
        };
        *self.inner.nodes_keys.lock() = nodes_keys;
        Ok(())
    }

    /// Run one per-class commit across every backend. `None` means some
    /// backend conflicted; whatever earlier backends staged for this
    /// class is rolled back (with the class's own inverse) before the
    /// retry.
    fn commit_class(
        &self,
        backends: &[Arc<dyn CommitBackend>],
        class: NodeClass,
    ) -> Result<Option<Vec<HandlesPayload>>> {
        let mut staged = Vec::with_capacity(backends.len());
        for backend in backends {
            let outcome = match class {
                NodeClass::Root => backend.commit_new_root_nodes()?,
                NodeClass::Updated => backend.commit_updated_nodes()?,
                NodeClass::Removed => backend.commit_removed_nodes()?,
            };
            match outcome {
                Some(payload) => staged.push(payload),
                None => {
                    self.undo_partial_class(class, &staged)?;
                    return Ok(None);
                }
            }
        }
        Ok(Some(staged))
    }

    fn undo_partial_class(&self, class: NodeClass, staged: &[HandlesPayload]) -> Result<()> {
        if staged.iter().all(|p| p.handles.is_empty()) {
            return Ok(());
        }
        let services = self.storage_services();
        match class {
            NodeClass::Root => {
                rollback_new_root_nodes(&services, &handles_to_nodes_payloads(staged), true)
            }
            NodeClass::Updated => rollback_updated_nodes(&services, staged, true),
            NodeClass::Removed => {
                rollback_removed_nodes(&services, &handles_to_nodes_payloads(staged), true)
            }
        }
    }

    fn undo_staged_roots(&self, roots: &[HandlesPayload]) -> Result<()> {
        let payloads = handles_to_nodes_payloads(roots);
        if payloads.iter().all(|p| p.ids.is_empty()) {
            return Ok(());
        }
        rollback_new_root_nodes(&self.storage_services(), &payloads, true)
    }

    fn commit_for_reader_transaction(&self) -> Result<()> {
        let backends = self.backends();
        let deadline = Instant::now() + self.inner.max_time;
        loop {
            let mut intact = true;
            for backend in &backends {
                if !backend.reader_nodes_intact()? {
                    intact = false;
                    backend.refetch_and_merge()?;
                }
            }
            if intact {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout(self.inner.max_time, "reader validation"));
            }
        }
    }

    // -----------------------------------------------------------------
    // Phase two helpers
    // -----------------------------------------------------------------

    fn replicate_fan_out(&self, staged: &StagedCommit) {
        let registry = self.inner.registry.clone();
        let store_repository = self.inner.store_repository.clone();
        let priority_log = self.inner.log.priority_log();

        let roots: Vec<RegistryPayload<Handle>> = staged
            .root_handles
            .iter()
            .map(HandlesPayload::registry_payload)
            .collect();
        let added: Vec<RegistryPayload<Handle>> = staged
            .added_handles
            .iter()
            .map(HandlesPayload::registry_payload)
            .collect();
        let updated: Vec<RegistryPayload<Handle>> = staged
            .updated_final
            .iter()
            .map(HandlesPayload::registry_payload)
            .collect();
        let removed: Vec<RegistryPayload<Handle>> = staged
            .removed_final
            .iter()
            .map(HandlesPayload::registry_payload)
            .collect();
        let stores = staged.commit_stores.clone();

        std::thread::scope(|scope| {
            let (roots_a, added_a, updated_a, removed_a) =
                (roots.clone(), added.clone(), updated.clone(), removed.clone());
            scope.spawn(move || {
                if let Err(e) = registry.replicate(roots_a, added_a, updated_a, removed_a) {
                    warn!(target: "sop::txn", error = %e, "registry replication failed");
                    notify_replication_error(&e, true);
                }
            });
            let stores_a = stores.clone();
            scope.spawn(move || {
                if let Err(e) = store_repository.replicate(stores_a) {
                    warn!(target: "sop::txn", error = %e, "store replication failed");
                    notify_replication_error(&e, true);
                }
            });
            scope.spawn(move || {
                if let Err(e) = priority_log.log_commit_changes(stores, roots, added, updated, removed)
                {
                    warn!(target: "sop::txn", error = %e, "commit change logging failed");
                }
            });
        });
    }

    // -----------------------------------------------------------------
    // Shared plumbing
    // -----------------------------------------------------------------

    fn build_node_lock_keys(&self, backends: &[Arc<dyn CommitBackend>]) -> Vec<LockKey> {
        let mut ids: Vec<Uid> = backends.iter().flat_map(|b| b.locked_node_ids()).collect();
        ids.sort();
        ids.dedup();
        create_lock_keys_for_ids(self.id(), &ids)
    }

    fn release_all_locks(&self) {
        let nodes_keys = std::mem::take(&mut *self.inner.nodes_keys.lock());
        if !nodes_keys.is_empty() {
            if let Err(e) = self.inner.cache.unlock(&nodes_keys) {
                warn!(target: "sop::txn", error = %e, "node lock release failed");
            }
        }
        for backend in self.backends() {
            if let Err(e) = backend.unlock_tracked_items() {
                warn!(target: "sop::txn", error = %e, "item lock release failed");
            }
        }
    }

    fn end_session(&self) {
        for backend in self.backends() {
            backend.clear_session();
        }
    }

    fn fire_commit_hooks(&self) {
        let hooks = std::mem::take(&mut *self.inner.on_commit.lock());
        for hook in hooks {
            hook();
        }
    }

    fn random_sleep(&self, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(20..=120));
        std::thread::sleep(remaining.min(jitter));
    }

    fn log(&self, step: CommitStep, payload: Vec<u8>) -> Result<()> {
        self.inner.logger.lock().log(step, payload)
    }

    fn backends(&self) -> Vec<Arc<dyn CommitBackend>> {
        self.inner.backends.lock().clone()
    }

    fn scheduler(&self) -> Arc<IdleScheduler> {
        self.inner.scheduler.lock().clone()
    }

    fn storage_services(&self) -> StorageServices {
        StorageServices {
            registry: self.inner.registry.clone(),
            blob_store: self.inner.blob_store.clone(),
            cache: self.inner.cache.clone(),
        }
    }

    fn recovery_services(&self) -> RecoveryServices {
        RecoveryServices {
            registry: self.inner.registry.clone(),
            blob_store: self.inner.blob_store.clone(),
            cache: self.inner.cache.clone(),
            store_repository: self.inner.store_repository.clone(),
            log: self.inner.log.clone(),
        }
    }

    fn expect_state(&self, expected: TransactionState, action: &str) -> Result<()> {
        let state = *self.inner.state.lock();
        if state != expected {
            return Err(Error::InvalidState(format!(
                "{} requires state {:?}, transaction is {:?}",
                action, expected, state
            )));
        }
        Ok(())
    }

    fn set_state(&self, state: TransactionState) {
        *self.inner.state.lock() = state;
    }

    // Internal accessors for B-Tree binding.

    pub(crate) fn ensure_active(&self) -> Result<()> {
        match *self.inner.state.lock() {
            TransactionState::Begun => Ok(()),
            TransactionState::New => Err(Error::Config(
                "transaction has not begun".to_string(),
            )),
            _ => Err(Error::Config("transaction is not active".to_string())),
        }
    }

    pub(crate) fn is_for_writing(&self) -> bool {
        self.inner.mode == TransactionMode::ForWriting
    }

    pub(crate) fn registry(&self) -> Arc<dyn Registry> {
        self.inner.registry.clone()
    }

    pub(crate) fn blob_store(&self) -> Arc<dyn BlobStore> {
        self.inner.blob_store.clone()
    }

    pub(crate) fn cache(&self) -> Arc<dyn Cache> {
        self.inner.cache.clone()
    }

    pub(crate) fn logger(&self) -> SharedLogger {
        self.inner.logger.clone()
    }

    pub(crate) fn register_backend(&self, backend: Arc<dyn CommitBackend>) {
        self.inner.backends.lock().push(backend);
    }
}

fn handles_to_nodes_payloads(staged: &[HandlesPayload]) -> Vec<NodesPayload> {
    staged
        .iter()
        .map(|p| NodesPayload {
            registry_table: p.registry_table.clone(),
            blob_table: p.blob_table.clone(),
            ids: p.logical_ids(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sop_durability::MemoryTransactionLog;
    use sop_storage::{MemoryBlobStore, MemoryCache, MemoryRegistry, MemoryStoreRepository};

    fn transaction(mode: TransactionMode) -> Transaction {
        new_two_phase_commit_transaction(
            mode,
            Some(Duration::from_secs(5)),
            true,
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryStoreRepository::new()),
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryTransactionLog::new()),
        )
    }

    #[test]
    fn test_max_time_defaults_and_caps() {
        let t = new_two_phase_commit_transaction(
            TransactionMode::ForWriting,
            None,
            false,
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryStoreRepository::new()),
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryTransactionLog::new()),
        );
        assert_eq!(t.max_time(), DEFAULT_MAX_TIME);

        let t = new_two_phase_commit_transaction(
            TransactionMode::ForWriting,
            Some(Duration::from_secs(10 * 60 * 60)),
            false,
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryStoreRepository::new()),
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryTransactionLog::new()),
        );
        assert_eq!(t.max_time(), MAX_MAX_TIME);
    }

    #[test]
    fn test_state_machine_guards() {
        let t = transaction(TransactionMode::ForWriting);
        assert!(!t.has_begun());
        // Phase one before begin is rejected.
        assert!(matches!(
            t.phase_1_commit(),
            Err(Error::InvalidState(_))
        ));

        t.begin().unwrap();
        assert!(t.has_begun());
        assert!(t.begin().is_err(), "double begin rejected");

        // Phase two before phase one is rejected.
        assert!(matches!(
            t.phase_2_commit(),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_empty_writer_commit_succeeds() {
        let t = transaction(TransactionMode::ForWriting);
        t.begin().unwrap();
        t.commit().unwrap();
        assert!(!t.has_begun());
        // Terminal: nothing more is allowed.
        assert!(t.rollback(None).is_err());
    }

    #[test]
    fn test_no_check_commit_is_immediate() {
        let t = transaction(TransactionMode::NoCheck);
        t.begin().unwrap();
        t.commit().unwrap();
    }

    #[test]
    fn test_on_commit_hook_fires_only_on_commit() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let fired = Arc::new(AtomicUsize::new(0));

        let t = transaction(TransactionMode::ForWriting);
        let observed = fired.clone();
        t.on_commit(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        t.begin().unwrap();
        t.commit().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let t = transaction(TransactionMode::ForWriting);
        let observed = fired.clone();
        t.on_commit(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        t.begin().unwrap();
        t.rollback(None).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1, "no hook after rollback");
    }

    #[test]
    fn test_close_rolls_back_open_transaction() {
        let t = transaction(TransactionMode::ForWriting);
        t.begin().unwrap();
        t.close().unwrap();
        assert!(!t.has_begun());
        // Closing an ended transaction is a no-op.
        t.close().unwrap();
    }
}
