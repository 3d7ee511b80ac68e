//! Transaction engine for SOP.
//!
//! This crate orchestrates the storage collaborators into a
//! transactional B-Tree:
//! - `transaction`: the two-phase commit coordinator
//! - `btree`: the transaction-bound B-Tree collaborator
//! - `recovery`: idle-time dead-transaction cleanup and cache-restart
//!   sweeps
//!
//! Internally, each bound B-Tree contributes a node repository (its
//! transactional view of nodes) and an item action tracker (its
//! per-item intent table); the coordinator drives both through a
//! type-erased backend so one transaction can span B-Trees of different
//! key/value types.

#![warn(clippy::all)]

mod backend;
pub mod btree;
mod item_tracker;
mod logger;
mod node_repository;
pub mod recovery;
pub mod transaction;

pub use btree::{new_btree, open_btree, Btree};
pub use recovery::{
    acquire_locks, default_scheduler, do_priority_rollbacks, handle_registry_sector_lock_timeout,
    priority_rollback, IdleScheduler, RecoveryServices, PRIORITY_BATCH_SIZE,
};
pub use transaction::{
    new_two_phase_commit_transaction, set_replication_error_handler, Transaction, TransactionMode,
    DEFAULT_MAX_TIME, MAX_MAX_TIME,
};
