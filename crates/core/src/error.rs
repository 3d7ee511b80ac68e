//! Error types for the SOP engine.
//!
//! One unified error enum crosses every crate boundary. Errors carry a
//! kind that callers can classify with the helper methods: conflicts
//! are retryable (refetch and merge, then try again), configuration and
//! not-found errors are not, and registry sector failures require an
//! upper-layer failover.

use crate::types::Uid;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for SOP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// What a registry sector failure is about: the lock key another live
/// transaction holds, or the transaction ID whose handles could not be
/// restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectorClaim {
    /// A lock key held by a competing owner.
    LockKey {
        /// The formatted lock key that could not be acquired.
        key: String,
        /// The competing owner's transaction ID, when known.
        owner: Option<Uid>,
    },
    /// The transaction whose registry handles are affected.
    Tid(Uid),
}

/// Error type for the SOP engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Optimistic concurrency conflict: version drift on a fetched node
    /// or item, a tracked-item lock held incompatibly, or repeated node
    /// lock failure. Retryable.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The commit retry loop or reader validation exceeded the
    /// transaction's maximum time.
    #[error("transaction timed out after {max_time:?}: {reason}")]
    Timeout {
        /// The configured bound that was exceeded.
        max_time: Duration,
        /// What was being waited for.
        reason: String,
    },

    /// Invalid store options, empty store name, or an operation against
    /// a transaction in the wrong state.
    #[error("configuration error: {0}")]
    Config(String),

    /// A named store (or an entity within it) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A registry sector is claimed by another (possibly dead)
    /// transaction, or restoring a sector's handles failed. The claim
    /// tells the upper layer what to fail over on.
    #[error("registry sector failure: {claim:?}")]
    RegistrySectorFailure {
        /// The offending lock key or transaction ID.
        claim: SectorClaim,
    },

    /// I/O failure from a cache, blob store, registry or log backend.
    #[error("backend error: {0}")]
    Backend(String),

    /// Failed to serialize or deserialize data.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation attempted in an invalid transaction state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Create a conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(max_time: Duration, reason: impl Into<String>) -> Self {
        Error::Timeout {
            max_time,
            reason: reason.into(),
        }
    }

    /// Create a registry sector failure carrying a lock key claim.
    pub fn sector_lock(key: impl Into<String>, owner: Option<Uid>) -> Self {
        Error::RegistrySectorFailure {
            claim: SectorClaim::LockKey {
                key: key.into(),
                owner,
            },
        }
    }

    /// Create a registry sector failure carrying a transaction ID.
    pub fn sector_tid(tid: Uid) -> Self {
        Error::RegistrySectorFailure {
            claim: SectorClaim::Tid(tid),
        }
    }

    /// Conflict-class errors (including timeouts of the retry loop) may
    /// succeed when the whole transaction is retried.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Timeout { .. })
    }

    /// Whether this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Whether this failure requires an upper-layer registry failover.
    pub fn is_sector_failure(&self) -> bool {
        matches!(self, Error::RegistrySectorFailure { .. })
    }

    /// The sector claim, when this is a sector failure.
    pub fn sector_claim(&self) -> Option<&SectorClaim> {
        match self {
            Error::RegistrySectorFailure { claim } => Some(claim),
            _ => None,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
