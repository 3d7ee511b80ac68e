//! Foundational identifier types.
//!
//! Every object the engine manages (nodes, items, value blobs,
//! transactions) is addressed by a `Uid`, a 128-bit unique identifier
//! with a nil sentinel. `Uid`s are totally ordered so callers can use
//! them for deterministic tie-breaks.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 128-bit unique identifier used for logical IDs, physical (blob) IDs
/// and transaction IDs.
///
/// A `Uid` is a wrapper around a UUID v4. `Uid::NIL` is the sentinel for
/// "no ID"; freshly generated values are never nil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(Uuid);

impl Uid {
    /// The nil sentinel (all-zero UUID).
    pub const NIL: Uid = Uid(Uuid::nil());

    /// Create a new random Uid using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a Uid from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse a Uid from its canonical string form.
    ///
    /// Returns `None` if the string is not a valid UUID.
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Check whether this is the nil sentinel.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Get the raw bytes of this Uid.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for Uid {
    fn default() -> Self {
        Uid::NIL
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Used for work-in-progress timestamps on handles and for log
/// bucketing.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
