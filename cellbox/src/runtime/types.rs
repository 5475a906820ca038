//! Core data types for box lifecycle management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use crate::litebox::{BoxState, BoxStatus};

// ============================================================================
// BOX ID
// ============================================================================

/// Opaque box identity, assigned once at creation.
///
/// Backed by a ULID, so ids sort by creation time. Lookups also accept any
/// unique prefix; [`short`](Self::short) is the prefix used for display.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoxID(String);

/// Characters shown by [`BoxID::short`].
const SHORT_ID_LEN: usize = 8;

impl BoxID {
    pub(crate) fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..SHORT_ID_LEN]
    }

    pub(crate) fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for BoxID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BoxID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoxID({})", self.short())
    }
}

// Registry maps are keyed by id but queried with the caller's string.
impl std::borrow::Borrow<str> for BoxID {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// BOX INFO
// ============================================================================

/// Public summary of a box (returned by list and inspect operations).
///
/// Plain structured data; rendering it for humans or machines is left to
/// the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxInfo {
    /// Unique box identifier (ULID).
    pub id: BoxID,

    /// User-defined name (optional).
    pub name: Option<String>,

    /// Current lifecycle status.
    pub status: BoxStatus,

    /// Creation timestamp (UTC).
    pub created_at: DateTime<Utc>,

    /// Last state change timestamp (UTC).
    pub last_updated: DateTime<Utc>,

    /// Image reference or rootfs path as submitted.
    pub image: String,

    /// Requested CPU count.
    pub cpus: u8,

    /// Requested memory ceiling in MiB.
    pub memory_mib: u32,
}
