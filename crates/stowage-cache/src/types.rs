//! Results of cache operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of a cache save operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveResult {
    /// Key the archive was written under.
    pub key: String,
    /// Number of files archived.
    pub entries: u64,
    /// Uncompressed content bytes archived.
    pub bytes: u64,
    /// Time taken in milliseconds.
    pub duration_ms: u64,
}

/// Result of a cache restore operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResult {
    /// The key that was restored (may be a fallback key).
    pub matched_key: String,
    /// Whether the first, most specific key matched.
    pub exact_match: bool,
    /// When the restored object was last written.
    pub last_modified: DateTime<Utc>,
    /// Number of entries replayed.
    pub entries: u64,
    /// Content bytes written.
    pub bytes: u64,
    /// Time taken in milliseconds.
    pub duration_ms: u64,
}
