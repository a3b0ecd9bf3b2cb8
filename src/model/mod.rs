//! Core data types shared by every tier and the orchestrator facade.

mod patch;
mod snapshot;

pub use patch::{validate_patch_buffers, AuthPatch};
pub use snapshot::{AuthSnapshot, KeyBundle, KeyId, KeyType, Value};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, non-empty session identifier. Serves as the primary key in both
/// tiers and as the outbox partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a raw string, rejecting the empty identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, crate::error::StoreError> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::error::StoreError::Validation(
                "session id must not be empty".into(),
            ));
        }
        Ok(Self(id))
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

/// A value wrapped with its monotonic version and last-write instant.
///
/// For a given [`SessionId`], `version` is strictly increasing across
/// successful writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Versioned<T> {
    /// The wrapped value.
    pub data: T,
    /// Monotonic, non-negative version number.
    pub version: u64,
    /// Instant of the write that produced this version.
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Result of a successful write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VersionedResult {
    /// The version assigned to the write.
    pub version: u64,
    /// Instant the write was applied.
    pub updated_at: chrono::DateTime<chrono::Utc>,
    /// Always `true` on the `Ok` path; kept for parity with the wire
    /// contract other components deserialize against.
    pub success: bool,
}

/// Independently readable `(version, updated_at)` companion to a
/// [`Versioned<AuthSnapshot>`], used by the cache-warming protocol so it
/// can check freshness without deserializing the full snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VersionMeta {
    /// Version of the associated record.
    pub version: u64,
    /// Last-write instant of the associated record.
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of a batch delete: which ids succeeded and which failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchDeleteResult {
    /// Ids that were deleted (or already absent) successfully.
    pub successful: Vec<SessionId>,
    /// Ids that failed, paired with a short error description.
    pub failed: Vec<(SessionId, String)>,
}
