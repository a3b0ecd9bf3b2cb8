//! Crate-wide error taxonomy.
//!
//! Mirrors the layered error style used throughout the storage and cache
//! modules: each tier gets its own narrow error type, and the public facade
//! collapses them into [`StoreError`] with the cause chained via `#[from]`.

use thiserror::Error;

/// Which tier (or combination) produced a storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Fast-tier (cache) failure.
    Fast,
    /// Durable-tier (document store) failure.
    Durable,
    /// Failure spanning both tiers, or the connection lifecycle.
    Hybrid,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Fast => write!(f, "fast"),
            StorageKind::Durable => write!(f, "durable"),
            StorageKind::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Top-level error returned by every public operation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transient I/O failure in one of the tiers.
    #[error("{kind} storage error: {message}")]
    Storage {
        /// Which tier failed.
        kind: StorageKind,
        /// Human-readable detail, with the original cause folded in.
        message: String,
    },

    /// Optimistic-locking conflict: the caller's expected version is stale.
    #[error("version mismatch: expected {expected:?}, actual {actual}")]
    VersionMismatch {
        /// The version the caller expected, if any.
        expected: Option<u64>,
        /// The version actually stored.
        actual: u64,
    },

    /// The circuit breaker guarding the durable tier is open.
    #[error("circuit breaker is open")]
    BreakerOpen,

    /// A caller-supplied fencing token is older than the one already
    /// stored, meaning the caller is a previously evicted owner.
    #[error("fencing token stale: stored {stored}, provided {provided}")]
    FencingTokenStale {
        /// The fencing token currently stored for this session.
        stored: u64,
        /// The (stale) token the caller supplied.
        provided: u64,
    },

    /// A call exceeded its configured timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Malformed input at an API boundary (bad patch, bad config value).
    #[error("validation error: {0}")]
    Validation(String),

    /// Invalid `HybridConfig`.
    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Build a [`StoreError::Storage`] wrapping an arbitrary cause.
    pub fn storage(kind: StorageKind, cause: impl std::fmt::Display) -> Self {
        StoreError::Storage {
            kind,
            message: cause.to_string(),
        }
    }
}

/// Result alias used throughout the crate.
pub type StoreResult<T> = Result<T, StoreError>;
