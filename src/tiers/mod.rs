//! Fast-tier and durable-tier storage contracts and in-memory
//! implementations.

mod durable;
mod fast;

pub use durable::{DurableTier, InMemoryDurableTier};
pub use fast::{FastTier, InMemoryFastTier};

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreResult;
use crate::model::{AuthPatch, AuthSnapshot, SessionId, Versioned, VersionedResult};

/// Capability shared by both tiers: optimistic-CAS reads/writes, TTL
/// touch, existence check, and a health probe.
#[async_trait]
pub trait Tier: Send + Sync {
    /// Read the current snapshot, if any.
    async fn get(&self, id: &SessionId) -> StoreResult<Option<Versioned<AuthSnapshot>>>;

    /// Apply `patch` with optimistic concurrency control.
    async fn set(
        &self,
        id: &SessionId,
        patch: AuthPatch,
        expected_version: Option<u64>,
        ttl: Option<Duration>,
    ) -> StoreResult<VersionedResult>;

    /// Remove the record for `id`, if present.
    async fn delete(&self, id: &SessionId) -> StoreResult<()>;

    /// Extend the record's TTL without touching `version` or `data`.
    async fn touch(&self, id: &SessionId, ttl: Option<Duration>) -> StoreResult<()>;

    /// Whether a record exists for `id`.
    async fn exists(&self, id: &SessionId) -> StoreResult<bool>;

    /// Whether this tier can currently serve requests.
    async fn is_healthy(&self) -> bool;

    /// Establish the tier's backing connection.
    async fn connect(&self) -> StoreResult<()>;

    /// Release the tier's backing connection. Must not fail the caller;
    /// implementations log internally and always return `Ok`.
    async fn close(&self) -> StoreResult<()>;
}
