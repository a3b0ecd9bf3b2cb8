//! External job queue boundary consumed by the write-behind path.
//!
//! The queue itself is out of scope (consumed, not defined) — this module
//! only carries the trait contract plus two test/demo adapters.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{StorageKind, StoreError, StoreResult};
use crate::model::{AuthPatch, SessionId};

/// Payload shape for persistence jobs enqueued by the write-behind path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceJob {
    /// Session the job applies to.
    pub session_id: SessionId,
    /// Patch to apply durably.
    pub patch: AuthPatch,
    /// Version this job produces.
    pub version: u64,
    /// Fencing token, if any.
    pub fencing_token: Option<u64>,
    /// Enqueue instant.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// External job queue, consumed by the orchestrator's write-behind path.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Enqueue `payload` under `job_name`.
    async fn add(&self, job_name: &str, payload: PersistenceJob) -> StoreResult<()>;

    /// Close the queue connection. Must not fail the caller.
    async fn close(&self) -> StoreResult<()>;
}

/// Always-fails adapter: exercises the write-behind fallback-to-direct-
/// write path in tests without standing up a real queue.
pub struct NullQueueAdapter;

#[async_trait]
impl QueueAdapter for NullQueueAdapter {
    async fn add(&self, _job_name: &str, _payload: PersistenceJob) -> StoreResult<()> {
        Err(StoreError::storage(StorageKind::Hybrid, "no queue configured"))
    }

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// In-process queue that records every job it receives, for tests and
/// local development.
#[derive(Default)]
pub struct InMemoryQueueAdapter {
    jobs: parking_lot::Mutex<Vec<(String, PersistenceJob)>>,
}

impl InMemoryQueueAdapter {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs received so far, in enqueue order.
    pub fn jobs(&self) -> Vec<(String, PersistenceJob)> {
        self.jobs.lock().clone()
    }
}

#[async_trait]
impl QueueAdapter for InMemoryQueueAdapter {
    async fn add(&self, job_name: &str, payload: PersistenceJob) -> StoreResult<()> {
        self.jobs.lock().push((job_name.to_string(), payload));
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}
