//! Transactional outbox: a per-session, per-version queue of pending
//! durable writes, plus a dead-letter container for entries that exhaust
//! their retry budget.
//!
//! Grounded on the event store's stream/version bookkeeping
//! (`append_events` with `expected_version`, ordered reads), generalized
//! from an append-only event log to a mutable-status work queue whose
//! entries transition `pending → processing → completed|failed`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::model::{AuthPatch, SessionId};

/// Retry budget before an entry is moved to the dead-letter container.
pub const MAX_ATTEMPTS: u32 = 3;
/// Outbox container TTL.
pub const CONTAINER_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
/// Grace period a `completed` entry stays visible before cleanup removes it.
pub const COMPLETED_GRACE: Duration = Duration::from_secs(3600);

/// Lifecycle state of an [`OutboxEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting for a reconciler attempt.
    Pending,
    /// A reconciler attempt is in flight.
    Processing,
    /// The durable write succeeded; scheduled for deletion.
    Completed,
    /// The most recent attempt failed; may be retried.
    Failed,
}

/// A pending (or recently settled) durable write for one `(sessionId,
/// version)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// `"{sessionId}:{version}"`, unique within the outbox.
    pub id: String,
    /// Session this entry belongs to.
    pub session_id: SessionId,
    /// The patch to apply durably.
    pub patch: AuthPatch,
    /// Version this entry produces once applied.
    pub version: u64,
    /// Fencing token carried through to the durable upsert, if any.
    pub fencing_token: Option<u64>,
    /// Current lifecycle state.
    pub status: OutboxStatus,
    /// Creation instant.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Last status-change instant.
    pub updated_at: chrono::DateTime<chrono::Utc>,
    /// Completion instant, once `status == Completed`.
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Number of reconciler attempts made so far.
    pub attempts: u32,
    /// Error from the most recent failed attempt, if any.
    pub last_error: Option<String>,
}

/// Immutable record of a terminally failed entry, retained for operator
/// inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Unique id for this dead-letter record, independent of the original
    /// outbox entry id, so operator tooling can reference a record even
    /// after its originating session has been deleted.
    pub id: uuid::Uuid,
    /// Owning session.
    pub session_id: SessionId,
    /// Original entry id.
    pub entry_id: String,
    /// Version the entry was attempting to reach.
    pub version: u64,
    /// The patch that could not be durably applied.
    pub patch: AuthPatch,
    /// Fencing token, if any.
    pub fencing_token: Option<u64>,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// The final error.
    pub last_error: String,
    /// When the entry was moved to dead-letter.
    pub failed_at: chrono::DateTime<chrono::Utc>,
    /// Original creation instant.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

fn entry_id(session_id: &SessionId, version: u64) -> String {
    format!("{session_id}:{version}")
}

/// In-process outbox: one bucket of entries per session, plus a shared
/// dead-letter list.
pub struct Outbox {
    containers: DashMap<SessionId, Mutex<BTreeMap<u64, OutboxEntry>>>,
    dead_letter: Mutex<Vec<DeadLetterRecord>>,
    dead_letter_len: AtomicUsize,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Outbox {
    /// An empty outbox.
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
            dead_letter: Mutex::new(Vec::new()),
            dead_letter_len: AtomicUsize::new(0),
        }
    }

    /// Idempotent insert: a second `add` for the same `(sessionId,
    /// version)` leaves the outbox unchanged.
    pub fn add(
        &self,
        session_id: &SessionId,
        patch: AuthPatch,
        version: u64,
        fencing_token: Option<u64>,
    ) -> StoreResult<()> {
        let container = self
            .containers
            .entry(session_id.clone())
            .or_insert_with(|| Mutex::new(BTreeMap::new()));
        let mut entries = container.lock();
        entries.entry(version).or_insert_with(|| {
            let now = chrono::Utc::now();
            OutboxEntry {
                id: entry_id(session_id, version),
                session_id: session_id.clone(),
                patch,
                version,
                fencing_token,
                status: OutboxStatus::Pending,
                created_at: now,
                updated_at: now,
                completed_at: None,
                attempts: 0,
                last_error: None,
            }
        });
        Ok(())
    }

    /// All entries eligible for a reconciler attempt (`pending`, or
    /// `failed` with retry budget remaining), ascending by version.
    pub fn get_pending(&self, session_id: &SessionId) -> Vec<OutboxEntry> {
        let Some(container) = self.containers.get(session_id) else {
            return Vec::new();
        };
        let pending = container
            .lock()
            .values()
            .filter(|entry| {
                entry.status == OutboxStatus::Pending
                    || (entry.status == OutboxStatus::Failed && entry.attempts < MAX_ATTEMPTS)
            })
            .cloned()
            .collect();
        pending
    }

    /// Every session currently holding at least one entry.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.containers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Mark `(sessionId, version)` `processing`, ahead of a reconciler
    /// attempt.
    pub fn mark_processing(&self, session_id: &SessionId, version: u64) {
        self.with_entry(session_id, version, |entry| {
            entry.status = OutboxStatus::Processing;
            entry.updated_at = chrono::Utc::now();
        });
    }

    /// Transition an entry to `completed`.
    pub fn mark_completed(&self, session_id: &SessionId, version: u64) {
        self.with_entry(session_id, version, |entry| {
            let now = chrono::Utc::now();
            entry.status = OutboxStatus::Completed;
            entry.updated_at = now;
            entry.completed_at = Some(now);
        });
    }

    /// Record a failed attempt: increments `attempts`, sets `failed`, and
    /// stores the error.
    pub fn mark_failed(&self, session_id: &SessionId, version: u64, error: &str) {
        self.with_entry(session_id, version, |entry| {
            entry.attempts += 1;
            entry.status = OutboxStatus::Failed;
            entry.updated_at = chrono::Utc::now();
            entry.last_error = Some(error.to_string());
        });
    }

    /// Move a terminally-failed entry to the dead-letter container and
    /// remove it from the live outbox.
    pub fn move_to_dead_letter(&self, session_id: &SessionId, entry: &OutboxEntry, error: &str) {
        let record = DeadLetterRecord {
            id: uuid::Uuid::new_v4(),
            session_id: session_id.clone(),
            entry_id: entry.id.clone(),
            version: entry.version,
            patch: entry.patch.clone(),
            fencing_token: entry.fencing_token,
            attempts: entry.attempts + 1,
            last_error: error.to_string(),
            failed_at: chrono::Utc::now(),
            created_at: entry.created_at,
        };
        self.dead_letter.lock().push(record);
        self.dead_letter_len.fetch_add(1, Ordering::Relaxed);

        if let Some(container) = self.containers.get(session_id) {
            container.lock().remove(&entry.version);
        }
    }

    /// Remove `completed` entries past their grace period. Safety net for
    /// missed per-entry deletion timers.
    pub fn cleanup(&self) {
        let now = chrono::Utc::now();
        for container in self.containers.iter() {
            let mut entries = container.lock();
            entries.retain(|_, entry| {
                !(entry.status == OutboxStatus::Completed
                    && entry
                        .completed_at
                        .map(|at| now.signed_duration_since(at).num_seconds() as u64)
                        .unwrap_or(0)
                        >= COMPLETED_GRACE.as_secs())
            });
        }
    }

    /// Most recent dead-letter records, newest first, capped at `limit`.
    pub fn get_dead_letter(&self, limit: usize) -> Vec<DeadLetterRecord> {
        let records = self.dead_letter.lock();
        records.iter().rev().take(limit).cloned().collect()
    }

    /// Number of dead-letter records retained.
    pub fn get_dead_letter_size(&self) -> usize {
        self.dead_letter_len.load(Ordering::Relaxed)
    }

    fn with_entry(&self, session_id: &SessionId, version: u64, f: impl FnOnce(&mut OutboxEntry)) {
        if let Some(container) = self.containers.get(session_id) {
            let mut entries = container.lock();
            if let Some(entry) = entries.get_mut(&version) {
                f(entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent() {
        let outbox = Outbox::new();
        let id = SessionId::new("s1").unwrap();
        outbox.add(&id, AuthPatch::empty(), 1, None).unwrap();
        outbox.add(&id, AuthPatch::empty(), 1, None).unwrap();
        assert_eq!(outbox.get_pending(&id).len(), 1);
    }

    #[test]
    fn get_pending_is_sorted_by_version() {
        let outbox = Outbox::new();
        let id = SessionId::new("s1").unwrap();
        outbox.add(&id, AuthPatch::empty(), 3, None).unwrap();
        outbox.add(&id, AuthPatch::empty(), 1, None).unwrap();
        outbox.add(&id, AuthPatch::empty(), 2, None).unwrap();
        let versions: Vec<u64> = outbox.get_pending(&id).iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn failed_entry_is_retried_until_max_attempts() {
        let outbox = Outbox::new();
        let id = SessionId::new("s1").unwrap();
        outbox.add(&id, AuthPatch::empty(), 1, None).unwrap();
        outbox.mark_failed(&id, 1, "transient");
        assert_eq!(outbox.get_pending(&id).len(), 1);
        outbox.mark_failed(&id, 1, "transient");
        outbox.mark_failed(&id, 1, "transient");
        assert_eq!(outbox.get_pending(&id).len(), 0);
    }

    #[test]
    fn move_to_dead_letter_removes_live_entry() {
        let outbox = Outbox::new();
        let id = SessionId::new("s1").unwrap();
        outbox.add(&id, AuthPatch::empty(), 1, None).unwrap();
        let entry = outbox.get_pending(&id).remove(0);
        outbox.move_to_dead_letter(&id, &entry, "exhausted retries");
        assert_eq!(outbox.get_pending(&id).len(), 0);
        assert_eq!(outbox.get_dead_letter_size(), 1);
    }
}
