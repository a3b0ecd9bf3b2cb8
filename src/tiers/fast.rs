//! Fast-tier (cache) store: optimistic CAS with an independently readable
//! meta record for the cache-warming protocol.
//!
//! Grounded on the multi-tier cache's `LruCache`: a `DashMap` holding an
//! entry plus access metadata, generalized from hit-count promotion to the
//! CAS-and-TTL contract the orchestrator needs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{StorageKind, StoreError, StoreResult};
use crate::model::{AuthPatch, AuthSnapshot, SessionId, Versioned, VersionMeta, VersionedResult};

use super::Tier;

struct Entry {
    snapshot: AuthSnapshot,
    version: u64,
    updated_at: chrono::DateTime<chrono::Utc>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Fast-tier contract: CAS writes, independently-readable version meta,
/// and the usual delete/touch/exists/health surface.
#[async_trait]
pub trait FastTier: Tier {
    /// Read just `(version, updated_at)`, without deserializing the full
    /// snapshot. Used by the cache-warming TOCTOU protocol.
    async fn get_meta(&self, id: &SessionId) -> StoreResult<Option<VersionMeta>>;

    /// Install `snapshot` at exactly `version`, unless the stored version
    /// has already reached or passed it. Unlike [`Tier::set`]'s CAS, this
    /// does not require the caller to know the exact predecessor version —
    /// only that it isn't overwriting a newer write. Used by cache warming,
    /// where the candidate version comes from a durable read that may be
    /// stale by the time it lands.
    async fn warm(
        &self,
        id: &SessionId,
        snapshot: AuthSnapshot,
        version: u64,
        updated_at: chrono::DateTime<chrono::Utc>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;
}

/// In-process fast tier backed by a concurrent hash map.
pub struct InMemoryFastTier {
    entries: DashMap<SessionId, Mutex<Entry>>,
    connected: AtomicBool,
    default_ttl: Duration,
}

impl InMemoryFastTier {
    /// Build an empty fast tier; `default_ttl` applies to writes that
    /// don't specify one explicitly.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            connected: AtomicBool::new(false),
            default_ttl,
        }
    }

    fn require_connected(&self) -> StoreResult<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::storage(StorageKind::Fast, "not connected"))
        }
    }
}

#[async_trait]
impl Tier for InMemoryFastTier {
    async fn get(&self, id: &SessionId) -> StoreResult<Option<Versioned<AuthSnapshot>>> {
        self.require_connected()?;
        let Some(slot) = self.entries.get(id) else {
            return Ok(None);
        };
        let entry = slot.lock();
        if entry.is_expired() {
            drop(entry);
            drop(slot);
            self.entries.remove(id);
            return Ok(None);
        }
        Ok(Some(Versioned {
            data: entry.snapshot.clone(),
            version: entry.version,
            updated_at: entry.updated_at,
        }))
    }

    async fn set(
        &self,
        id: &SessionId,
        patch: AuthPatch,
        expected_version: Option<u64>,
        ttl: Option<Duration>,
    ) -> StoreResult<VersionedResult> {
        self.require_connected()?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = Some(Instant::now() + ttl);

        let slot = self
            .entries
            .entry(id.clone())
            .or_insert_with(|| {
                Mutex::new(Entry {
                    snapshot: AuthSnapshot::empty(),
                    version: 0,
                    updated_at: chrono::Utc::now(),
                    expires_at: None,
                })
            });
        let mut entry = slot.lock();
        if entry.is_expired() {
            entry.snapshot = AuthSnapshot::empty();
            entry.version = 0;
        }

        let stored_version = entry.version;
        if let Some(expected) = expected_version {
            if expected != stored_version {
                return Err(StoreError::VersionMismatch {
                    expected: Some(expected),
                    actual: stored_version,
                });
            }
        }

        let new_version = stored_version.max(expected_version.unwrap_or(stored_version)) + 1;
        entry.snapshot.apply_patch(patch);
        entry.version = new_version;
        entry.updated_at = chrono::Utc::now();
        entry.expires_at = expires_at;

        Ok(VersionedResult {
            version: entry.version,
            updated_at: entry.updated_at,
            success: true,
        })
    }

    async fn delete(&self, id: &SessionId) -> StoreResult<()> {
        self.require_connected()?;
        self.entries.remove(id);
        Ok(())
    }

    async fn touch(&self, id: &SessionId, ttl: Option<Duration>) -> StoreResult<()> {
        self.require_connected()?;
        if let Some(slot) = self.entries.get(id) {
            let mut entry = slot.lock();
            entry.expires_at = Some(Instant::now() + ttl.unwrap_or(self.default_ttl));
        }
        Ok(())
    }

    async fn exists(&self, id: &SessionId) -> StoreResult<bool> {
        self.require_connected()?;
        Ok(self
            .entries
            .get(id)
            .is_some_and(|slot| !slot.lock().is_expired()))
    }

    async fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn connect(&self) -> StoreResult<()> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl FastTier for InMemoryFastTier {
    async fn get_meta(&self, id: &SessionId) -> StoreResult<Option<VersionMeta>> {
        self.require_connected()?;
        let Some(slot) = self.entries.get(id) else {
            return Ok(None);
        };
        let entry = slot.lock();
        if entry.is_expired() {
            return Ok(None);
        }
        Ok(Some(VersionMeta {
            version: entry.version,
            updated_at: entry.updated_at,
        }))
    }

    async fn warm(
        &self,
        id: &SessionId,
        snapshot: AuthSnapshot,
        version: u64,
        updated_at: chrono::DateTime<chrono::Utc>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.require_connected()?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = Some(Instant::now() + ttl);

        let slot = self.entries.entry(id.clone()).or_insert_with(|| {
            Mutex::new(Entry {
                snapshot: AuthSnapshot::empty(),
                version: 0,
                updated_at: chrono::Utc::now(),
                expires_at: None,
            })
        });
        let mut entry = slot.lock();
        if !entry.is_expired() && entry.version >= version {
            return Ok(false);
        }
        entry.snapshot = snapshot;
        entry.version = version;
        entry.updated_at = updated_at;
        entry.expires_at = expires_at;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier() -> InMemoryFastTier {
        InMemoryFastTier::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let fast = tier();
        fast.connect().await.unwrap();
        let id = SessionId::new("s1").unwrap();
        let result = fast.set(&id, AuthPatch::empty(), None, None).await.unwrap();
        assert_eq!(result.version, 1);
        let got = fast.get(&id).await.unwrap().unwrap();
        assert_eq!(got.version, 1);
    }

    #[tokio::test]
    async fn cas_rejects_stale_expected_version() {
        let fast = tier();
        fast.connect().await.unwrap();
        let id = SessionId::new("s1").unwrap();
        fast.set(&id, AuthPatch::empty(), None, None).await.unwrap();
        let err = fast
            .set(&id, AuthPatch::empty(), Some(0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionMismatch { expected: Some(0), actual: 1 }));
    }

    #[tokio::test]
    async fn versions_strictly_increase() {
        let fast = tier();
        fast.connect().await.unwrap();
        let id = SessionId::new("s1").unwrap();
        let first = fast.set(&id, AuthPatch::empty(), None, None).await.unwrap();
        let second = fast
            .set(&id, AuthPatch::empty(), Some(first.version), None)
            .await
            .unwrap();
        assert!(second.version > first.version);
    }

    #[tokio::test]
    async fn delete_then_get_returns_none() {
        let fast = tier();
        fast.connect().await.unwrap();
        let id = SessionId::new("s1").unwrap();
        fast.set(&id, AuthPatch::empty(), None, None).await.unwrap();
        fast.delete(&id).await.unwrap();
        assert!(fast.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_meta_matches_get() {
        let fast = tier();
        fast.connect().await.unwrap();
        let id = SessionId::new("s1").unwrap();
        fast.set(&id, AuthPatch::empty(), None, None).await.unwrap();
        let meta = fast.get_meta(&id).await.unwrap().unwrap();
        let full = fast.get(&id).await.unwrap().unwrap();
        assert_eq!(meta.version, full.version);
    }

    #[tokio::test]
    async fn warm_installs_snapshot_when_absent() {
        let fast = tier();
        fast.connect().await.unwrap();
        let id = SessionId::new("s1").unwrap();
        let installed = fast
            .warm(&id, AuthSnapshot::empty(), 5, chrono::Utc::now(), None)
            .await
            .unwrap();
        assert!(installed);
        assert_eq!(fast.get_meta(&id).await.unwrap().unwrap().version, 5);
    }

    #[tokio::test]
    async fn warm_is_swallowed_when_stored_version_is_newer() {
        let fast = tier();
        fast.connect().await.unwrap();
        let id = SessionId::new("s1").unwrap();
        fast.set(&id, AuthPatch::empty(), None, None).await.unwrap();
        fast.set(&id, AuthPatch::empty(), Some(1), None).await.unwrap();
        let installed = fast
            .warm(&id, AuthSnapshot::empty(), 1, chrono::Utc::now(), None)
            .await
            .unwrap();
        assert!(!installed);
        assert_eq!(fast.get_meta(&id).await.unwrap().unwrap().version, 2);
    }
}
