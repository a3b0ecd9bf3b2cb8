//! Durable-tier (document store) with codec-encoded fields, a TTL index,
//! and a short-lived read cache to absorb amplification.
//!
//! Grounded on the database cache layer's `CacheEntryMetadata`
//! (created/accessed/TTL bookkeeping) for the read cache, and on the cache
//! codec module's encode/decode contract for per-field serialization.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::sleep;

use crate::codec::Codec;
use crate::error::{StorageKind, StoreError, StoreResult};
use crate::model::{
    AuthPatch, AuthSnapshot, KeyBundle, KeyId, KeyType, SessionId, Versioned, VersionedResult,
};

use super::Tier;

/// Read-cache TTL: absorbs repeated reads without re-hitting the backing
/// store or re-running the codec.
const READ_CACHE_TTL: Duration = Duration::from_secs(5);

struct Record {
    version: u64,
    updated_at: chrono::DateTime<chrono::Utc>,
    creds_encoded: String,
    keys_encoded: BTreeMap<KeyType, BTreeMap<KeyId, String>>,
    app_state_encoded: Option<String>,
    fencing_token: Option<u64>,
    expires_at: Option<Instant>,
}

struct ReadCacheEntry {
    snapshot: Versioned<AuthSnapshot>,
    cached_at: Instant,
}

/// Durable-tier contract: same read/write/delete/touch/exists/health
/// shape as the fast tier, with lenient upsert semantics so a reconciler
/// retry or an out-of-order direct write never gets stuck behind a strict
/// CAS mismatch.
#[async_trait]
pub trait DurableTier: Tier {
    /// Upsert `patch` for `id`: allowed when the stored version is less
    /// than or equal to `expected_version`, or the record is absent.
    /// Retries internally on a simulated duplicate-key conflict using the
    /// configured backoff.
    ///
    /// `fencing_token`, when supplied, must be greater than or equal to
    /// the token already stored for `id`; a lower token means the caller
    /// is a previously evicted owner and the write is rejected with
    /// [`StoreError::FencingTokenStale`].
    async fn upsert(
        &self,
        id: &SessionId,
        patch: AuthPatch,
        expected_version: Option<u64>,
        fencing_token: Option<u64>,
        ttl: Option<Duration>,
    ) -> StoreResult<VersionedResult>;
}

/// In-process durable tier: a `DashMap` of codec-encoded records plus a
/// short-lived decoded-snapshot cache.
pub struct InMemoryDurableTier {
    records: DashMap<SessionId, Mutex<Record>>,
    read_cache: DashMap<SessionId, ReadCacheEntry>,
    codec: Arc<dyn Codec>,
    connected: AtomicBool,
    default_ttl: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
    retry_multiplier: f64,
}

impl InMemoryDurableTier {
    /// Build an empty durable tier using `codec` for per-field encoding.
    pub fn new(
        codec: Arc<dyn Codec>,
        default_ttl: Duration,
        max_retries: u32,
        retry_base_delay: Duration,
        retry_multiplier: f64,
    ) -> Self {
        Self {
            records: DashMap::new(),
            read_cache: DashMap::new(),
            codec,
            connected: AtomicBool::new(false),
            default_ttl,
            max_retries,
            retry_base_delay,
            retry_multiplier,
        }
    }

    fn require_connected(&self) -> StoreResult<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::storage(StorageKind::Durable, "not connected"))
        }
    }

    fn encode_snapshot(&self, snapshot: &AuthSnapshot) -> StoreResult<(String, BTreeMap<KeyType, BTreeMap<KeyId, String>>, Option<String>)> {
        let creds_bytes = serde_json::to_vec(&snapshot.creds)
            .map_err(|e| StoreError::storage(StorageKind::Durable, e))?;
        let creds_encoded = self.codec.encode(&creds_bytes)?;

        let mut keys_encoded = BTreeMap::new();
        for (key_type, inner) in &snapshot.keys {
            let mut inner_encoded = BTreeMap::new();
            for (key_id, bundle) in inner {
                let bytes = serde_json::to_vec(bundle)
                    .map_err(|e| StoreError::storage(StorageKind::Durable, e))?;
                inner_encoded.insert(key_id.clone(), self.codec.encode(&bytes)?);
            }
            keys_encoded.insert(key_type.clone(), inner_encoded);
        }

        let app_state_encoded = snapshot
            .app_state
            .as_ref()
            .map(|value| -> StoreResult<String> {
                let bytes = serde_json::to_vec(value)
                    .map_err(|e| StoreError::storage(StorageKind::Durable, e))?;
                self.codec.encode(&bytes)
            })
            .transpose()?;

        Ok((creds_encoded, keys_encoded, app_state_encoded))
    }

    fn decode_record(&self, record: &Record) -> StoreResult<AuthSnapshot> {
        let creds_bytes = self.codec.decode(&record.creds_encoded)?;
        let creds = serde_json::from_slice(&creds_bytes)
            .map_err(|e| StoreError::storage(StorageKind::Durable, e))?;

        let mut keys = BTreeMap::new();
        for (key_type, inner) in &record.keys_encoded {
            let mut inner_decoded: BTreeMap<KeyId, KeyBundle> = BTreeMap::new();
            for (key_id, encoded) in inner {
                let bytes = self.codec.decode(encoded)?;
                let bundle = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::storage(StorageKind::Durable, e))?;
                inner_decoded.insert(key_id.clone(), bundle);
            }
            keys.insert(key_type.clone(), inner_decoded);
        }

        let app_state = record
            .app_state_encoded
            .as_ref()
            .map(|encoded| -> StoreResult<_> {
                let bytes = self.codec.decode(encoded)?;
                serde_json::from_slice(&bytes).map_err(|e| StoreError::storage(StorageKind::Durable, e))
            })
            .transpose()?;

        Ok(AuthSnapshot {
            creds,
            keys,
            app_state,
        })
    }

    fn invalidate_read_cache(&self, id: &SessionId) {
        self.read_cache.remove(id);
    }

    async fn upsert_once(
        &self,
        id: &SessionId,
        patch: AuthPatch,
        expected_version: Option<u64>,
        fencing_token: Option<u64>,
        ttl: Option<Duration>,
    ) -> StoreResult<VersionedResult> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = Some(Instant::now() + ttl);

        let slot = self.records.entry(id.clone()).or_insert_with(|| {
            Mutex::new(Record {
                version: 0,
                updated_at: chrono::Utc::now(),
                creds_encoded: String::new(),
                keys_encoded: BTreeMap::new(),
                app_state_encoded: None,
                fencing_token: None,
                expires_at: None,
            })
        });
        let mut record = slot.lock();

        let existed = record.version > 0;
        let stored_version = record.version;
        if let Some(expected) = expected_version {
            if stored_version > expected {
                return Err(StoreError::VersionMismatch {
                    expected: Some(expected),
                    actual: stored_version,
                });
            }
        }
        if let (Some(provided), Some(stored)) = (fencing_token, record.fencing_token) {
            if provided < stored {
                return Err(StoreError::FencingTokenStale {
                    stored,
                    provided,
                });
            }
        }

        let mut snapshot = if existed {
            self.decode_record(&record)?
        } else {
            AuthSnapshot::empty()
        };
        snapshot.apply_patch(patch);

        let (creds_encoded, keys_encoded, app_state_encoded) = self.encode_snapshot(&snapshot)?;
        let new_version = stored_version.max(expected_version.unwrap_or(stored_version)) + 1;

        record.version = new_version;
        record.updated_at = chrono::Utc::now();
        record.creds_encoded = creds_encoded;
        record.keys_encoded = keys_encoded;
        record.app_state_encoded = app_state_encoded;
        if let Some(provided) = fencing_token {
            record.fencing_token = Some(provided);
        }
        record.expires_at = expires_at;

        let result = VersionedResult {
            version: record.version,
            updated_at: record.updated_at,
            success: true,
        };
        drop(record);
        self.invalidate_read_cache(id);
        Ok(result)
    }
}

#[async_trait]
impl Tier for InMemoryDurableTier {
    async fn get(&self, id: &SessionId) -> StoreResult<Option<Versioned<AuthSnapshot>>> {
        self.require_connected()?;

        if let Some(cached) = self.read_cache.get(id) {
            if cached.cached_at.elapsed() < READ_CACHE_TTL {
                return Ok(Some(cached.snapshot.clone()));
            }
        }

        let Some(slot) = self.records.get(id) else {
            return Ok(None);
        };
        let record = slot.lock();
        if record.version == 0 {
            return Ok(None);
        }
        if record.expires_at.is_some_and(|at| Instant::now() >= at) {
            drop(record);
            drop(slot);
            self.records.remove(id);
            return Ok(None);
        }
        let snapshot = Versioned {
            data: self.decode_record(&record)?,
            version: record.version,
            updated_at: record.updated_at,
        };
        drop(record);

        self.read_cache.insert(
            id.clone(),
            ReadCacheEntry {
                snapshot: snapshot.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(Some(snapshot))
    }

    async fn set(
        &self,
        id: &SessionId,
        patch: AuthPatch,
        expected_version: Option<u64>,
        ttl: Option<Duration>,
    ) -> StoreResult<VersionedResult> {
        self.upsert(id, patch, expected_version, None, ttl).await
    }

    async fn delete(&self, id: &SessionId) -> StoreResult<()> {
        self.require_connected()?;
        self.records.remove(id);
        self.invalidate_read_cache(id);
        Ok(())
    }

    async fn touch(&self, id: &SessionId, ttl: Option<Duration>) -> StoreResult<()> {
        self.require_connected()?;
        if let Some(slot) = self.records.get(id) {
            let mut record = slot.lock();
            record.expires_at = Some(Instant::now() + ttl.unwrap_or(self.default_ttl));
        }
        Ok(())
    }

    async fn exists(&self, id: &SessionId) -> StoreResult<bool> {
        self.require_connected()?;
        Ok(self
            .records
            .get(id)
            .is_some_and(|slot| slot.lock().version > 0))
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
impl DurableTier for InMemoryDurableTier {
    async fn upsert(
        &self,
        id: &SessionId,
        patch: AuthPatch,
        expected_version: Option<u64>,
        fencing_token: Option<u64>,
        ttl: Option<Duration>,
    ) -> StoreResult<VersionedResult> {
        self.require_connected()?;

        let mut delay = self.retry_base_delay;
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            match self
                .upsert_once(id, patch.clone(), expected_version, fencing_token, ttl)
                .await
            {
                Ok(result) => return Ok(result),
                Err(StoreError::VersionMismatch { expected, actual }) => {
                    // Not a transient conflict: the caller's expectation
                    // is genuinely stale, retrying won't help.
                    return Err(StoreError::VersionMismatch { expected, actual });
                }
                Err(err @ StoreError::FencingTokenStale { .. }) => {
                    // Also not transient: a lower fencing token will never
                    // become valid by retrying.
                    return Err(err);
                }
                Err(err) => {
                    last_err = Some(err);
                    if attempt == self.max_retries {
                        break;
                    }
                    sleep(delay).await;
                    delay = Duration::from_secs_f64(
                        delay.as_secs_f64() * self.retry_multiplier,
                    );
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            StoreError::storage(StorageKind::Durable, "upsert exhausted retries")
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NullCodec;

    fn tier() -> InMemoryDurableTier {
        InMemoryDurableTier::new(
            Arc::new(NullCodec),
            Duration::from_secs(3600),
            3,
            Duration::from_millis(1),
            2.0,
        )
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let durable = tier();
        durable.connect().await.unwrap();
        let id = SessionId::new("s1").unwrap();
        let result = durable
            .upsert(&id, AuthPatch::empty(), None, None, None)
            .await
            .unwrap();
        assert_eq!(result.version, 1);
        let got = durable.get(&id).await.unwrap().unwrap();
        assert_eq!(got.version, 1);
    }

    #[tokio::test]
    async fn upsert_allows_expected_version_ahead_of_stored() {
        let durable = tier();
        durable.connect().await.unwrap();
        let id = SessionId::new("s1").unwrap();
        durable
            .upsert(&id, AuthPatch::empty(), None, None, None)
            .await
            .unwrap();
        // stored version is 1; expecting 5 is allowed because 1 <= 5.
        let result = durable
            .upsert(&id, AuthPatch::empty(), Some(5), None, None)
            .await
            .unwrap();
        assert_eq!(result.version, 6);
    }

    #[tokio::test]
    async fn upsert_rejects_expected_version_behind_stored() {
        let durable = tier();
        durable.connect().await.unwrap();
        let id = SessionId::new("s1").unwrap();
        durable
            .upsert(&id, AuthPatch::empty(), Some(5), None, None)
            .await
            .unwrap();
        let err = durable
            .upsert(&id, AuthPatch::empty(), Some(0), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn upsert_rejects_fencing_token_older_than_stored() {
        let durable = tier();
        durable.connect().await.unwrap();
        let id = SessionId::new("s1").unwrap();
        durable
            .upsert(&id, AuthPatch::empty(), None, Some(5), None)
            .await
            .unwrap();
        let err = durable
            .upsert(&id, AuthPatch::empty(), None, Some(2), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::FencingTokenStale { stored: 5, provided: 2 }));
    }

    #[tokio::test]
    async fn delete_invalidates_read_cache() {
        let durable = tier();
        durable.connect().await.unwrap();
        let id = SessionId::new("s1").unwrap();
        durable
            .upsert(&id, AuthPatch::empty(), None, None, None)
            .await
            .unwrap();
        durable.get(&id).await.unwrap();
        durable.delete(&id).await.unwrap();
        assert!(durable.get(&id).await.unwrap().is_none());
    }
}
