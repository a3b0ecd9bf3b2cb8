//! Shared test fixtures: a durable tier that can be told to fail its next
//! N calls, or fail permanently, to drive breaker/reconciler/dead-letter
//! scenarios without a real backing store.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use authstore::error::{StorageKind, StoreError, StoreResult};
use authstore::model::{AuthPatch, AuthSnapshot, SessionId, Versioned, VersionedResult};
use authstore::tiers::{DurableTier, InMemoryDurableTier, Tier};

pub struct FlakyDurableTier {
    inner: InMemoryDurableTier,
    forced_failures_remaining: AtomicUsize,
    permanently_failing: AtomicBool,
}

impl FlakyDurableTier {
    pub fn new() -> Self {
        Self {
            inner: InMemoryDurableTier::new(
                Arc::new(authstore::codec::NullCodec),
                Duration::from_secs(3600),
                0,
                Duration::from_millis(1),
                1.0,
            ),
            forced_failures_remaining: AtomicUsize::new(0),
            permanently_failing: AtomicBool::new(false),
        }
    }

    pub fn fail_next(&self, count: usize) {
        self.forced_failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn fail_permanently(&self) {
        self.permanently_failing.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.permanently_failing.store(false, Ordering::SeqCst);
        self.forced_failures_remaining.store(0, Ordering::SeqCst);
    }

    fn should_fail(&self) -> bool {
        if self.permanently_failing.load(Ordering::SeqCst) {
            return true;
        }
        let mut remaining = self.forced_failures_remaining.load(Ordering::SeqCst);
        loop {
            if remaining == 0 {
                return false;
            }
            match self.forced_failures_remaining.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => remaining = actual,
            }
        }
    }

    fn fault() -> StoreError {
        StoreError::storage(StorageKind::Durable, "injected failure")
    }
}

impl Default for FlakyDurableTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tier for FlakyDurableTier {
    async fn get(&self, id: &SessionId) -> StoreResult<Option<Versioned<AuthSnapshot>>> {
        if self.should_fail() {
            return Err(Self::fault());
        }
        self.inner.get(id).await
    }

    async fn set(
        &self,
        id: &SessionId,
        patch: AuthPatch,
        expected_version: Option<u64>,
        ttl: Option<Duration>,
    ) -> StoreResult<VersionedResult> {
        if self.should_fail() {
            return Err(Self::fault());
        }
        self.inner.set(id, patch, expected_version, ttl).await
    }

    async fn delete(&self, id: &SessionId) -> StoreResult<()> {
        self.inner.delete(id).await
    }

    async fn touch(&self, id: &SessionId, ttl: Option<Duration>) -> StoreResult<()> {
        self.inner.touch(id, ttl).await
    }

    async fn exists(&self, id: &SessionId) -> StoreResult<bool> {
        self.inner.exists(id).await
    }

    async fn is_healthy(&self) -> bool {
        self.inner.is_healthy().await
    }

    async fn connect(&self) -> StoreResult<()> {
        self.inner.connect().await
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.close().await
    }
}

#[async_trait]
impl DurableTier for FlakyDurableTier {
    async fn upsert(
        &self,
        id: &SessionId,
        patch: AuthPatch,
        expected_version: Option<u64>,
        fencing_token: Option<u64>,
        ttl: Option<Duration>,
    ) -> StoreResult<VersionedResult> {
        if self.should_fail() {
            return Err(Self::fault());
        }
        self.inner
            .upsert(id, patch, expected_version, fencing_token, ttl)
            .await
    }
}

pub fn session(raw: &str) -> SessionId {
    SessionId::new(raw).unwrap()
}

pub fn creds_patch(registration_id: f64) -> AuthPatch {
    use std::collections::BTreeMap;
    let mut obj = BTreeMap::new();
    obj.insert(
        "registrationId".to_string(),
        authstore::model::Value::Number(registration_id),
    );
    AuthPatch {
        creds: Some(authstore::model::Value::Object(obj)),
        ..AuthPatch::empty()
    }
}
