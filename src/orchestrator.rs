//! [`HybridStore`]: the public facade combining the fast tier, durable
//! tier, outbox, reconciler, breaker, lock table, and metrics registry
//! into one versioned, fault-tolerant store.
//!
//! Grounded on `api::gateway::ApiGateway`: a facade owning its backends
//! and a circuit breaker, generalized from HTTP request routing to the
//! read/write/cache-warming/batch contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock as AsyncRwLock;

use crate::breaker::{BreakerConfig, BreakerStats, CircuitBreaker};
use crate::config::HybridConfig;
use crate::error::{StorageKind, StoreError, StoreResult};
use crate::lock_table::LockTable;
use crate::metrics::StoreMetrics;
use crate::model::{AuthPatch, AuthSnapshot, BatchDeleteResult, SessionId, Versioned, VersionedResult};
use crate::outbox::Outbox;
use crate::queue::{PersistenceJob, QueueAdapter};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::tiers::{DurableTier, FastTier};

/// Point-in-time outbox counters, returned by
/// [`HybridStore::get_outbox_stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxStats {
    /// Number of sessions with at least one live entry.
    pub sessions_with_pending: usize,
    /// Total live (non-dead-letter) entries across all sessions.
    pub pending_entries: usize,
    /// Records currently in the dead-letter container.
    pub dead_letter_size: usize,
}

/// Combines a fast tier, durable tier, and config into one versioned
/// store with write-behind, circuit breaking, and cache warming.
pub struct HybridStore {
    fast: Arc<dyn FastTier>,
    durable: Arc<dyn DurableTier>,
    config: HybridConfig,
    metrics: Arc<StoreMetrics>,
    breaker: Arc<CircuitBreaker>,
    locks: LockTable,
    outbox: Arc<Outbox>,
    queue: AsyncRwLock<Option<Arc<dyn QueueAdapter>>>,
    reconciler: AsyncRwLock<Option<Arc<Reconciler>>>,
    connected: AtomicBool,
}

impl HybridStore {
    /// Build a store over the given tiers and configuration. Does not
    /// connect either tier; call [`HybridStore::connect`] before use.
    pub fn new(
        fast: Arc<dyn FastTier>,
        durable: Arc<dyn DurableTier>,
        config: HybridConfig,
        queue: Option<Arc<dyn QueueAdapter>>,
    ) -> StoreResult<Self> {
        let breaker_config = BreakerConfig {
            call_timeout: Duration::from_millis(config.resilience.operation_timeout_ms),
            ..BreakerConfig::default()
        };
        Self::with_breaker_config(fast, durable, config, queue, breaker_config)
    }

    /// Like [`HybridStore::new`], but overrides the circuit breaker's
    /// window/threshold/cooldown tuning instead of deriving it from
    /// `config.resilience`. Exposed for tests that need a breaker which
    /// trips and recovers faster than the production defaults.
    pub fn with_breaker_config(
        fast: Arc<dyn FastTier>,
        durable: Arc<dyn DurableTier>,
        config: HybridConfig,
        queue: Option<Arc<dyn QueueAdapter>>,
        breaker_config: BreakerConfig,
    ) -> StoreResult<Self> {
        config.validate()?;
        let metrics = Arc::new(StoreMetrics::new("authstore"));
        let breaker = Arc::new(CircuitBreaker::new(breaker_config).with_metrics(metrics.clone()));
        Ok(Self {
            fast,
            durable,
            locks: LockTable::new(10_000, Duration::from_secs(config.ttl.lock_ttl)),
            outbox: Arc::new(Outbox::new()),
            queue: AsyncRwLock::new(queue),
            reconciler: AsyncRwLock::new(None),
            connected: AtomicBool::new(false),
            config,
            metrics,
            breaker,
        })
    }

    /// Increment `operation_timeouts` when `err` is a breaker-surfaced
    /// [`StoreError::Timeout`].
    fn note_timeout(&self, err: &StoreError) {
        if matches!(err, StoreError::Timeout(_)) {
            self.metrics.operation_timeouts.inc();
        }
    }

    /// Read path: Fast-Tier hit short-circuits; a miss or Fast-Tier error
    /// falls through to the Durable tier (via the breaker), whose result
    /// degrades to `None` rather than propagating an error.
    pub async fn get(&self, id: &SessionId) -> StoreResult<Option<Versioned<AuthSnapshot>>> {
        let _timer = self.metrics.operation_latency.start_timer();
        self.metrics.record_session_event(id.as_str(), "get");

        match self.fast.get(id).await {
            Ok(Some(versioned)) => {
                self.metrics.fast_hits.inc();
                return Ok(Some(versioned));
            }
            Ok(None) => {
                self.metrics.fast_misses.inc();
            }
            Err(err) => {
                tracing::warn!(error = %err, "fast-tier read failed, falling through to durable");
                self.metrics.fast_misses.inc();
            }
        }

        let durable = Arc::clone(&self.durable);
        let fetch_id = id.clone();
        let result = self
            .breaker
            .fire(|| async move { durable.get(&fetch_id).await })
            .await;

        match result {
            Ok(Some(versioned)) => {
                self.metrics.durable_fallbacks.inc();
                self.warm_cache(id, &versioned).await;
                Ok(Some(versioned))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.note_timeout(&err);
                tracing::debug!(error = %err, "durable read degraded to none");
                Ok(None)
            }
        }
    }

    /// TOCTOU-safe cache warming: never overwrites a newer Fast-Tier
    /// version with an older Durable read.
    async fn warm_cache(&self, id: &SessionId, versioned: &Versioned<AuthSnapshot>) {
        let current_meta = match self.fast.get_meta(id).await {
            Ok(meta) => meta,
            Err(err) => {
                tracing::warn!(error = %err, "cache warming meta read failed");
                return;
            }
        };
        if let Some(meta) = current_meta {
            if meta.version >= versioned.version {
                return;
            }
        }

        match self
            .fast
            .warm(
                id,
                versioned.data.clone(),
                versioned.version,
                versioned.updated_at,
                None,
            )
            .await
        {
            Ok(true) => self.metrics.cache_warming.inc(),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(error = %err, "cache warming was superseded or failed");
            }
        }
    }

    /// Write path: per-session mutex, buffer validation, Fast-Tier CAS,
    /// then write-behind (outbox + queue, falling back to a direct
    /// durable write) or a direct durable write.
    pub async fn set(
        &self,
        id: &SessionId,
        patch: AuthPatch,
        expected_version: Option<u64>,
        fencing_token: Option<u64>,
    ) -> StoreResult<VersionedResult> {
        let _timer = self.metrics.operation_latency.start_timer();
        self.metrics.record_session_event(id.as_str(), "set");

        let patch = patch.validated()?;
        let fast = Arc::clone(&self.fast);
        let id_owned = id.clone();

        self.locks
            .run_exclusive(id, || async move {
                let result = match fast.set(&id_owned, patch.clone(), expected_version, None).await {
                    Ok(result) => result,
                    Err(err @ StoreError::VersionMismatch { .. }) => {
                        self.metrics.version_conflicts.inc();
                        return Err(err);
                    }
                    Err(err) => return Err(err),
                };
                let version = result.version;

                if self.config.enable_write_behind {
                    if let Some(queue) = self.queue.read().await.clone() {
                        self.outbox.add(&id_owned, patch.clone(), version, fencing_token)?;
                        let job = PersistenceJob {
                            session_id: id_owned.clone(),
                            patch: patch.clone(),
                            version,
                            fencing_token,
                            timestamp: chrono::Utc::now(),
                        };
                        match queue.add("persist-auth-state", job).await {
                            Ok(()) => {
                                self.metrics.queue_publishes.inc();
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "queue publish failed, writing durable directly");
                                self.metrics.queue_failures.inc();
                                self.write_durable_direct(&id_owned, patch, version, fencing_token)
                                    .await?;
                                self.outbox.mark_completed(&id_owned, version);
                            }
                        }
                        return Ok(result);
                    }
                }

                self.write_durable_direct(&id_owned, patch, version, fencing_token)
                    .await?;
                Ok(result)
            })
            .await
    }

    async fn write_durable_direct(
        &self,
        id: &SessionId,
        patch: AuthPatch,
        version: u64,
        fencing_token: Option<u64>,
    ) -> StoreResult<()> {
        let durable = Arc::clone(&self.durable);
        let id_owned = id.clone();
        let expected = version.checked_sub(1);
        let result = self
            .breaker
            .fire(|| async move {
                durable
                    .upsert(&id_owned, patch, expected, fencing_token, None)
                    .await
            })
            .await;
        if let Err(err) = &result {
            self.note_timeout(err);
        }
        result?;
        self.metrics.direct_writes.inc();
        Ok(())
    }

    /// Delete from both tiers in parallel. A single-tier failure logs and
    /// still reports success; both failing raises a storage error.
    pub async fn delete(&self, id: &SessionId) -> StoreResult<()> {
        let _timer = self.metrics.operation_latency.start_timer();
        self.metrics.record_session_event(id.as_str(), "delete");

        let fast = Arc::clone(&self.fast);
        let durable = Arc::clone(&self.durable);
        let fast_id = id.clone();
        let durable_id = id.clone();
        let breaker = Arc::clone(&self.breaker);

        let (fast_result, durable_result) = tokio::join!(
            async move { fast.delete(&fast_id).await },
            async move { breaker.fire(|| async move { durable.delete(&durable_id).await }).await }
        );
        if let Err(err) = &durable_result {
            self.note_timeout(err);
        }

        match (fast_result, durable_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(err)) | (Err(err), Ok(())) => {
                tracing::warn!(error = %err, "partial delete failure, one tier succeeded");
                Ok(())
            }
            (Err(fast_err), Err(durable_err)) => Err(StoreError::storage(
                StorageKind::Hybrid,
                format!("both tiers failed to delete: fast={fast_err}, durable={durable_err}"),
            )),
        }
    }

    /// Extend TTL on both tiers, applying the same partial-failure policy
    /// as [`HybridStore::delete`].
    pub async fn touch(&self, id: &SessionId, ttl: Option<Duration>) -> StoreResult<()> {
        let _timer = self.metrics.operation_latency.start_timer();
        self.metrics.record_session_event(id.as_str(), "touch");

        let fast = Arc::clone(&self.fast);
        let durable = Arc::clone(&self.durable);
        let fast_id = id.clone();
        let durable_id = id.clone();
        let breaker = Arc::clone(&self.breaker);

        let (fast_result, durable_result) = tokio::join!(
            async move { fast.touch(&fast_id, ttl).await },
            async move { breaker.fire(|| async move { durable.touch(&durable_id, ttl).await }).await }
        );
        if let Err(err) = &durable_result {
            self.note_timeout(err);
        }

        match (fast_result, durable_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(err)) | (Err(err), Ok(())) => {
                tracing::warn!(error = %err, "partial touch failure, one tier succeeded");
                Ok(())
            }
            (Err(fast_err), Err(durable_err)) => Err(StoreError::storage(
                StorageKind::Hybrid,
                format!("both tiers failed to touch: fast={fast_err}, durable={durable_err}"),
            )),
        }
    }

    /// Short-circuits on a Fast-Tier positive result; otherwise consults
    /// Durable.
    pub async fn exists(&self, id: &SessionId) -> StoreResult<bool> {
        if self.fast.exists(id).await.unwrap_or(false) {
            return Ok(true);
        }
        let durable = Arc::clone(&self.durable);
        let id_owned = id.clone();
        let result = self
            .breaker
            .fire(|| async move { durable.exists(&id_owned).await })
            .await;
        if let Err(err) = &result {
            self.note_timeout(err);
        }
        Ok(result.unwrap_or(false))
    }

    /// `true` iff connected and both tiers report healthy.
    pub async fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.fast.is_healthy().await && self.durable.is_healthy().await
    }

    /// Per-id Fast-Tier reads, issued concurrently; misses fall back to
    /// Durable with warming, same as [`HybridStore::get`]. Empty input
    /// yields an empty map.
    pub async fn batch_get(
        &self,
        ids: &[SessionId],
    ) -> HashMap<SessionId, Option<Versioned<AuthSnapshot>>> {
        let start = std::time::Instant::now();
        let reads = ids.iter().map(|id| async move {
            (id.clone(), self.get(id).await.unwrap_or(None))
        });
        let out: HashMap<_, _> = futures::future::join_all(reads).await.into_iter().collect();
        self.metrics.batch_operations.inc();
        self.metrics
            .batch_operations_duration
            .observe(start.elapsed().as_secs_f64());
        out
    }

    /// Per-id delete, issued concurrently and partitioned into
    /// successful/failed. Empty input yields an empty result.
    pub async fn batch_delete(&self, ids: &[SessionId]) -> BatchDeleteResult {
        let start = std::time::Instant::now();
        let deletes = ids.iter().map(|id| async move { (id.clone(), self.delete(id).await) });
        let outcomes = futures::future::join_all(deletes).await;

        let mut result = BatchDeleteResult::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => result.successful.push(id),
                Err(err) => result.failed.push((id, err.to_string())),
            }
        }
        self.metrics.batch_operations.inc();
        self.metrics
            .batch_operations_duration
            .observe(start.elapsed().as_secs_f64());
        result
    }

    /// Prometheus exposition text for every registered metric.
    pub fn get_metrics_text(&self) -> String {
        self.metrics.prometheus_export()
    }

    /// Current circuit breaker window statistics.
    pub fn get_circuit_breaker_stats(&self) -> BreakerStats {
        self.breaker.stats()
    }

    /// Whether the durable-tier breaker is currently open.
    pub fn is_breaker_open(&self) -> bool {
        matches!(self.breaker.state(), crate::breaker::CircuitState::Open)
    }

    /// Snapshot of outbox depth and dead-letter size.
    pub fn get_outbox_stats(&self) -> OutboxStats {
        let session_ids = self.outbox.session_ids();
        let pending_entries: usize = session_ids
            .iter()
            .map(|id| self.outbox.get_pending(id).len())
            .sum();
        OutboxStats {
            sessions_with_pending: session_ids.len(),
            pending_entries,
            dead_letter_size: self.outbox.get_dead_letter_size(),
        }
    }

    /// Force an immediate reconciler drain, outside its periodic
    /// schedule. Intended for tests and operator-triggered reconciliation.
    pub async fn reconcile_outbox(&self) {
        let reconciler = self.reconciler.read().await.clone();
        if let Some(reconciler) = reconciler {
            reconciler.tick_now().await;
        }
    }

    /// Connect both tiers in order (Fast, then Durable). If write-behind
    /// and a queue are configured, also spins up the outbox-backed
    /// reconciler.
    pub async fn connect(&self) -> StoreResult<()> {
        self.fast
            .connect()
            .await
            .map_err(|e| StoreError::storage(StorageKind::Hybrid, e))?;
        self.durable
            .connect()
            .await
            .map_err(|e| StoreError::storage(StorageKind::Hybrid, e))?;

        if self.config.enable_write_behind && self.queue.read().await.is_some() {
            let reconciler = Arc::new(Reconciler::new(
                Arc::clone(&self.outbox),
                Arc::clone(&self.durable),
                Arc::clone(&self.breaker),
                Arc::clone(&self.metrics),
                ReconcilerConfig::default(),
            ));
            reconciler.start().await;
            *self.reconciler.write().await = Some(reconciler);
        }

        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the reconciler, then close both tiers and the queue in
    /// parallel. Never fails; errors are logged and absorbed. The
    /// connected flag only clears on an all-clean shutdown.
    pub async fn disconnect(&self) {
        if let Some(reconciler) = self.reconciler.write().await.take() {
            reconciler.stop().await;
        }

        let fast = Arc::clone(&self.fast);
        let durable = Arc::clone(&self.durable);
        let queue = self.queue.read().await.clone();

        let (fast_result, durable_result, queue_result) = tokio::join!(
            async move { fast.close().await },
            async move { durable.close().await },
            async move {
                if let Some(queue) = queue {
                    queue.close().await
                } else {
                    Ok(())
                }
            }
        );

        let mut all_clean = true;
        for (label, result) in [
            ("fast", fast_result),
            ("durable", durable_result),
            ("queue", queue_result),
        ] {
            if let Err(err) = result {
                tracing::warn!(tier = label, error = %err, "error during disconnect, absorbed");
                all_clean = false;
            }
        }

        if all_clean {
            self.connected.store(false, Ordering::Release);
        }
    }
}
