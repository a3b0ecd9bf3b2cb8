//! Background worker that drains the outbox into the durable tier.
//!
//! Grounded on the lock table's `DeadlockDetector::start_detection_task`:
//! a single `tokio::spawn`ed sleep-loop task, generalized from a fixed
//! interval check into a per-tick drain with bounded concurrency across
//! sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::breaker::CircuitBreaker;
use crate::metrics::StoreMetrics;
use crate::outbox::{Outbox, OutboxEntry, MAX_ATTEMPTS};
use crate::tiers::DurableTier;

/// Reconciler tuning.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// How often a tick runs.
    pub period: Duration,
    /// Maximum in-flight durable-tier operations across all sessions.
    pub max_concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(30),
            max_concurrency: 10,
        }
    }
}

/// Periodic worker that drains pending outbox entries into the durable
/// tier. `start`/`stop` are idempotent; a panic or error within one tick
/// never crashes the worker or skips the next tick.
pub struct Reconciler {
    outbox: Arc<Outbox>,
    durable: Arc<dyn DurableTier>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<StoreMetrics>,
    config: ReconcilerConfig,
    handle: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Reconciler {
    /// Build a reconciler over `outbox`, applying settled writes through
    /// `durable` guarded by `breaker`.
    pub fn new(
        outbox: Arc<Outbox>,
        durable: Arc<dyn DurableTier>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<StoreMetrics>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            outbox,
            durable,
            breaker,
            metrics,
            config,
            handle: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Start the background loop. A no-op (with a log line) if already
    /// running.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            tracing::info!("reconciler already running, start() is a no-op");
            return;
        }
        self.running.store(true, Ordering::Release);
        let this = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            let mut ticker = interval(this.config.period);
            loop {
                ticker.tick().await;
                if !this.running.load(Ordering::Acquire) {
                    break;
                }
                this.tick().await;
            }
        }));
    }

    /// Stop the background loop. Idempotent.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let mut handle = self.handle.lock().await;
        if let Some(handle) = handle.take() {
            handle.abort();
        }
    }

    /// Run one drain pass immediately, outside the periodic schedule.
    pub async fn tick_now(&self) {
        self.tick().await;
    }

    async fn tick(&self) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let session_ids = self.outbox.session_ids();
        let mut joins = Vec::with_capacity(session_ids.len());

        for session_id in session_ids {
            let outbox = Arc::clone(&self.outbox);
            let durable = Arc::clone(&self.durable);
            let breaker = Arc::clone(&self.breaker);
            let metrics = Arc::clone(&self.metrics);
            let semaphore = Arc::clone(&semaphore);

            joins.push(tokio::spawn(async move {
                for entry in outbox.get_pending(&session_id) {
                    let Ok(permit) = semaphore.acquire().await else {
                        break;
                    };
                    process_entry(&outbox, &durable, &breaker, &metrics, &session_id, entry)
                        .await;
                    drop(permit);
                }
            }));
        }

        for join in joins {
            if let Err(err) = join.await {
                tracing::warn!(error = %err, "reconciler session task panicked");
                self.metrics.outbox_reconciler_failures.inc();
            }
        }
    }
}

async fn process_entry(
    outbox: &Outbox,
    durable: &Arc<dyn DurableTier>,
    breaker: &CircuitBreaker,
    metrics: &StoreMetrics,
    session_id: &crate::model::SessionId,
    entry: OutboxEntry,
) {
    outbox.mark_processing(session_id, entry.version);
    let timer_start = std::time::Instant::now();

    let expected_version = entry.version.checked_sub(1);
    let fencing_token = entry.fencing_token;
    let attempt = breaker
        .fire(|| {
            let durable = Arc::clone(durable);
            let patch = entry.patch.clone();
            let session_id = session_id.clone();
            async move {
                durable
                    .upsert(&session_id, patch, expected_version, fencing_token, None)
                    .await
            }
        })
        .await;

    metrics
        .outbox_reconciler_latency
        .observe(timer_start.elapsed().as_secs_f64());

    match attempt {
        Ok(_) => outbox.mark_completed(session_id, entry.version),
        Err(err) => {
            metrics.outbox_reconciler_failures.inc();
            if entry.attempts + 1 >= MAX_ATTEMPTS {
                outbox.move_to_dead_letter(session_id, &entry, &err.to_string());
            } else {
                outbox.mark_failed(session_id, entry.version, &err.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::codec::NullCodec;
    use crate::model::{AuthPatch, SessionId};
    use crate::tiers::{InMemoryDurableTier, Tier};

    fn durable() -> Arc<InMemoryDurableTier> {
        Arc::new(InMemoryDurableTier::new(
            Arc::new(NullCodec),
            Duration::from_secs(3600),
            1,
            Duration::from_millis(1),
            2.0,
        ))
    }

    #[tokio::test]
    async fn tick_drains_pending_entries() {
        let outbox = Arc::new(Outbox::new());
        let durable = durable();
        durable.connect().await.unwrap();
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
        let metrics = Arc::new(StoreMetrics::new("test"));
        let id = SessionId::new("s1").unwrap();
        outbox.add(&id, AuthPatch::empty(), 1, None).unwrap();

        let reconciler = Arc::new(Reconciler::new(
            outbox.clone(),
            durable.clone() as Arc<dyn DurableTier>,
            breaker,
            metrics,
            ReconcilerConfig::default(),
        ));
        reconciler.tick().await;

        assert!(outbox.get_pending(&id).is_empty());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let outbox = Arc::new(Outbox::new());
        let durable = durable();
        durable.connect().await.unwrap();
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
        let metrics = Arc::new(StoreMetrics::new("test"));
        let reconciler = Arc::new(Reconciler::new(
            outbox,
            durable as Arc<dyn DurableTier>,
            breaker,
            metrics,
            ReconcilerConfig {
                period: Duration::from_millis(20),
                max_concurrency: 4,
            },
        ));
        reconciler.start().await;
        reconciler.start().await;
        reconciler.stop().await;
    }
}
