//! Circuit breaker guarding durable-tier calls.
//!
//! Grounded on `api::gateway::CircuitBreaker`'s Closed/Open/HalfOpen state
//! machine and per-call `RwLock`-guarded counters, generalized from a
//! single elapsed-window failure counter to a rolling fixed-bucket error
//! rate so a burst that spans a window boundary doesn't reset to zero.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::time::timeout;

use crate::error::{StoreError, StoreResult};
use crate::metrics::StoreMetrics;

/// Circuit breaker tuning. Field names and defaults mirror §4.5.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Timeout applied to every wrapped call.
    pub call_timeout: Duration,
    /// Fraction of failed calls within the window that trips the breaker.
    pub error_rate_threshold: f64,
    /// Total span of the rolling window.
    pub window: Duration,
    /// Number of buckets the window is divided into.
    pub bucket_count: usize,
    /// How long the breaker stays open before probing again.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(3),
            error_rate_threshold: 0.5,
            window: Duration::from_secs(10),
            bucket_count: 10,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through normally.
    Closed,
    /// Calls fail immediately without reaching the wrapped function.
    Open,
    /// A single probe call is allowed through to test recovery.
    HalfOpen,
}

impl CircuitState {
    fn label(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

struct Bucket {
    started_at: Instant,
    successes: u32,
    failures: u32,
}

impl Bucket {
    fn fresh() -> Self {
        Self {
            started_at: Instant::now(),
            successes: 0,
            failures: 0,
        }
    }
}

/// Point-in-time breaker statistics, returned by
/// [`CircuitBreaker::stats`]/the orchestrator's `get_circuit_breaker_stats`.
#[derive(Debug, Clone, Copy)]
pub struct BreakerStats {
    /// Current state.
    pub state: CircuitState,
    /// Successful calls observed within the rolling window.
    pub window_successes: u32,
    /// Failed calls (including timeouts) observed within the window.
    pub window_failures: u32,
}

impl BreakerStats {
    /// `None` if the window contains no observations yet.
    pub fn error_rate(&self) -> Option<f64> {
        let total = self.window_successes + self.window_failures;
        if total == 0 {
            None
        } else {
            Some(self.window_failures as f64 / total as f64)
        }
    }
}

/// Wraps durable-tier (or any fallible async) calls with the Closed → Open
/// → HalfOpen → Closed state machine.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: RwLock<CircuitState>,
    last_transition: RwLock<Instant>,
    buckets: Vec<RwLock<Bucket>>,
    epoch: Instant,
    metrics: Option<Arc<StoreMetrics>>,
}

impl CircuitBreaker {
    /// Build a breaker with the given configuration.
    pub fn new(config: BreakerConfig) -> Self {
        let bucket_count = config.bucket_count.max(1);
        Self {
            buckets: (0..bucket_count).map(|_| RwLock::new(Bucket::fresh())).collect(),
            config,
            state: RwLock::new(CircuitState::Closed),
            last_transition: RwLock::new(Instant::now()),
            epoch: Instant::now(),
            metrics: None,
        }
    }

    /// Attach a metrics registry; transitions will increment
    /// `circuit_breaker_transitions_total{from_state,to_state}`.
    pub fn with_metrics(mut self, metrics: Arc<StoreMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    /// Snapshot of window counters and state.
    pub fn stats(&self) -> BreakerStats {
        let (successes, failures) = self.window_counts();
        BreakerStats {
            state: self.state(),
            window_successes: successes,
            window_failures: failures,
        }
    }

    fn bucket_width(&self) -> Duration {
        self.config.window / self.config.bucket_count as u32
    }

    fn current_bucket_index(&self) -> usize {
        let elapsed = self.epoch.elapsed().as_nanos();
        let width = self.bucket_width().as_nanos().max(1);
        ((elapsed / width) as usize) % self.buckets.len()
    }

    fn window_counts(&self) -> (u32, u32) {
        let mut successes = 0;
        let mut failures = 0;
        for bucket in &self.buckets {
            let bucket = bucket.read();
            if bucket.started_at.elapsed() < self.config.window {
                successes += bucket.successes;
                failures += bucket.failures;
            }
        }
        (successes, failures)
    }

    fn record_bucket(&self, success: bool) {
        let idx = self.current_bucket_index();
        let mut bucket = self.buckets[idx].write();
        if bucket.started_at.elapsed() >= self.bucket_width() {
            *bucket = Bucket::fresh();
        }
        if success {
            bucket.successes += 1;
        } else {
            bucket.failures += 1;
        }
    }

    fn transition(&self, to: CircuitState) {
        let from = {
            let mut state = self.state.write();
            let from = *state;
            *state = to;
            from
        };
        if from == to {
            return;
        }
        *self.last_transition.write() = Instant::now();
        match to {
            CircuitState::Open => tracing::warn!(from = from.label(), to = to.label(), "circuit breaker transitioning"),
            _ => tracing::info!(from = from.label(), to = to.label(), "circuit breaker transitioning"),
        }
        if let Some(metrics) = &self.metrics {
            metrics.breaker_transitions.inc(from.label(), to.label());
        }
    }

    fn admit(&self) -> StoreResult<()> {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                if self.last_transition.read().elapsed() >= self.config.cooldown {
                    self.transition(CircuitState::HalfOpen);
                    Ok(())
                } else {
                    Err(StoreError::BreakerOpen)
                }
            }
        }
    }

    fn record_outcome(&self, success: bool) {
        self.record_bucket(success);
        match self.state() {
            CircuitState::Closed => {
                let (successes, failures) = self.window_counts();
                let total = successes + failures;
                if total > 0 {
                    let error_rate = failures as f64 / total as f64;
                    if error_rate >= self.config.error_rate_threshold {
                        self.transition(CircuitState::Open);
                    }
                }
            }
            CircuitState::HalfOpen => {
                self.transition(if success {
                    CircuitState::Closed
                } else {
                    CircuitState::Open
                });
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` guarded by this breaker: fails fast with
    /// [`StoreError::BreakerOpen`] while open, applies the configured
    /// per-call timeout, and feeds the outcome back into the state
    /// machine.
    pub async fn fire<F, Fut, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.admit()?;
        match timeout(self.config.call_timeout, f()).await {
            Ok(Ok(value)) => {
                self.record_outcome(true);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_outcome(false);
                Err(err)
            }
            Err(_) => {
                self.record_outcome(false);
                Err(StoreError::Timeout(self.config.call_timeout))
            }
        }
    }
}
