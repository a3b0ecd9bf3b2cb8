//! Metrics registry and Prometheus exposition.
//!
//! Adapted from the tracing module's `MetricRegistry`: the same
//! Counter/Gauge/Histogram handle types backed by a name-keyed map, plus a
//! small label-family extension so breaker-transition and per-session
//! counters can be exported without pre-declaring every combination.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

/// Registry of named metrics, exportable in Prometheus text format.
#[derive(Clone)]
pub struct MetricRegistry {
    metrics: Arc<RwLock<HashMap<String, Metric>>>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a monotonic counter.
    pub fn counter(&self, name: impl Into<String>, help: impl Into<String>) -> Counter {
        let name = name.into();
        let metric = Metric::Counter(CounterMetric {
            name: name.clone(),
            help: help.into(),
            value: Arc::new(RwLock::new(0.0)),
        });
        self.metrics.write().insert(name, metric.clone());
        Counter { metric }
    }

    /// Register a gauge.
    pub fn gauge(&self, name: impl Into<String>, help: impl Into<String>) -> Gauge {
        let name = name.into();
        let metric = Metric::Gauge(GaugeMetric {
            name: name.clone(),
            help: help.into(),
            value: Arc::new(RwLock::new(0.0)),
        });
        self.metrics.write().insert(name, metric.clone());
        Gauge { metric }
    }

    /// Register a histogram with explicit bucket boundaries.
    pub fn histogram(
        &self,
        name: impl Into<String>,
        help: impl Into<String>,
        buckets: Vec<f64>,
    ) -> Histogram {
        let name = name.into();
        let metric = Metric::Histogram(HistogramMetric {
            name: name.clone(),
            help: help.into(),
            buckets,
            observations: Arc::new(RwLock::new(Vec::new())),
        });
        self.metrics.write().insert(name, metric.clone());
        Histogram { metric }
    }

    /// Render every registered metric in Prometheus exposition format.
    pub fn prometheus_export(&self) -> String {
        let mut out = String::new();
        let metrics = self.metrics.read();
        let mut names: Vec<&String> = metrics.keys().collect();
        names.sort();
        for name in names {
            match &metrics[name] {
                Metric::Counter(c) => {
                    out.push_str(&format!("# HELP {} {}\n", c.name, c.help));
                    out.push_str(&format!("# TYPE {} counter\n", c.name));
                    out.push_str(&format!("{} {}\n", c.name, *c.value.read()));
                }
                Metric::Gauge(g) => {
                    out.push_str(&format!("# HELP {} {}\n", g.name, g.help));
                    out.push_str(&format!("# TYPE {} gauge\n", g.name));
                    out.push_str(&format!("{} {}\n", g.name, *g.value.read()));
                }
                Metric::Histogram(h) => {
                    out.push_str(&format!("# HELP {} {}\n", h.name, h.help));
                    out.push_str(&format!("# TYPE {} histogram\n", h.name));
                    let observations = h.observations.read();
                    let mut cumulative = 0u64;
                    for bucket in &h.buckets {
                        cumulative += observations.iter().filter(|v| *v <= bucket).count() as u64;
                        out.push_str(&format!(
                            "{}_bucket{{le=\"{}\"}} {}\n",
                            h.name, bucket, cumulative
                        ));
                    }
                    out.push_str(&format!(
                        "{}_bucket{{le=\"+Inf\"}} {}\n",
                        h.name,
                        observations.len()
                    ));
                    out.push_str(&format!(
                        "{}_sum {}\n",
                        h.name,
                        observations.iter().sum::<f64>()
                    ));
                    out.push_str(&format!("{}_count {}\n", h.name, observations.len()));
                }
            }
        }
        out
    }
}

#[derive(Clone)]
enum Metric {
    Counter(CounterMetric),
    Gauge(GaugeMetric),
    Histogram(HistogramMetric),
}

#[derive(Clone)]
struct CounterMetric {
    name: String,
    help: String,
    value: Arc<RwLock<f64>>,
}

#[derive(Clone)]
struct GaugeMetric {
    name: String,
    help: String,
    value: Arc<RwLock<f64>>,
}

#[derive(Clone)]
struct HistogramMetric {
    name: String,
    help: String,
    buckets: Vec<f64>,
    observations: Arc<RwLock<Vec<f64>>>,
}

/// Handle to a registered counter.
#[derive(Clone)]
pub struct Counter {
    metric: Metric,
}

impl Counter {
    /// Increment by one.
    pub fn inc(&self) {
        self.add(1.0);
    }

    /// Add an arbitrary non-negative amount.
    pub fn add(&self, value: f64) {
        if let Metric::Counter(ref c) = self.metric {
            *c.value.write() += value;
        }
    }

    /// Current value.
    pub fn get(&self) -> f64 {
        if let Metric::Counter(ref c) = self.metric {
            *c.value.read()
        } else {
            0.0
        }
    }
}

/// Handle to a registered gauge.
#[derive(Clone)]
pub struct Gauge {
    metric: Metric,
}

impl Gauge {
    /// Set the gauge to an absolute value.
    pub fn set(&self, value: f64) {
        if let Metric::Gauge(ref g) = self.metric {
            *g.value.write() = value;
        }
    }

    /// Current value.
    pub fn get(&self) -> f64 {
        if let Metric::Gauge(ref g) = self.metric {
            *g.value.read()
        } else {
            0.0
        }
    }
}

/// Handle to a registered histogram.
#[derive(Clone)]
pub struct Histogram {
    metric: Metric,
}

impl Histogram {
    /// Record one observation, in seconds.
    pub fn observe(&self, value: f64) {
        if let Metric::Histogram(ref h) = self.metric {
            h.observations.write().push(value);
        }
    }

    /// Start a timer that records elapsed seconds when dropped.
    pub fn start_timer(&self) -> HistogramTimer {
        HistogramTimer {
            histogram: self.clone(),
            start: std::time::Instant::now(),
        }
    }
}

/// RAII timer created by [`Histogram::start_timer`].
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

/// Standard bucket sets, named after their intended latency range.
pub mod buckets {
    /// Sub-10s operation latency buckets, in seconds.
    pub const DEFAULT: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
}

/// Counter family keyed by a small, bounded label set (breaker state
/// transitions: 3 states means at most 9 live instances).
#[derive(Clone)]
pub struct LabeledCounterFamily {
    base_name: String,
    help: String,
    registry: MetricRegistry,
    instances: Arc<DashMap<(String, String), Counter>>,
}

impl LabeledCounterFamily {
    fn new(registry: &MetricRegistry, base_name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            base_name: base_name.into(),
            help: help.into(),
            registry: registry.clone(),
            instances: Arc::new(DashMap::new()),
        }
    }

    /// Increment the counter for the given `(from_state, to_state)` pair,
    /// registering it on first use.
    pub fn inc(&self, from: &str, to: &str) {
        let key = (from.to_string(), to.to_string());
        let counter = self
            .instances
            .entry(key.clone())
            .or_insert_with(|| {
                let name = format!(
                    "{}{{from_state=\"{}\",to_state=\"{}\"}}",
                    self.base_name, key.0, key.1
                );
                self.registry.counter(name, self.help.clone())
            })
            .clone();
        counter.inc();
    }
}

/// Pre-registered counters, gauges, and histograms for every metric named
/// by the operation contract. `session_id` cardinality is not embedded in
/// the exported series (unbounded labels would make scrape payloads grow
/// without bound); per-session breakdowns are available in-process via
/// [`StoreMetrics::record_session_event`] instead.
pub struct StoreMetrics {
    registry: MetricRegistry,
    pub fast_hits: Counter,
    pub fast_misses: Counter,
    pub durable_fallbacks: Counter,
    pub queue_publishes: Counter,
    pub queue_failures: Counter,
    pub direct_writes: Counter,
    pub version_conflicts: Counter,
    pub cache_warming: Counter,
    pub operation_timeouts: Counter,
    pub outbox_reconciler_failures: Counter,
    pub batch_operations: Counter,
    pub operation_latency: Histogram,
    pub outbox_reconciler_latency: Histogram,
    pub batch_operations_duration: Histogram,
    pub breaker_transitions: LabeledCounterFamily,
    session_events: DashMap<String, DashMap<&'static str, u64>>,
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new("authstore")
    }
}

impl StoreMetrics {
    /// Build a registry with every metric name prefixed by `namespace`.
    pub fn new(namespace: &str) -> Self {
        let registry = MetricRegistry::new();
        let n = |suffix: &str| format!("{namespace}_{suffix}");
        Self {
            fast_hits: registry.counter(n("redis_hits_total"), "fast-tier reads served"),
            fast_misses: registry.counter(n("redis_misses_total"), "fast-tier misses"),
            durable_fallbacks: registry.counter(
                n("mongo_fallbacks_total"),
                "reads served from the durable tier after a fast-tier miss",
            ),
            queue_publishes: registry.counter(n("queue_publishes_total"), "outbox jobs enqueued"),
            queue_failures: registry.counter(n("queue_failures_total"), "outbox enqueue failures"),
            direct_writes: registry.counter(
                n("direct_writes_total"),
                "writes that bypassed the outbox and hit the durable tier directly",
            ),
            version_conflicts: registry
                .counter(n("version_conflicts_total"), "optimistic-lock conflicts"),
            cache_warming: registry
                .counter(n("cache_warming_total"), "fast-tier entries repopulated from durable reads"),
            operation_timeouts: registry
                .counter(n("operation_timeouts_total"), "calls that exceeded their timeout"),
            outbox_reconciler_failures: registry.counter(
                n("outbox_reconciler_failures_total"),
                "reconciler ticks that failed to drain an entry",
            ),
            batch_operations: registry
                .counter(n("batch_operations_total"), "batch get/delete calls served"),
            operation_latency: registry.histogram(
                n("operation_latency_seconds"),
                "end-to-end latency of a single get/set/delete/touch call",
                buckets::DEFAULT.to_vec(),
            ),
            outbox_reconciler_latency: registry.histogram(
                n("outbox_reconciler_latency_seconds"),
                "time to drain one outbox entry",
                buckets::DEFAULT.to_vec(),
            ),
            batch_operations_duration: registry.histogram(
                n("batch_operations_duration_seconds"),
                "wall-clock time of a batch call",
                buckets::DEFAULT.to_vec(),
            ),
            breaker_transitions: LabeledCounterFamily::new(
                &registry,
                n("circuit_breaker_transitions_total"),
                "circuit breaker state transitions",
            ),
            session_events: DashMap::new(),
            registry,
        }
    }

    /// Render the full scrape payload.
    pub fn prometheus_export(&self) -> String {
        self.registry.prometheus_export()
    }

    /// Record a named event against a session, for in-process inspection
    /// (not exported as a labeled Prometheus series).
    pub fn record_session_event(&self, session_id: &str, event: &'static str) {
        self.session_events
            .entry(session_id.to_string())
            .or_default()
            .entry(event)
            .and_modify(|count| *count += 1)
            .or_insert(1);
    }

    /// Per-event counts recorded for a single session.
    pub fn session_events(&self, session_id: &str) -> HashMap<&'static str, u64> {
        self.session_events
            .get(session_id)
            .map(|entries| entries.iter().map(|entry| (*entry.key(), *entry.value())).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let metrics = StoreMetrics::new("test");
        assert_eq!(metrics.fast_hits.get(), 0.0);
        metrics.fast_hits.inc();
        metrics.fast_hits.inc();
        assert_eq!(metrics.fast_hits.get(), 2.0);
    }

    #[test]
    fn prometheus_export_contains_registered_names() {
        let metrics = StoreMetrics::new("test");
        metrics.fast_hits.inc();
        let text = metrics.prometheus_export();
        assert!(text.contains("test_redis_hits_total"));
        assert!(text.contains("test_operation_latency_seconds"));
    }

    #[test]
    fn breaker_transitions_are_labeled() {
        let metrics = StoreMetrics::new("test");
        metrics.breaker_transitions.inc("closed", "open");
        metrics.breaker_transitions.inc("closed", "open");
        metrics.breaker_transitions.inc("open", "half_open");
        let text = metrics.prometheus_export();
        assert!(text.contains("from_state=\"closed\",to_state=\"open\""));
        assert!(text.contains("from_state=\"open\",to_state=\"half_open\""));
    }

    #[test]
    fn session_events_are_tracked_independently() {
        let metrics = StoreMetrics::new("test");
        metrics.record_session_event("s1", "write");
        metrics.record_session_event("s1", "write");
        metrics.record_session_event("s2", "write");
        assert_eq!(metrics.session_events("s1").get("write"), Some(&2));
        assert_eq!(metrics.session_events("s2").get("write"), Some(&1));
    }
}
