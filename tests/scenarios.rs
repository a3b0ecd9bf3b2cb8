//! End-to-end scenarios over [`HybridStore`], exercising the fast/durable
//! split, write-behind fallback, concurrent writers, breaker degradation,
//! and outbox reconciliation/dead-letter handling together.

mod common;

use std::sync::Arc;
use std::time::Duration;

use authstore::breaker::{BreakerConfig, CircuitState};
use authstore::codec::NullCodec;
use authstore::config::HybridConfig;
use authstore::queue::{InMemoryQueueAdapter, NullQueueAdapter};
use authstore::tiers::{InMemoryDurableTier, InMemoryFastTier, Tier};
use authstore::HybridStore;

use common::{creds_patch, session, FlakyDurableTier};

fn fast_tier() -> Arc<InMemoryFastTier> {
    Arc::new(InMemoryFastTier::new(Duration::from_secs(60)))
}

fn durable_tier() -> Arc<InMemoryDurableTier> {
    Arc::new(InMemoryDurableTier::new(
        Arc::new(NullCodec),
        Duration::from_secs(3600),
        3,
        Duration::from_millis(1),
        2.0,
    ))
}

#[tokio::test]
async fn happy_read_through() {
    let fast = fast_tier();
    let durable = durable_tier();
    let store = HybridStore::new(
        fast.clone(),
        durable.clone(),
        HybridConfig {
            enable_write_behind: false,
            ..HybridConfig::default()
        },
        None,
    )
    .unwrap();
    store.connect().await.unwrap();

    let id = session("s1");
    let result = store.set(&id, creds_patch(1.0), None, None).await.unwrap();
    assert_eq!(result.version, 1);

    // Flush the fast tier to force the next read through to durable.
    fast.delete(&id).await.unwrap();

    let got = store.get(&id).await.unwrap().unwrap();
    assert_eq!(got.version, 1);
    let text = store.get_metrics_text();
    assert!(text.contains("authstore_mongo_fallbacks_total 1"));

    // Warming should have repopulated the fast tier; the next read hits it.
    let again = store.get(&id).await.unwrap().unwrap();
    assert_eq!(again.version, 1);
    let text = store.get_metrics_text();
    assert!(text.contains("authstore_redis_hits_total 1"));
}

#[tokio::test]
async fn write_behind_fallback() {
    let fast = fast_tier();
    let durable = durable_tier();
    let store = HybridStore::new(
        fast,
        durable.clone(),
        HybridConfig::default(),
        Some(Arc::new(NullQueueAdapter)),
    )
    .unwrap();
    store.connect().await.unwrap();

    let id = session("s2");
    let result = store.set(&id, creds_patch(2.0), None, None).await.unwrap();
    assert_eq!(result.version, 1);

    let durable_record = durable.get(&id).await.unwrap().unwrap();
    assert_eq!(durable_record.version, 1);

    let stats = store.get_outbox_stats();
    assert_eq!(stats.pending_entries, 0, "entry should have settled to completed");

    let text = store.get_metrics_text();
    assert!(text.contains("authstore_queue_failures_total 1"));
}

#[tokio::test]
async fn concurrent_writers_converge_to_a_single_merged_version() {
    let fast = fast_tier();
    let durable = durable_tier();
    let store = Arc::new(
        HybridStore::new(
            fast,
            durable,
            HybridConfig {
                enable_write_behind: false,
                ..HybridConfig::default()
            },
            None,
        )
        .unwrap(),
    );
    store.connect().await.unwrap();

    let id = session("s3");
    let (r1, r2, r3) = tokio::join!(
        store.set(&id, creds_patch(1.0), None, None),
        store.set(&id, creds_patch(2.0), None, None),
        store.set(&id, creds_patch(3.0), None, None),
    );
    for result in [r1, r2, r3] {
        result.unwrap();
    }

    let got = store.get(&id).await.unwrap().unwrap();
    assert_eq!(got.version, 3);
}

#[tokio::test]
async fn breaker_degradation_and_recovery() {
    let fast = fast_tier();
    let durable = Arc::new(FlakyDurableTier::new());
    durable.fail_permanently();

    let store = HybridStore::with_breaker_config(
        fast,
        durable.clone(),
        HybridConfig {
            enable_write_behind: false,
            ..HybridConfig::default()
        },
        None,
        BreakerConfig {
            call_timeout: Duration::from_millis(50),
            error_rate_threshold: 0.5,
            window: Duration::from_millis(200),
            bucket_count: 4,
            cooldown: Duration::from_millis(150),
        },
    )
    .unwrap();
    store.connect().await.unwrap();

    let id = session("unknown");
    for _ in 0..4 {
        let got = store.get(&id).await.unwrap();
        assert!(got.is_none());
    }
    assert_eq!(store.get_circuit_breaker_stats().state, CircuitState::Open);
    assert!(store.is_breaker_open());

    durable.recover();
    tokio::time::sleep(Duration::from_millis(200)).await;
    // A probe call through the half-open state should close the breaker.
    let _ = store.get(&id).await.unwrap();
    assert_eq!(store.get_circuit_breaker_stats().state, CircuitState::Closed);
}

#[tokio::test]
async fn outbox_reconciliation_drains_once_durable_recovers() {
    let fast = fast_tier();
    let durable = Arc::new(FlakyDurableTier::new());
    durable.fail_permanently();

    // A working queue: the foreground write only has to reach the outbox,
    // not the durable tier directly, so writes succeed while durable is
    // down and settle later via the reconciler.
    let store = HybridStore::new(
        fast,
        durable.clone(),
        HybridConfig::default(),
        Some(Arc::new(InMemoryQueueAdapter::new())),
    )
    .unwrap();
    store.connect().await.unwrap();

    let id = session("s4");
    for i in 0..5 {
        let result = store
            .set(&id, creds_patch(i as f64), None, None)
            .await
            .unwrap();
        assert_eq!(result.version, i + 1);
    }

    let stats = store.get_outbox_stats();
    assert_eq!(stats.pending_entries, 5);

    durable.recover();
    store.reconcile_outbox().await;
    store.reconcile_outbox().await;

    let record = durable.get(&id).await.unwrap().unwrap();
    assert_eq!(record.version, 5);
    assert_eq!(store.get_outbox_stats().pending_entries, 0);
}

#[tokio::test]
async fn dead_letter_after_exhausting_retries() {
    let fast = fast_tier();
    let durable = Arc::new(FlakyDurableTier::new());
    durable.fail_permanently();

    let store = HybridStore::new(
        fast,
        durable.clone(),
        HybridConfig::default(),
        Some(Arc::new(InMemoryQueueAdapter::new())),
    )
    .unwrap();
    store.connect().await.unwrap();

    let id = session("s5");
    store.set(&id, creds_patch(5.0), None, None).await.unwrap();

    // MAX_ATTEMPTS reconciler ticks against a permanently failing durable
    // tier exhausts the retry budget and moves the entry to dead-letter.
    for _ in 0..3 {
        store.reconcile_outbox().await;
    }

    let stats = store.get_outbox_stats();
    assert_eq!(stats.pending_entries, 0);
    assert_eq!(stats.dead_letter_size, 1);
}
