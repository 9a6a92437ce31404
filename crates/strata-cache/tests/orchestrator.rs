//! Behavioural tests for the cache orchestrator over in-memory tiers.
//!
//! Tier failures are simulated with [`TestTier`], a `MemoryTier` wrapper
//! that can be switched off, slowed down, or gated.

use async_trait::async_trait;
use chrono::SubsecRound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use strata_cache::{
    AdaptiveTtlConfig, CacheEntry, CacheError, CacheOrchestrator, CacheTier, CallContext,
    HitSource, LoadError, MemoryTier, OrchestratorConfig, PutOutcome, SetOptions, SharedTier,
    TierError, TierResult, WriteStrategy,
};
use strata_core::{CountingHook, ExponentialBackoff, TierLevel};
use tokio::sync::Semaphore;

struct TestTier {
    inner: MemoryTier,
    down: AtomicBool,
    get_delay: Duration,
    put_gate: Option<Semaphore>,
}

impl TestTier {
    fn new(level: TierLevel) -> Self {
        Self {
            inner: MemoryTier::standalone(level),
            down: AtomicBool::new(false),
            get_delay: Duration::ZERO,
            put_gate: None,
        }
    }

    fn slow_reads(mut self, delay: Duration) -> Self {
        self.get_delay = delay;
        self
    }

    fn gated(mut self) -> Self {
        self.put_gate = Some(Semaphore::new(0));
        self
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn open_gate(&self) {
        if let Some(gate) = &self.put_gate {
            gate.add_permits(1000);
        }
    }

    fn check(&self) -> TierResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TierError::unavailable(self.inner.level(), "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheTier for TestTier {
    fn level(&self) -> TierLevel {
        self.inner.level()
    }

    fn backend(&self) -> &'static str {
        "test"
    }

    async fn get(&self, key: &str) -> TierResult<Option<CacheEntry>> {
        if !self.get_delay.is_zero() {
            tokio::time::sleep(self.get_delay).await;
        }
        self.check()?;
        self.inner.get(key).await
    }

    async fn put(&self, entry: CacheEntry) -> TierResult<PutOutcome> {
        if let Some(gate) = &self.put_gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
        self.check()?;
        self.inner.put(entry).await
    }

    async fn remove(&self, key: &str) -> TierResult<bool> {
        self.check()?;
        self.inner.remove(key).await
    }

    async fn remove_by_tag(&self, tag: &str) -> TierResult<Vec<String>> {
        self.check()?;
        self.inner.remove_by_tag(tag).await
    }

    async fn ping(&self) -> TierResult<()> {
        self.check()
    }

    fn entry_count(&self) -> Option<usize> {
        self.inner.entry_count()
    }
}

struct Fixture {
    cache: Arc<CacheOrchestrator>,
    local: Arc<TestTier>,
    distributed: Arc<TestTier>,
    durable: Arc<TestTier>,
    hook: Arc<CountingHook>,
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        base_ttl: Duration::from_secs(60),
        local_max_ttl: Duration::from_secs(10),
        adaptive: AdaptiveTtlConfig {
            enabled: false,
            ..Default::default()
        },
        tier_retry: ExponentialBackoff::none(),
        write_back_retry: ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(5), 3),
        ..Default::default()
    }
}

fn fixture_with(config: OrchestratorConfig, distributed: TestTier, durable: TestTier) -> Fixture {
    let local = Arc::new(TestTier::new(TierLevel::Local));
    let distributed = Arc::new(distributed);
    let durable = Arc::new(durable);
    let hook = Arc::new(CountingHook::new());

    let cache = CacheOrchestrator::builder()
        .config(config)
        .local(Arc::clone(&local) as SharedTier)
        .distributed(Arc::clone(&distributed) as SharedTier)
        .durable(Arc::clone(&durable) as SharedTier)
        .monitor(Arc::clone(&hook) as _)
        .build();

    Fixture {
        cache,
        local,
        distributed,
        durable,
        hook,
    }
}

fn fixture() -> Fixture {
    fixture_with(
        test_config(),
        TestTier::new(TierLevel::Distributed),
        TestTier::new(TierLevel::Durable),
    )
}

fn ctx() -> CallContext {
    CallContext::with_timeout(Duration::from_secs(5))
}

async fn seed(tier: &TestTier, key: &str, value: &str, tags: &[&str]) {
    let entry = CacheEntry::new(
        key,
        value.as_bytes().to_vec(),
        Duration::from_secs(60),
        tags.iter().map(|t| t.to_string()).collect(),
        tier.level(),
    );
    tier.put(entry).await.unwrap();
}

async fn present(tier: &TestTier, key: &str) -> bool {
    tier.inner.get(key).await.unwrap().is_some()
}

#[tokio::test]
async fn test_read_through_population() {
    let f = fixture();
    let calls = Arc::new(AtomicUsize::new(0));

    assert!(f.cache.get("dashboard:1", &ctx()).await.unwrap().is_none());

    let hit = f
        .cache
        .get_or_load("dashboard:1", SetOptions::new(), &ctx(), {
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(b"v1".to_vec())
            }
        })
        .await
        .unwrap();
    assert_eq!(hit.bytes(), b"v1");
    assert_eq!(hit.source, HitSource::Loader);

    for tier in [&f.local, &f.distributed, &f.durable] {
        assert!(present(tier, "dashboard:1").await, "{} missing value", tier.level());
    }

    let again = f
        .cache
        .get_or_load("dashboard:1", SetOptions::new(), &ctx(), {
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(b"other".to_vec())
            }
        })
        .await
        .unwrap();
    assert_eq!(again.bytes(), b"v1");
    assert_eq!(again.tier(), Some(TierLevel::Local));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_promotion_fills_faster_tiers() {
    let f = fixture();
    seed(&f.durable, "k", "cold", &["grp"]).await;

    let hit = f.cache.get("k", &ctx()).await.unwrap().unwrap();
    assert_eq!(hit.tier(), Some(TierLevel::Durable));
    assert_eq!(hit.bytes(), b"cold");

    assert!(present(&f.local, "k").await);
    assert!(present(&f.distributed, "k").await);

    let promoted = f.local.inner.get("k").await.unwrap().unwrap();
    assert!(promoted.remaining_ttl() <= Duration::from_secs(10));
    assert!(promoted.tags.contains("grp"));

    let next = f.cache.get("k", &ctx()).await.unwrap().unwrap();
    assert_eq!(next.tier(), Some(TierLevel::Local));
    assert_eq!(f.cache.stats().promotions, 2);
}

#[tokio::test]
async fn test_invalidate_clears_all_tiers() {
    let f = fixture();
    f.cache
        .set("k", b"v".to_vec(), SetOptions::new(), &ctx())
        .await
        .unwrap();

    f.cache.invalidate("k", &ctx()).await.unwrap();

    for tier in [&f.local, &f.distributed, &f.durable] {
        assert!(!present(tier, "k").await);
    }
    assert!(f.cache.get("k", &ctx()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_partial_invalidation_names_failed_tier() {
    let f = fixture();
    f.cache
        .set("k", b"v".to_vec(), SetOptions::new(), &ctx())
        .await
        .unwrap();

    f.distributed.set_down(true);
    let err = f.cache.invalidate("k", &ctx()).await.unwrap_err();
    match err {
        CacheError::PartialInvalidation { target, failed } => {
            assert_eq!(target, "k");
            assert_eq!(failed, vec![TierLevel::Distributed]);
        }
        other => panic!("expected partial invalidation, got {other:?}"),
    }

    assert!(!present(&f.local, "k").await);
    assert!(!present(&f.durable, "k").await);
    assert!(f.hook.count("tier_unavailable:distributed") >= 1);
}

#[tokio::test]
async fn test_tag_invalidation_scenario() {
    let f = fixture();
    let grouped = SetOptions::new().tag("grp");
    f.cache.set("k1", b"1".to_vec(), grouped.clone(), &ctx()).await.unwrap();
    f.cache.set("k2", b"2".to_vec(), grouped, &ctx()).await.unwrap();
    f.cache.set("k3", b"3".to_vec(), SetOptions::new(), &ctx()).await.unwrap();

    let removed = f.cache.invalidate_by_tag("grp", &ctx()).await.unwrap();
    assert_eq!(removed, 2);

    assert!(f.cache.get("k1", &ctx()).await.unwrap().is_none());
    assert!(f.cache.get("k2", &ctx()).await.unwrap().is_none());
    assert_eq!(f.cache.get("k3", &ctx()).await.unwrap().unwrap().bytes(), b"3");
}

#[tokio::test]
async fn test_unavailable_tier_is_skipped_on_read() {
    let f = fixture();
    seed(&f.durable, "k", "v", &[]).await;
    f.distributed.set_down(true);

    let hit = f.cache.get("k", &ctx()).await.unwrap().unwrap();
    assert_eq!(hit.tier(), Some(TierLevel::Durable));
    assert!(present(&f.local, "k").await);
    assert!(f.hook.count("tier_unavailable:distributed") >= 1);
}

#[tokio::test]
async fn test_write_through_fails_loudly() {
    let f = fixture();
    f.durable.set_down(true);

    let err = f
        .cache
        .set("k", b"v".to_vec(), SetOptions::new(), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Tier(TierError::Unavailable { tier: TierLevel::Durable, .. })));
}

#[tokio::test]
async fn test_loader_error_is_verbatim_and_not_cached() {
    let f = fixture();

    let err = f
        .cache
        .get_or_load("k", SetOptions::new(), &ctx(), || async {
            Err::<Vec<u8>, _>("upstream down".to_string())
        })
        .await
        .unwrap_err();
    assert_eq!(err.into_loader_error().as_deref(), Some("upstream down"));
    assert!(f.cache.get("k", &ctx()).await.unwrap().is_none());

    let hit = f
        .cache
        .get_or_load("k", SetOptions::new(), &ctx(), || async { Ok::<_, String>(b"ok".to_vec()) })
        .await
        .unwrap();
    assert_eq!(hit.bytes(), b"ok");
}

#[tokio::test]
async fn test_concurrent_loads_are_coalesced() {
    let f = fixture();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = Arc::clone(&f.cache);
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            cache
                .get_or_load("hot", SetOptions::new(), &ctx(), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, std::io::Error>(b"loaded".to_vec())
                })
                .await
                .map(|hit| hit.value)
        }));
    }

    for handle in handles {
        let value = handle.await.unwrap().unwrap();
        assert_eq!(value.as_slice(), b"loaded");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_write_back_delivers_later() {
    let f = fixture();
    f.cache
        .set(
            "k",
            b"v".to_vec(),
            SetOptions::new().strategy(WriteStrategy::WriteBack),
            &ctx(),
        )
        .await
        .unwrap();

    assert!(present(&f.local, "k").await);
    assert!(f.cache.flush_write_back(Duration::from_secs(2)).await);
    assert!(present(&f.distributed, "k").await);
    assert!(present(&f.durable, "k").await);
}

#[tokio::test]
async fn test_write_back_exhaustion_is_reported() {
    let f = fixture();
    f.durable.set_down(true);

    f.cache
        .set(
            "k",
            b"v".to_vec(),
            SetOptions::new().strategy(WriteStrategy::WriteBack),
            &ctx(),
        )
        .await
        .unwrap();

    assert!(f.cache.flush_write_back(Duration::from_secs(2)).await);
    assert!(present(&f.distributed, "k").await);
    assert_eq!(f.hook.count("write_back_failed:durable"), 1);
}

#[tokio::test]
async fn test_late_write_back_does_not_undo_invalidation() {
    let f = fixture_with(
        test_config(),
        TestTier::new(TierLevel::Distributed).gated(),
        TestTier::new(TierLevel::Durable),
    );
    let write_back = SetOptions::new().strategy(WriteStrategy::WriteBack);

    // First job parks on the gate, the second waits behind it.
    f.cache.set("blocker", b"b".to_vec(), write_back.clone(), &ctx()).await.unwrap();
    f.cache.set("k", b"stale".to_vec(), write_back, &ctx()).await.unwrap();

    f.cache.invalidate("k", &ctx()).await.unwrap();
    f.distributed.open_gate();
    assert!(f.cache.flush_write_back(Duration::from_secs(2)).await);

    assert!(present(&f.distributed, "blocker").await);
    assert!(!present(&f.distributed, "k").await);
    assert!(!present(&f.durable, "k").await);
    assert!(f.cache.get("k", &ctx()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_write_around_evicts_local_copy() {
    let f = fixture();
    f.cache.set("k", b"v1".to_vec(), SetOptions::new(), &ctx()).await.unwrap();
    f.cache
        .set(
            "k",
            b"v2".to_vec(),
            SetOptions::new().strategy(WriteStrategy::WriteAround),
            &ctx(),
        )
        .await
        .unwrap();

    assert!(!present(&f.local, "k").await);
    let hit = f.cache.get("k", &ctx()).await.unwrap().unwrap();
    assert_eq!(hit.bytes(), b"v2");
    assert_eq!(hit.tier(), Some(TierLevel::Distributed));
    assert!(present(&f.local, "k").await);
}

/// Stores `created_at` the way a TIMESTAMPTZ column does: microseconds.
struct TimestampColumnTier {
    inner: MemoryTier,
}

#[async_trait]
impl CacheTier for TimestampColumnTier {
    fn level(&self) -> TierLevel {
        self.inner.level()
    }

    fn backend(&self) -> &'static str {
        "timestamptz"
    }

    async fn get(&self, key: &str) -> TierResult<Option<CacheEntry>> {
        self.inner.get(key).await
    }

    async fn put(&self, mut entry: CacheEntry) -> TierResult<PutOutcome> {
        entry.created_at = entry.created_at.trunc_subsecs(6);
        self.inner.put(entry).await
    }

    async fn remove(&self, key: &str) -> TierResult<bool> {
        self.inner.remove(key).await
    }

    async fn remove_by_tag(&self, tag: &str) -> TierResult<Vec<String>> {
        self.inner.remove_by_tag(tag).await
    }
}

fn timestamp_column_cache() -> (Arc<CacheOrchestrator>, Arc<TestTier>) {
    let local = Arc::new(TestTier::new(TierLevel::Local));
    let cache = CacheOrchestrator::builder()
        .config(test_config())
        .local(Arc::clone(&local) as SharedTier)
        .distributed(Arc::new(TimestampColumnTier {
            inner: MemoryTier::standalone(TierLevel::Distributed),
        }))
        .durable(Arc::new(TimestampColumnTier {
            inner: MemoryTier::standalone(TierLevel::Durable),
        }))
        .build();
    (cache, local)
}

#[tokio::test]
async fn test_write_around_survives_storage_precision() {
    let (cache, _local) = timestamp_column_cache();
    let around = SetOptions::new().strategy(WriteStrategy::WriteAround);

    let mut misses = 0;
    for i in 0..20 {
        let key = format!("k{i}");
        cache.set(&key, b"v".to_vec(), around.clone(), &ctx()).await.unwrap();
        match cache.get(&key, &ctx()).await.unwrap() {
            Some(hit) => assert_eq!(hit.tier(), Some(TierLevel::Distributed)),
            None => misses += 1,
        }
    }
    assert_eq!(misses, 0);
}

#[tokio::test]
async fn test_set_right_after_invalidate_is_readable() {
    let (cache, local) = timestamp_column_cache();

    for i in 0..20 {
        let key = format!("k{i}");
        cache.set(&key, b"old".to_vec(), SetOptions::new(), &ctx()).await.unwrap();
        cache.invalidate(&key, &ctx()).await.unwrap();
        cache.set(&key, b"new".to_vec(), SetOptions::new(), &ctx()).await.unwrap();

        // Force the read below tier-1.
        local.inner.remove(&key).await.unwrap();
        let hit = cache.get(&key, &ctx()).await.unwrap().expect("value written after invalidation");
        assert_eq!(hit.bytes(), b"new");
        assert_eq!(hit.tier(), Some(TierLevel::Distributed));
    }
}

#[tokio::test]
async fn test_deadline_turns_into_timeout() {
    let f = fixture_with(
        test_config(),
        TestTier::new(TierLevel::Distributed).slow_reads(Duration::from_secs(2)),
        TestTier::new(TierLevel::Durable),
    );

    let err = f
        .cache
        .get("k", &CallContext::with_timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    let err = f
        .cache
        .get_or_load(
            "k",
            SetOptions::new(),
            &CallContext::with_timeout(Duration::from_millis(50)),
            || async { Ok::<_, String>(b"v".to_vec()) },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::Cache(CacheError::Timeout { operation: "get_or_load" })));
}

#[tokio::test]
async fn test_hot_keys_get_longer_ttl() {
    let config = OrchestratorConfig {
        adaptive: AdaptiveTtlConfig {
            enabled: true,
            window: Duration::from_secs(60),
            hot_threshold: 3,
            extension_step: 1.0,
            max_ttl: Duration::from_secs(600),
            max_tracked_keys: 100,
        },
        ..test_config()
    };
    let f = fixture_with(
        config,
        TestTier::new(TierLevel::Distributed),
        TestTier::new(TierLevel::Durable),
    );

    for _ in 0..3 {
        f.cache.get("hot", &ctx()).await.unwrap();
    }
    f.cache.set("hot", b"v".to_vec(), SetOptions::new(), &ctx()).await.unwrap();
    f.cache.set("cold", b"v".to_vec(), SetOptions::new(), &ctx()).await.unwrap();

    let hot = f.durable.inner.get("hot").await.unwrap().unwrap();
    let cold = f.durable.inner.get("cold").await.unwrap().unwrap();
    assert!(hot.remaining_ttl() > Duration::from_secs(100));
    assert!(cold.remaining_ttl() <= Duration::from_secs(60));

    // tier-1 stays clamped regardless
    let local = f.local.inner.get("hot").await.unwrap().unwrap();
    assert!(local.remaining_ttl() <= Duration::from_secs(10));
}

#[tokio::test]
async fn test_json_helpers_and_stats() {
    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Widget {
        id: u32,
        label: String,
    }

    let f = fixture();
    let widget = Widget {
        id: 7,
        label: "pipeline".into(),
    };
    f.cache.set_json("widget:7", &widget, SetOptions::new(), &ctx()).await.unwrap();

    let back: Option<Widget> = f.cache.get_json("widget:7", &ctx()).await.unwrap();
    assert_eq!(back, Some(widget));
    let missing: Option<Widget> = f.cache.get_json("widget:8", &ctx()).await.unwrap();
    assert!(missing.is_none());

    let stats = f.cache.stats();
    assert_eq!(stats.hits.get(TierLevel::Local), 1);
    assert_eq!(stats.misses.get(TierLevel::Durable), 1);
    assert_eq!(stats.local_entries, 1);
    assert_eq!(f.hook.count("hit:local"), 1);
}

#[tokio::test]
async fn test_health_reports_each_tier() {
    let f = fixture();
    f.durable.set_down(true);

    let health = f.cache.health().await;
    assert_eq!(health.len(), 3);
    assert!(health[0].healthy);
    assert!(health[1].healthy);
    assert!(!health[2].healthy);
    assert_eq!(health[2].tier, TierLevel::Durable);
}

#[tokio::test]
async fn test_shutdown_drains_write_back() {
    let f = fixture();
    f.cache
        .set(
            "k",
            b"v".to_vec(),
            SetOptions::new().strategy(WriteStrategy::WriteBack),
            &ctx(),
        )
        .await
        .unwrap();

    f.cache.shutdown().await;
    assert!(present(&f.durable, "k").await);

    let err = f
        .cache
        .set(
            "k2",
            b"v".to_vec(),
            SetOptions::new().strategy(WriteStrategy::WriteBack),
            &ctx(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::WriteBackClosed));
}
