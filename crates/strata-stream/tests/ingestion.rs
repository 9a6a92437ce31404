//! End-to-end tests for the ingestion layer over in-memory feeds, stores
//! and cache tiers.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use strata_cache::{CacheOrchestrator, CallContext};
use strata_core::{
    ChangeEvent, ChangeKind, CountingHook, ExponentialBackoff, FeedId, Publication, PublishReport,
    PublishSink, SequenceToken,
};
use strata_stream::{
    ChangeFeed, CheckpointStore, Effects, EntityChangeProcessor, FeedBatch, FeedError, FeedState,
    IngestionConfig, IngestionLayer, MemoryCheckpointStore, MemoryDeadLetterLog, MemoryFeed,
    ProcessorError, PublishEffect, StoreResult, StreamProcessor,
};

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<Publication>>,
}

impl RecordingSink {
    fn topics(&self) -> Vec<String> {
        self.published.lock().iter().map(|p| p.topic.clone()).collect()
    }
}

impl PublishSink for RecordingSink {
    fn publish(&self, publication: Publication) -> PublishReport {
        self.published.lock().push(publication);
        PublishReport {
            matched: 1,
            enqueued: 1,
            ..Default::default()
        }
    }
}

/// Records every token it sees; fails or panics on selected entity ids.
#[derive(Default)]
struct ScriptedProcessor {
    seen: Mutex<Vec<SequenceToken>>,
    calls: AtomicUsize,
}

impl ScriptedProcessor {
    fn seen(&self) -> Vec<SequenceToken> {
        self.seen.lock().clone()
    }
}

impl StreamProcessor for ScriptedProcessor {
    fn name(&self) -> &str {
        "scripted"
    }

    fn process(&self, event: &ChangeEvent) -> Result<Effects, ProcessorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match event.entity_id.as_str() {
            "bad" => return Err(ProcessorError::rejected("refusing bad entity")),
            "panic" => panic!("processor bug"),
            _ => {}
        }
        self.seen.lock().push(event.sequence_token);
        Ok(Effects::none().publish(PublishEffect::for_event(event, "channel:test", json!({}))))
    }
}

/// Blocks its thread until `release` is called.
struct GatedProcessor {
    gate: Mutex<std::sync::mpsc::Receiver<()>>,
    released: AtomicBool,
    processed: AtomicUsize,
}

impl StreamProcessor for GatedProcessor {
    fn name(&self) -> &str {
        "gated"
    }

    fn process(&self, _event: &ChangeEvent) -> Result<Effects, ProcessorError> {
        if !self.released.load(Ordering::SeqCst) {
            let _ = self.gate.lock().recv();
        }
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(Effects::none())
    }
}

/// Feed that redelivers everything from the start on its second
/// non-empty poll.
struct ReplayingFeed {
    inner: MemoryFeed,
    replayed: AtomicBool,
    served: AtomicUsize,
}

#[async_trait]
impl ChangeFeed for ReplayingFeed {
    fn id(&self) -> &FeedId {
        self.inner.id()
    }

    async fn poll(&self, since: Option<SequenceToken>, max: usize) -> Result<FeedBatch, FeedError> {
        let since = if self.served.load(Ordering::SeqCst) > 0 && !self.replayed.swap(true, Ordering::SeqCst) {
            None
        } else {
            since
        };
        let batch = self.inner.poll(since, max).await?;
        if !batch.is_empty() {
            self.served.fetch_add(1, Ordering::SeqCst);
        }
        Ok(batch)
    }
}

/// Checkpoint store whose saves hang past `stall_from` while `stalled` is set.
struct StallingCheckpoints {
    inner: MemoryCheckpointStore,
    stall_from: SequenceToken,
    stalled: AtomicBool,
}

#[async_trait]
impl CheckpointStore for StallingCheckpoints {
    async fn load(&self, feed: &FeedId) -> StoreResult<Option<SequenceToken>> {
        self.inner.load(feed).await
    }

    async fn save(&self, feed: &FeedId, token: SequenceToken) -> StoreResult<()> {
        if token >= self.stall_from && self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.save(feed, token).await
    }
}

fn feed_id(name: &str) -> FeedId {
    FeedId::new(name).unwrap()
}

fn fast_config() -> IngestionConfig {
    IngestionConfig {
        workers: 2,
        queue_capacity: 16,
        batch_size: 10,
        poll_interval: Duration::from_millis(5),
        poll_retry: ExponentialBackoff::new(Duration::from_millis(5), Duration::from_millis(20), u32::MAX),
        process_retry: ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(2), 3),
        effect_timeout: Duration::from_secs(1),
        drain_timeout: Duration::from_secs(2),
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn append_widgets(feed: &MemoryFeed, ids: &[&str]) {
    for id in ids {
        feed.append("widget", id, ChangeKind::Updated, json!({"id": id}));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_entity_change_reaches_cache_and_subscribers() {
    let cache = CacheOrchestrator::builder().build();
    let sink = Arc::new(RecordingSink::default());
    let feed = Arc::new(MemoryFeed::new(feed_id("crm")));
    feed.append(
        "deal",
        "d1",
        ChangeKind::Created,
        json!({"name": "Acme", "stage": "won", "amount": 1200.0}),
    );

    let handle = IngestionLayer::builder(cache.clone(), sink.clone())
        .config(fast_config())
        .feed(feed.clone(), Arc::new(EntityChangeProcessor::new()))
        .build()
        .unwrap()
        .start();

    let statuses = handle.statuses();
    wait_until("event applied", || {
        statuses.get(&feed_id("crm")).is_some_and(|s| s.processed == 1)
    })
    .await;

    let cached: serde_json::Value = cache
        .get_json("entity:deal:d1", &CallContext::background())
        .await
        .unwrap()
        .expect("deal cached");
    assert_eq!(cached["stage"], "won");
    assert_eq!(sink.topics(), vec!["entity:deal:d1".to_string()]);
    assert_eq!(
        sink.published.lock()[0].dedupe_key.as_deref(),
        Some("crm@1-0/entity:deal:d1")
    );

    let report = handle.shutdown().await;
    assert!(report.drained);
    assert_eq!(report.abandoned, 0);
    assert_eq!(statuses.get(&feed_id("crm")).unwrap().state, FeedState::Stopped);
}

#[tokio::test]
async fn test_restart_resumes_after_checkpoint() {
    let cache = CacheOrchestrator::builder().build();
    let sink = Arc::new(RecordingSink::default());
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let feed = Arc::new(MemoryFeed::new(feed_id("events")));
    append_widgets(&feed, &["a", "b", "c"]);

    let first = Arc::new(ScriptedProcessor::default());
    let handle = IngestionLayer::builder(cache.clone(), sink.clone())
        .config(fast_config())
        .checkpoints(checkpoints.clone())
        .feed(feed.clone(), first.clone())
        .build()
        .unwrap()
        .start();
    wait_until("first run", || first.seen().len() == 3).await;
    handle.shutdown().await;
    assert_eq!(checkpoints.get(&feed_id("events")), Some(SequenceToken::offset(3)));

    append_widgets(&feed, &["d", "e"]);

    let second = Arc::new(ScriptedProcessor::default());
    let handle = IngestionLayer::builder(cache, sink)
        .config(fast_config())
        .checkpoints(checkpoints.clone())
        .feed(feed.clone(), second.clone())
        .build()
        .unwrap()
        .start();
    wait_until("second run", || second.seen().len() == 2).await;
    handle.shutdown().await;

    assert_eq!(second.seen(), vec![SequenceToken::offset(4), SequenceToken::offset(5)]);
    assert_eq!(
        checkpoints.load(&feed_id("events")).await.unwrap(),
        Some(SequenceToken::offset(5))
    );
}

#[tokio::test]
async fn test_abandoned_records_are_redelivered_after_restart() {
    let cache = CacheOrchestrator::builder().build();
    let sink = Arc::new(RecordingSink::default());
    let checkpoints = Arc::new(StallingCheckpoints {
        inner: MemoryCheckpointStore::new(),
        stall_from: SequenceToken::offset(3),
        stalled: AtomicBool::new(true),
    });
    let feed = Arc::new(MemoryFeed::new(feed_id("orders")));
    append_widgets(&feed, &["a", "b", "c", "d", "e"]);

    let first = Arc::new(ScriptedProcessor::default());
    let handle = IngestionLayer::builder(cache.clone(), sink.clone())
        .config(IngestionConfig {
            drain_timeout: Duration::from_millis(100),
            ..fast_config()
        })
        .checkpoints(checkpoints.clone())
        .feed(feed.clone(), first.clone())
        .build()
        .unwrap()
        .start();
    wait_until("commit stalls", || first.seen().len() == 3).await;

    let report = handle.shutdown().await;
    assert!(!report.drained);
    assert!(report.abandoned >= 1, "abandoned {}", report.abandoned);
    assert_eq!(checkpoints.inner.get(&feed_id("orders")), Some(SequenceToken::offset(2)));

    checkpoints.stalled.store(false, Ordering::SeqCst);
    let second = Arc::new(ScriptedProcessor::default());
    let handle = IngestionLayer::builder(cache, sink)
        .config(fast_config())
        .checkpoints(checkpoints.clone())
        .feed(feed.clone(), second.clone())
        .build()
        .unwrap()
        .start();
    wait_until("redelivery", || second.seen().len() == 3).await;
    assert!(handle.shutdown().await.drained);

    assert_eq!(
        second.seen(),
        vec![SequenceToken::offset(3), SequenceToken::offset(4), SequenceToken::offset(5)]
    );
    assert_eq!(checkpoints.inner.get(&feed_id("orders")), Some(SequenceToken::offset(5)));
}

#[tokio::test]
async fn test_redelivered_events_are_applied_once() {
    let cache = CacheOrchestrator::builder().build();
    let sink = Arc::new(RecordingSink::default());
    let inner = MemoryFeed::new(feed_id("replay"));
    append_widgets(&inner, &["a", "b", "c"]);
    let feed = Arc::new(ReplayingFeed {
        inner,
        replayed: AtomicBool::new(false),
        served: AtomicUsize::new(0),
    });

    let processor = Arc::new(ScriptedProcessor::default());
    let handle = IngestionLayer::builder(cache, sink.clone())
        .config(fast_config())
        .feed(feed.clone(), processor.clone())
        .build()
        .unwrap()
        .start();

    let statuses = handle.statuses();
    wait_until("replay skipped", || {
        statuses
            .get(&feed_id("replay"))
            .is_some_and(|s| s.duplicates_skipped == 3)
    })
    .await;
    handle.shutdown().await;

    assert!(feed.replayed.load(Ordering::SeqCst));
    assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
    assert_eq!(sink.topics().len(), 3);
    let status = statuses.get(&feed_id("replay")).unwrap();
    assert_eq!(status.processed, 3);
    assert_eq!(status.last_token, Some(SequenceToken::offset(3)));
}

#[tokio::test]
async fn test_poison_events_are_dead_lettered_and_feed_continues() {
    let cache = CacheOrchestrator::builder().build();
    let sink = Arc::new(RecordingSink::default());
    let monitor = Arc::new(CountingHook::new());
    let dead_letters = Arc::new(MemoryDeadLetterLog::new());
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let feed = Arc::new(MemoryFeed::new(feed_id("crm")));

    append_widgets(&feed, &["ok-1", "bad", "panic"]);
    // Fails the deal schema: becomes a malformed record.
    feed.append("deal", "d1", ChangeKind::Created, json!({"name": "no stage"}));
    append_widgets(&feed, &["ok-2"]);

    let processor = Arc::new(ScriptedProcessor::default());
    let handle = IngestionLayer::builder(cache, sink)
        .config(fast_config())
        .checkpoints(checkpoints.clone())
        .dead_letters(dead_letters.clone())
        .monitor(monitor.clone())
        .feed(feed.clone(), processor.clone())
        .build()
        .unwrap()
        .start();

    wait_until("feed drained", || {
        checkpoints.get(&feed_id("crm")) == Some(SequenceToken::offset(5))
    })
    .await;
    let statuses = handle.statuses();
    handle.shutdown().await;

    assert_eq!(
        processor.seen(),
        vec![SequenceToken::offset(1), SequenceToken::offset(5)]
    );
    // Two failing events, three attempts each, plus the two good ones.
    assert_eq!(processor.calls.load(Ordering::SeqCst), 8);

    let letters = dead_letters.letters();
    assert_eq!(letters.len(), 3);
    assert_eq!(letters[0].token, SequenceToken::offset(2));
    assert_eq!(letters[0].attempts, 3);
    assert!(letters[0].reason.contains("refusing bad entity"));
    assert_eq!(letters[1].token, SequenceToken::offset(3));
    assert!(letters[1].reason.contains("processor bug"));
    assert_eq!(letters[2].processor, "normalizer");
    assert_eq!(letters[2].record["payload"]["name"], "no stage");

    assert_eq!(monitor.count("dead_letter:crm"), 3);
    assert_eq!(statuses.get(&feed_id("crm")).unwrap().dead_lettered, 3);
}

#[tokio::test]
async fn test_expired_checkpoint_fails_only_that_feed() {
    let cache = CacheOrchestrator::builder().build();
    let sink = Arc::new(RecordingSink::default());
    let checkpoints = Arc::new(MemoryCheckpointStore::new());

    let stale = Arc::new(MemoryFeed::new(feed_id("stale")));
    append_widgets(&stale, &["a", "b", "c"]);
    stale.compact_through(SequenceToken::offset(2));
    checkpoints
        .save(&feed_id("stale"), SequenceToken::offset(1))
        .await
        .unwrap();

    let healthy = Arc::new(MemoryFeed::new(feed_id("healthy")));
    append_widgets(&healthy, &["x", "y"]);

    let processor = Arc::new(ScriptedProcessor::default());
    let handle = IngestionLayer::builder(cache, sink)
        .config(fast_config())
        .checkpoints(checkpoints.clone())
        .feed(stale.clone(), processor.clone())
        .feed(healthy.clone(), processor.clone())
        .build()
        .unwrap()
        .start();

    let statuses = handle.statuses();
    wait_until("both feeds settled", || {
        let stale_failed = statuses
            .get(&feed_id("stale"))
            .is_some_and(|s| matches!(s.state, FeedState::Failed { .. }));
        let healthy_done = statuses
            .get(&feed_id("healthy"))
            .is_some_and(|s| s.processed == 2);
        stale_failed && healthy_done
    })
    .await;

    assert!(!statuses.is_healthy());
    match statuses.get(&feed_id("stale")).unwrap().state {
        FeedState::Failed { reason } => {
            assert!(reason.contains("cannot resume from 1-0"), "{reason}");
            assert!(reason.contains("earliest retained token is 3-0"), "{reason}");
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(checkpoints.get(&feed_id("stale")), Some(SequenceToken::offset(1)));

    handle.shutdown().await;
    assert!(matches!(
        statuses.get(&feed_id("stale")).unwrap().state,
        FeedState::Failed { .. }
    ));
}

#[tokio::test]
async fn test_per_feed_order_is_preserved() {
    let cache = CacheOrchestrator::builder().build();
    let sink = Arc::new(RecordingSink::default());
    let feeds: Vec<Arc<MemoryFeed>> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|name| Arc::new(MemoryFeed::new(feed_id(name))))
        .collect();
    let processors: Vec<Arc<ScriptedProcessor>> =
        feeds.iter().map(|_| Arc::new(ScriptedProcessor::default())).collect();

    let mut builder = IngestionLayer::builder(cache, sink).config(IngestionConfig {
        workers: 4,
        batch_size: 7,
        ..fast_config()
    });
    for (feed, processor) in feeds.iter().zip(&processors) {
        for i in 0..40 {
            feed.append("widget", &format!("w{i}"), ChangeKind::Updated, json!({"i": i}));
        }
        builder = builder.feed(feed.clone(), processor.clone());
    }
    let handle = builder.build().unwrap().start();

    wait_until("all feeds applied", || processors.iter().all(|p| p.seen().len() == 40)).await;
    handle.shutdown().await;

    let expected: Vec<SequenceToken> = (1..=40).map(SequenceToken::offset).collect();
    for processor in &processors {
        assert_eq!(processor.seen(), expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_processing_backpressures_polling() {
    let cache = CacheOrchestrator::builder().build();
    let sink = Arc::new(RecordingSink::default());
    let feed = Arc::new(MemoryFeed::new(feed_id("busy")));
    for i in 0..50 {
        feed.append("widget", &format!("w{i}"), ChangeKind::Updated, json!({}));
    }

    let (release, gate) = std::sync::mpsc::channel::<()>();
    let processor = Arc::new(GatedProcessor {
        gate: Mutex::new(gate),
        released: AtomicBool::new(false),
        processed: AtomicUsize::new(0),
    });

    let handle = IngestionLayer::builder(cache, sink)
        .config(IngestionConfig {
            workers: 1,
            queue_capacity: 1,
            batch_size: 1,
            ..fast_config()
        })
        .feed(feed.clone(), processor.clone())
        .build()
        .unwrap()
        .start();

    tokio::time::sleep(Duration::from_millis(200)).await;
    // One record in the worker, one in the queue, one waiting to be sent.
    assert!(feed.poll_count() <= 3, "polled {} times", feed.poll_count());
    assert!(handle.pending() <= 3);
    assert_eq!(processor.processed.load(Ordering::SeqCst), 0);

    processor.released.store(true, Ordering::SeqCst);
    drop(release);

    wait_until("queue drained", || processor.processed.load(Ordering::SeqCst) == 50).await;
    let report = handle.shutdown().await;
    assert!(report.drained);
}

#[tokio::test]
async fn test_unavailable_feed_is_retried() {
    let cache = CacheOrchestrator::builder().build();
    let sink = Arc::new(RecordingSink::default());
    let feed = Arc::new(MemoryFeed::new(feed_id("flaky")));
    append_widgets(&feed, &["a"]);
    feed.set_unavailable(true);

    let processor = Arc::new(ScriptedProcessor::default());
    let handle = IngestionLayer::builder(cache, sink)
        .config(fast_config())
        .feed(feed.clone(), processor.clone())
        .build()
        .unwrap()
        .start();

    let statuses = handle.statuses();
    wait_until("retrying", || {
        statuses
            .get(&feed_id("flaky"))
            .is_some_and(|s| matches!(s.state, FeedState::Retrying { attempt, .. } if attempt >= 2))
    })
    .await;
    assert!(processor.seen().is_empty());

    feed.set_unavailable(false);
    wait_until("recovered", || processor.seen().len() == 1).await;
    assert_eq!(statuses.get(&feed_id("flaky")).unwrap().state, FeedState::Running);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_feed_registration_is_rejected() {
    let cache = CacheOrchestrator::builder().build();
    let sink = Arc::new(RecordingSink::default());
    let processor = Arc::new(ScriptedProcessor::default());

    let result = IngestionLayer::builder(cache, sink)
        .feed(Arc::new(MemoryFeed::new(feed_id("crm"))), processor.clone())
        .feed(Arc::new(MemoryFeed::new(feed_id("crm"))), processor)
        .build();
    assert!(matches!(result, Err(strata_stream::StreamError::DuplicateFeed(_))));
}
