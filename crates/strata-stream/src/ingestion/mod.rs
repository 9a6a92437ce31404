//! Stream ingestion layer.
//!
//! One ingest task per feed pulls batches and hands records to a fixed pool
//! of processing workers over bounded channels. A feed is always pinned to
//! the same worker, so its events are applied in token order.
//!
//! ```text
//!  feed A ─ ingest task ─┐            ┌─ worker 0 ─┐
//!  feed B ─ ingest task ─┼─ bounded ──┤            ├─ cache effects ─▶ CacheOrchestrator
//!  feed C ─ ingest task ─┘   queues   └─ worker 1 ─┘  publish       ─▶ PublishSink
//! ```
//!
//! A worker commits a token to the [`CheckpointStore`] only after the
//! event's effects were applied or the event was dead-lettered.

mod worker;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use strata_cache::CacheOrchestrator;
use strata_core::{ExponentialBackoff, FeedId, MonitoringHook, NoopHook, PublishSink, SequenceToken};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use crate::dead_letter::{DeadLetterSink, MemoryDeadLetterLog};
use crate::error::{StreamError, StreamResult};
use crate::feed::ChangeFeed;
use crate::processor::StreamProcessor;

use worker::{FeedTask, ProcessingWorker, WorkItem};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Size of the processing pool.
    pub workers: usize,
    /// Capacity of each worker's queue.
    pub queue_capacity: usize,
    /// Maximum records pulled per poll.
    pub batch_size: usize,
    /// Pause between polls of an idle feed.
    pub poll_interval: Duration,
    /// Backoff for unavailable feeds. Retries are unbounded; only the delay
    /// is capped.
    pub poll_retry: ExponentialBackoff,
    /// Backoff and attempt budget for failing events before they are
    /// dead-lettered.
    pub process_retry: ExponentialBackoff,
    /// Deadline for applying one event's cache effects.
    pub effect_timeout: Duration,
    /// How long shutdown waits for queued work before aborting.
    pub drain_timeout: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            batch_size: 100,
            poll_interval: Duration::from_millis(250),
            poll_retry: ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(30), u32::MAX),
            process_retry: ExponentialBackoff::new(Duration::from_millis(50), Duration::from_secs(2), 5),
            effect_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

// ============================================================================
// Feed status
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FeedState {
    Starting,
    Running,
    /// Retrying an unreachable feed.
    Retrying { attempt: u32, reason: String },
    /// The feed stopped for good. Other feeds are unaffected.
    Failed { reason: String },
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedStatus {
    pub feed: FeedId,
    #[serde(flatten)]
    pub state: FeedState,
    pub processed: u64,
    pub dead_lettered: u64,
    pub duplicates_skipped: u64,
    /// Token of the last applied (or dead-lettered) event.
    pub last_token: Option<SequenceToken>,
}

impl FeedStatus {
    fn new(feed: FeedId) -> Self {
        Self {
            feed,
            state: FeedState::Starting,
            processed: 0,
            dead_lettered: 0,
            duplicates_skipped: 0,
            last_token: None,
        }
    }
}

/// Live view of every feed's status. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct FeedStatuses {
    inner: Arc<DashMap<FeedId, FeedStatus>>,
}

impl FeedStatuses {
    pub fn get(&self, feed: &FeedId) -> Option<FeedStatus> {
        self.inner.get(feed).map(|s| s.clone())
    }

    /// All statuses ordered by feed id.
    pub fn all(&self) -> Vec<FeedStatus> {
        let mut all: Vec<FeedStatus> = self.inner.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.feed.cmp(&b.feed));
        all
    }

    /// Whether every feed is still alive.
    pub fn is_healthy(&self) -> bool {
        self.inner
            .iter()
            .all(|s| !matches!(s.state, FeedState::Failed { .. }))
    }

    fn insert(&self, feed: FeedId) {
        self.inner.insert(feed.clone(), FeedStatus::new(feed));
    }

    fn update(&self, feed: &FeedId, f: impl FnOnce(&mut FeedStatus)) {
        if let Some(mut status) = self.inner.get_mut(feed) {
            f(&mut status);
        }
    }

    fn set_state(&self, feed: &FeedId, state: FeedState) {
        self.update(feed, |s| s.state = state);
    }

    fn last_token(&self, feed: &FeedId) -> Option<SequenceToken> {
        self.inner.get(feed).and_then(|s| s.last_token)
    }
}

// ============================================================================
// Layer
// ============================================================================

/// Dependencies shared by every ingest task and worker.
pub(crate) struct Shared {
    pub(crate) config: IngestionConfig,
    pub(crate) cache: Arc<CacheOrchestrator>,
    pub(crate) publisher: Arc<dyn PublishSink>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) dead_letters: Arc<dyn DeadLetterSink>,
    pub(crate) monitor: Arc<dyn MonitoringHook>,
    pub(crate) statuses: FeedStatuses,
    /// Records handed to a worker and not yet committed.
    pub(crate) pending: AtomicUsize,
}

struct Registration {
    feed: Arc<dyn ChangeFeed>,
    processor: Arc<dyn StreamProcessor>,
}

pub struct IngestionLayerBuilder {
    config: IngestionConfig,
    cache: Arc<CacheOrchestrator>,
    publisher: Arc<dyn PublishSink>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    monitor: Option<Arc<dyn MonitoringHook>>,
    feeds: Vec<Registration>,
}

impl IngestionLayerBuilder {
    pub fn config(mut self, config: IngestionConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a feed with the processor for its events.
    pub fn feed(mut self, feed: Arc<dyn ChangeFeed>, processor: Arc<dyn StreamProcessor>) -> Self {
        self.feeds.push(Registration { feed, processor });
        self
    }

    /// Defaults to [`MemoryCheckpointStore`].
    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Defaults to [`MemoryDeadLetterLog`].
    pub fn dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn MonitoringHook>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn build(self) -> StreamResult<IngestionLayer> {
        let mut seen = HashSet::new();
        for registration in &self.feeds {
            let id = registration.feed.id();
            if !seen.insert(id.clone()) {
                return Err(StreamError::DuplicateFeed(id.clone()));
            }
        }

        let mut config = self.config;
        config.workers = config.workers.max(1);
        config.queue_capacity = config.queue_capacity.max(1);
        config.batch_size = config.batch_size.max(1);

        Ok(IngestionLayer {
            shared: Arc::new(Shared {
                config,
                cache: self.cache,
                publisher: self.publisher,
                checkpoints: self
                    .checkpoints
                    .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new())),
                dead_letters: self
                    .dead_letters
                    .unwrap_or_else(|| Arc::new(MemoryDeadLetterLog::new())),
                monitor: self.monitor.unwrap_or_else(NoopHook::shared),
                statuses: FeedStatuses::default(),
                pending: AtomicUsize::new(0),
            }),
            feeds: self.feeds,
        })
    }
}

/// Configured but not yet running ingestion layer.
pub struct IngestionLayer {
    shared: Arc<Shared>,
    feeds: Vec<Registration>,
}

impl IngestionLayer {
    pub fn builder(cache: Arc<CacheOrchestrator>, publisher: Arc<dyn PublishSink>) -> IngestionLayerBuilder {
        IngestionLayerBuilder {
            config: IngestionConfig::default(),
            cache,
            publisher,
            checkpoints: None,
            dead_letters: None,
            monitor: None,
            feeds: Vec::new(),
        }
    }

    pub fn statuses(&self) -> FeedStatuses {
        self.shared.statuses.clone()
    }

    /// Spawn the worker pool and one ingest task per feed.
    pub fn start(self) -> IngestionHandle {
        let shared = self.shared;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut senders = Vec::with_capacity(shared.config.workers);
        let mut workers = Vec::with_capacity(shared.config.workers);
        for index in 0..shared.config.workers {
            let (tx, rx) = mpsc::channel::<WorkItem>(shared.config.queue_capacity);
            senders.push(tx);
            let worker = ProcessingWorker::new(index, shared.clone(), rx);
            workers.push(tokio::spawn(worker.run()));
        }

        let mut feeds = Vec::with_capacity(self.feeds.len());
        for registration in self.feeds {
            let id = registration.feed.id().clone();
            shared.statuses.insert(id.clone());
            let index = worker_for(&id, senders.len());
            let task = FeedTask {
                feed: registration.feed,
                processor: registration.processor,
                queue: senders[index].clone(),
                shared: shared.clone(),
            };
            info!(feed = %id, worker = index, "starting feed ingestion");
            feeds.push(tokio::spawn(task.run(shutdown_rx.clone())));
        }
        // Workers exit once every ingest task has dropped its sender.
        drop(senders);

        IngestionHandle {
            shared,
            shutdown: shutdown_tx,
            feeds,
            workers,
        }
    }
}

/// Worker a feed is pinned to.
pub(crate) fn worker_for(feed: &FeedId, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    feed.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every queued record was committed before the drain timeout.
    pub drained: bool,
    /// Records still queued or in flight when the tasks were aborted.
    pub abandoned: usize,
}

pub struct IngestionHandle {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    feeds: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl IngestionHandle {
    pub fn statuses(&self) -> FeedStatuses {
        self.shared.statuses.clone()
    }

    /// Records handed to workers and not yet committed.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Stop polling, drain queued work for up to the configured drain
    /// timeout, then abort whatever is left.
    pub async fn shutdown(mut self) -> ShutdownReport {
        let _ = self.shutdown.send(true);
        let deadline = tokio::time::Instant::now() + self.shared.config.drain_timeout;

        let tasks = self.feeds.iter_mut().chain(self.workers.iter_mut());
        let drained = tokio::time::timeout_at(deadline, futures_util::future::join_all(tasks))
            .await
            .is_ok();

        let mut abandoned = 0;
        if !drained {
            for task in self.feeds.iter().chain(self.workers.iter()) {
                task.abort();
            }
            abandoned = self.shared.pending.load(Ordering::Acquire);
            warn!(abandoned, "ingestion drain timed out, aborting workers");
        }

        for status in self.shared.statuses.all() {
            if !matches!(status.state, FeedState::Failed { .. }) {
                self.shared.statuses.set_state(&status.feed, FeedState::Stopped);
            }
        }
        info!(drained, abandoned, "ingestion stopped");
        ShutdownReport { drained, abandoned }
    }
}
