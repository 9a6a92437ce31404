//! Ingest tasks and processing workers.

use chrono::Utc;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use strata_cache::{CallContext, SetOptions};
use strata_core::{ChangeEvent, FeedId, SequenceToken};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use super::{FeedState, Shared};
use crate::dead_letter::DeadLetter;
use crate::error::{FeedError, ProcessorError, StreamError};
use crate::feed::{ChangeFeed, FeedRecord};
use crate::processor::{CacheEffect, Effects, StreamProcessor};

pub(crate) struct WorkItem {
    pub(crate) feed: FeedId,
    pub(crate) processor: Arc<dyn StreamProcessor>,
    pub(crate) record: FeedRecord,
}

/// Sleep for `delay` unless shutdown is signalled first. Returns `true` on
/// shutdown.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        biased;

        result = shutdown.changed() => result.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

// ============================================================================
// Ingest task
// ============================================================================

pub(crate) struct FeedTask {
    pub(crate) feed: Arc<dyn ChangeFeed>,
    pub(crate) processor: Arc<dyn StreamProcessor>,
    pub(crate) queue: mpsc::Sender<WorkItem>,
    pub(crate) shared: Arc<Shared>,
}

impl FeedTask {
    #[instrument(name = "ingest", skip_all, fields(feed = %self.feed.id()))]
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let id = self.feed.id().clone();
        let config = &self.shared.config;

        let Some(mut position) = self.load_checkpoint(&id, &mut shutdown).await else {
            return;
        };
        if let Some(token) = position {
            self.shared.statuses.update(&id, |s| s.last_token = Some(token));
            info!(token = %token, "resuming from checkpoint");
        }

        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = match self.feed.poll(position, config.batch_size).await {
                Ok(batch) => {
                    if failures > 0 {
                        info!(attempts = failures, "feed reachable again");
                    }
                    failures = 0;
                    self.shared.statuses.set_state(&id, FeedState::Running);
                    batch
                }
                Err(FeedError::TokenExpired { requested, earliest }) => {
                    let err = StreamError::FeedResumption {
                        feed: id.clone(),
                        requested,
                        earliest,
                    };
                    error!(error = %err, "feed cannot resume, stopping ingestion for this feed");
                    self.shared.statuses.set_state(
                        &id,
                        FeedState::Failed {
                            reason: err.to_string(),
                        },
                    );
                    return;
                }
                Err(FeedError::Unavailable(reason)) => {
                    failures = failures.saturating_add(1);
                    let delay = config.poll_retry.delay(failures);
                    warn!(attempt = failures, delay_ms = delay.as_millis() as u64, %reason, "feed poll failed");
                    self.shared.statuses.set_state(
                        &id,
                        FeedState::Retrying {
                            attempt: failures,
                            reason,
                        },
                    );
                    if sleep_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                if sleep_or_shutdown(config.poll_interval, &mut shutdown).await {
                    break;
                }
                continue;
            }

            debug!(count = batch.len(), "pulled batch");
            let next = batch.next_token;
            for record in batch.records {
                let token = record.token();
                let item = WorkItem {
                    feed: id.clone(),
                    processor: self.processor.clone(),
                    record,
                };
                // Blocks while the worker's queue is full.
                self.shared.pending.fetch_add(1, Ordering::AcqRel);
                let sent = tokio::select! {
                    biased;

                    _ = shutdown.changed() => None,
                    sent = self.queue.send(item) => Some(sent.is_ok()),
                };
                match sent {
                    Some(true) => {}
                    Some(false) => {
                        self.shared.pending.fetch_sub(1, Ordering::AcqRel);
                        warn!("processing worker stopped, ending ingestion");
                        return;
                    }
                    None => {
                        self.shared.pending.fetch_sub(1, Ordering::AcqRel);
                        debug!("shutdown while enqueueing, rest of the batch is left for the next run");
                        return;
                    }
                }
                position = Some(token);
            }
            if next > position {
                position = next;
            }
        }
        debug!("ingest task stopped");
    }

    /// Outer `None` means shutdown was requested while loading.
    async fn load_checkpoint(
        &self,
        id: &FeedId,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Option<SequenceToken>> {
        let mut attempt = 0u32;
        loop {
            match self.shared.checkpoints.load(id).await {
                Ok(token) => return Some(token),
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.shared.config.poll_retry.delay(attempt);
                    warn!(error = %e, attempt, "failed to load checkpoint");
                    if sleep_or_shutdown(delay, shutdown).await {
                        return None;
                    }
                }
            }
        }
    }
}

// ============================================================================
// Processing worker
// ============================================================================

pub(crate) struct ProcessingWorker {
    index: usize,
    shared: Arc<Shared>,
    queue: mpsc::Receiver<WorkItem>,
}

impl ProcessingWorker {
    pub(crate) fn new(index: usize, shared: Arc<Shared>, queue: mpsc::Receiver<WorkItem>) -> Self {
        Self { index, shared, queue }
    }

    /// Process items until every sender is gone and the queue is empty.
    pub(crate) async fn run(mut self) {
        debug!(worker = self.index, "processing worker started");
        while let Some(item) = self.queue.recv().await {
            self.handle(item).await;
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
        }
        debug!(worker = self.index, "processing worker stopped");
    }

    async fn handle(&self, item: WorkItem) {
        let WorkItem {
            feed,
            processor,
            record,
        } = item;
        let token = record.token();

        if self
            .shared
            .statuses
            .last_token(&feed)
            .is_some_and(|applied| token <= applied)
        {
            debug!(feed = %feed, token = %token, "skipping already applied event");
            self.shared.statuses.update(&feed, |s| s.duplicates_skipped += 1);
            return;
        }

        match record {
            FeedRecord::Malformed(record) => {
                self.dead_letter(&feed, token, "normalizer", record.reason, 1, record.raw)
                    .await;
            }
            FeedRecord::Event(event) => self.process_with_retry(processor.as_ref(), &event).await,
        }

        self.commit(&feed, token).await;
    }

    async fn process_with_retry(&self, processor: &dyn StreamProcessor, event: &ChangeEvent) {
        let policy = self.shared.config.process_retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.apply(processor, event).await {
                Ok(()) => return,
                Err(err) => err,
            };

            if policy.should_retry(attempt) {
                let delay = policy.delay(attempt);
                warn!(
                    feed = %event.source_feed,
                    token = %event.sequence_token,
                    processor = processor.name(),
                    attempt,
                    error = %err,
                    "event processing failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let record = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
            self.dead_letter(
                &event.source_feed,
                event.sequence_token,
                processor.name(),
                err.to_string(),
                attempt,
                record,
            )
            .await;
            return;
        }
    }

    /// Run the processor and apply its effects. Panics in either step are
    /// caught and reported as [`ProcessorError::Panicked`].
    async fn apply(&self, processor: &dyn StreamProcessor, event: &ChangeEvent) -> Result<(), ProcessorError> {
        let effects = std::panic::catch_unwind(AssertUnwindSafe(|| processor.process(event)))
            .map_err(|panic| ProcessorError::Panicked(panic_message(panic.as_ref())))??;

        AssertUnwindSafe(self.apply_effects(effects))
            .catch_unwind()
            .await
            .map_err(|panic| ProcessorError::Panicked(panic_message(panic.as_ref())))?
    }

    async fn apply_effects(&self, effects: Effects) -> Result<(), ProcessorError> {
        let ctx = CallContext::with_timeout(self.shared.config.effect_timeout);
        let cache = &self.shared.cache;

        for effect in effects.cache {
            match effect {
                CacheEffect::Invalidate { key } => cache.invalidate(&key, &ctx).await?,
                CacheEffect::InvalidateTag { tag } => {
                    cache.invalidate_by_tag(&tag, &ctx).await?;
                }
                CacheEffect::Upsert {
                    key,
                    value,
                    ttl,
                    tags,
                } => {
                    let mut options = SetOptions::new().tags(tags);
                    if let Some(ttl) = ttl {
                        options = options.ttl(ttl);
                    }
                    cache.set(&key, value, options, &ctx).await?;
                }
            }
        }

        // Cache first: a client notified of a change must read the new value.
        for effect in effects.publish {
            let topic = effect.topic.clone();
            let report = self.shared.publisher.publish(effect.into_publication());
            debug!(
                topic,
                matched = report.matched,
                evicted = report.evicted,
                duplicate = report.duplicate,
                "published"
            );
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        feed: &FeedId,
        token: SequenceToken,
        processor: &str,
        reason: String,
        attempts: u32,
        record: serde_json::Value,
    ) {
        let poison = StreamError::PoisonEvent {
            feed: feed.clone(),
            token,
            reason: reason.clone(),
        };
        error!(error = %poison, processor, attempts, "event dead-lettered");

        let letter = DeadLetter {
            feed: feed.clone(),
            token,
            processor: processor.to_string(),
            reason,
            attempts,
            record,
            failed_at: Utc::now(),
        };
        if let Err(e) = self.shared.dead_letters.record(letter).await {
            error!(feed = %feed, token = %token, error = %e, "failed to record dead letter");
        }
        self.shared.monitor.event_dead_lettered(feed, &token);
        self.shared.statuses.update(feed, |s| s.dead_lettered += 1);
    }

    async fn commit(&self, feed: &FeedId, token: SequenceToken) {
        if let Err(e) = self.shared.checkpoints.save(feed, token).await {
            // The event is re-applied after a restart; effects are idempotent.
            warn!(feed = %feed, token = %token, error = %e, "failed to save checkpoint");
        }
        self.shared.statuses.update(feed, |s| {
            s.processed += 1;
            s.last_token = Some(token);
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let caught = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "boom 1");

        let caught = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "static");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        assert!(!sleep_or_shutdown(Duration::from_millis(10), &mut rx).await);

        tx.send(true).unwrap();
        assert!(sleep_or_shutdown(Duration::from_secs(60), &mut rx).await);

        drop(tx);
        let (_, mut closed) = watch::channel(false);
        assert!(sleep_or_shutdown(Duration::from_secs(60), &mut closed).await);
    }
}
