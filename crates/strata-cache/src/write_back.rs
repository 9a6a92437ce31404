//! Background delivery of write-back jobs to tiers 2 and 3.
//!
//! `set` with [`WriteStrategy::WriteBack`](crate::WriteStrategy) writes
//! tier-1 and enqueues a [`WriteBackJob`] on a bounded channel. One worker
//! drains the channel in order, retrying each tier with exponential backoff.
//! A job that exhausts its retries is reported to the monitoring hook and
//! dropped. Jobs whose entry was invalidated in the meantime are skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use strata_core::{ExponentialBackoff, MonitoringHook, TierLevel};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::consistency::Tombstones;
use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};
use crate::tier::{PutOutcome, SharedTier};

/// One pending delivery.
#[derive(Debug, Clone)]
pub struct WriteBackJob {
    pub entry: CacheEntry,
    /// TTL for tier-2 and tier-3 copies.
    pub ttl: Duration,
    pub targets: Vec<TierLevel>,
}

/// Producer side, owned by the orchestrator.
#[derive(Clone)]
pub struct WriteBackQueue {
    tx: mpsc::Sender<WriteBackJob>,
    pending: Arc<AtomicUsize>,
}

impl WriteBackQueue {
    /// Enqueue a job, waiting while the queue is full.
    pub async fn enqueue(&self, job: WriteBackJob) -> CacheResult<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(job).await.is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(CacheError::WriteBackClosed);
        }
        Ok(())
    }

    /// Jobs enqueued but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

pub struct WriteBackWorker {
    rx: mpsc::Receiver<WriteBackJob>,
    pending: Arc<AtomicUsize>,
    tiers: Vec<SharedTier>,
    retry: ExponentialBackoff,
    tombstones: Arc<Tombstones>,
    monitor: Arc<dyn MonitoringHook>,
}

/// Create a queue and the worker that drains it.
pub fn channel(
    capacity: usize,
    tiers: Vec<SharedTier>,
    retry: ExponentialBackoff,
    tombstones: Arc<Tombstones>,
    monitor: Arc<dyn MonitoringHook>,
) -> (WriteBackQueue, WriteBackWorker) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));
    let queue = WriteBackQueue {
        tx,
        pending: Arc::clone(&pending),
    };
    let worker = WriteBackWorker {
        rx,
        pending,
        tiers,
        retry,
        tombstones,
        monitor,
    };
    (queue, worker)
}

impl WriteBackWorker {
    /// Process jobs until `shutdown` fires, then deliver whatever is still
    /// queued before returning.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("write-back worker started");
        loop {
            tokio::select! {
                job = self.rx.recv() => match job {
                    Some(job) => self.process(job).await,
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    self.rx.close();
                    let mut drained = 0usize;
                    while let Some(job) = self.rx.recv().await {
                        self.process(job).await;
                        drained += 1;
                    }
                    info!(drained, "write-back worker drained queue on shutdown");
                    break;
                }
            }
        }
        info!("write-back worker stopped");
    }

    async fn process(&self, job: WriteBackJob) {
        for level in &job.targets {
            let Some(tier) = self.tiers.iter().find(|t| t.level() == *level) else {
                continue;
            };
            self.deliver(tier, &job).await;
        }
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    async fn deliver(&self, tier: &SharedTier, job: &WriteBackJob) {
        let level = tier.level();
        let mut attempt = 0u32;
        loop {
            if self.tombstones.is_buried(&job.entry) {
                debug!(key = %job.entry.key, tier = %level, "write-back skipped, entry invalidated");
                return;
            }

            attempt += 1;
            let copy = job.entry.copy_for(level, job.ttl);
            match tier.put(copy).await {
                Ok(PutOutcome::Stored) => {
                    debug!(key = %job.entry.key, tier = %level, attempt, "write-back delivered");
                    return;
                }
                Ok(PutOutcome::Superseded) => {
                    debug!(key = %job.entry.key, tier = %level, "write-back superseded by newer write");
                    return;
                }
                Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        key = %job.entry.key,
                        tier = %level,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "write-back failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        key = %job.entry.key,
                        tier = %level,
                        attempts = attempt,
                        error = %e,
                        "write-back delivery failed"
                    );
                    self.monitor.write_back_failed(&job.entry.key, level, &e.to_string());
                    return;
                }
            }
        }
    }
}
