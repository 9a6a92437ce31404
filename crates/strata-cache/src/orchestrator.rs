//! Cache orchestrator: one entry point over three tiers.
//!
//! ## Lookup order
//!
//! 1. tier-1 (in-process) - microsecond latency
//! 2. tier-2 (Redis) - millisecond latency
//! 3. tier-3 (PostgreSQL) - durable
//!
//! A hit below tier-1 is copied into every faster tier before returning.
//! Unreachable tiers are skipped on read and reported on write or
//! invalidation.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use strata_core::{ExponentialBackoff, MonitoringHook, NoopHook, TierLevel};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adaptive_ttl::{AdaptiveTtl, AdaptiveTtlConfig};
use crate::consistency::{KeyLocks, Tombstones};
use crate::context::CallContext;
use crate::entry::{CacheEntry, CacheHit, HitSource, SetOptions, WriteStrategy, write_clock};
use crate::error::{CacheError, CacheResult, LoadError, TierResult};
use crate::pubsub::{InvalidationBus, InvalidationTarget};
use crate::tier::{MemoryTier, PutOutcome, SharedTier};
use crate::write_back::{self, WriteBackJob, WriteBackQueue};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// TTL used when a write does not specify one.
    pub base_ttl: Duration,
    /// Ceiling for tier-1 copies.
    pub local_max_ttl: Duration,
    pub adaptive: AdaptiveTtlConfig,
    /// Local retries for transient tier failures.
    pub tier_retry: ExponentialBackoff,
    /// Retries of a write-back delivery before it is reported as failed.
    pub write_back_retry: ExponentialBackoff,
    pub write_back_capacity: usize,
    pub lock_stripes: usize,
    /// How long invalidation tombstones are remembered.
    pub tombstone_retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_ttl: Duration::from_secs(300),
            local_max_ttl: Duration::from_secs(30),
            adaptive: AdaptiveTtlConfig::default(),
            tier_retry: ExponentialBackoff::new(Duration::from_millis(20), Duration::from_millis(200), 3),
            write_back_retry: ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(5), 5),
            write_back_capacity: 1024,
            lock_stripes: 64,
            tombstone_retention: Duration::from_secs(300),
        }
    }
}

/// Hit/miss counters and sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: TierCounts,
    pub misses: TierCounts,
    pub promotions: u64,
    pub loads: u64,
    pub local_entries: usize,
    pub write_back_pending: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub local: u64,
    pub distributed: u64,
    pub durable: u64,
}

impl TierCounts {
    pub fn get(&self, tier: TierLevel) -> u64 {
        match tier {
            TierLevel::Local => self.local,
            TierLevel::Distributed => self.distributed,
            TierLevel::Durable => self.durable,
        }
    }
}

/// Reachability of each tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierHealth {
    pub tier: TierLevel,
    pub backend: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
struct Counters {
    hits: [AtomicU64; 3],
    misses: [AtomicU64; 3],
    promotions: AtomicU64,
    loads: AtomicU64,
}

impl Counters {
    fn snapshot(array: &[AtomicU64; 3]) -> TierCounts {
        TierCounts {
            local: array[0].load(Ordering::Relaxed),
            distributed: array[1].load(Ordering::Relaxed),
            durable: array[2].load(Ordering::Relaxed),
        }
    }
}

pub struct CacheOrchestratorBuilder {
    config: OrchestratorConfig,
    local: Option<SharedTier>,
    distributed: Option<SharedTier>,
    durable: Option<SharedTier>,
    monitor: Arc<dyn MonitoringHook>,
    bus: Option<Arc<dyn InvalidationBus>>,
    shutdown: CancellationToken,
}

impl CacheOrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn local(mut self, tier: SharedTier) -> Self {
        self.local = Some(tier);
        self
    }

    pub fn distributed(mut self, tier: SharedTier) -> Self {
        self.distributed = Some(tier);
        self
    }

    pub fn durable(mut self, tier: SharedTier) -> Self {
        self.durable = Some(tier);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn MonitoringHook>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn invalidation_bus(mut self, bus: Arc<dyn InvalidationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Token that stops the write-back worker (after draining).
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Build the orchestrator and spawn its write-back worker.
    ///
    /// Missing tiers are replaced by in-memory ones.
    pub fn build(self) -> Arc<CacheOrchestrator> {
        let config = self.config;
        let local = self.local.unwrap_or_else(|| {
            Arc::new(MemoryTier::local(10_000, config.local_max_ttl)) as SharedTier
        });
        let distributed = self
            .distributed
            .unwrap_or_else(|| Arc::new(MemoryTier::standalone(TierLevel::Distributed)) as SharedTier);
        let durable = self
            .durable
            .unwrap_or_else(|| Arc::new(MemoryTier::standalone(TierLevel::Durable)) as SharedTier);

        let tombstones = Arc::new(Tombstones::new(config.tombstone_retention));
        let (queue, worker) = write_back::channel(
            config.write_back_capacity,
            vec![Arc::clone(&distributed), Arc::clone(&durable)],
            config.write_back_retry,
            Arc::clone(&tombstones),
            Arc::clone(&self.monitor),
        );
        let worker_handle = tokio::spawn(worker.run(self.shutdown.clone()));

        Arc::new(CacheOrchestrator {
            tiers: [local, distributed, durable],
            ttl: AdaptiveTtl::new(config.adaptive.clone()),
            locks: KeyLocks::new(config.lock_stripes),
            tombstones,
            in_flight: DashMap::new(),
            write_back: queue,
            worker: Mutex::new(Some(worker_handle)),
            shutdown: self.shutdown,
            monitor: self.monitor,
            bus: self.bus,
            counters: Counters::default(),
            config,
        })
    }
}

pub struct CacheOrchestrator {
    /// Fastest first.
    tiers: [SharedTier; 3],
    config: OrchestratorConfig,
    ttl: AdaptiveTtl,
    locks: KeyLocks,
    tombstones: Arc<Tombstones>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    write_back: WriteBackQueue,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: CancellationToken,
    monitor: Arc<dyn MonitoringHook>,
    bus: Option<Arc<dyn InvalidationBus>>,
    counters: Counters,
}

/// Releases the single-flight slot for a key once its holder is done,
/// including when the holder's future is dropped at a deadline. Only the
/// slot this guard was created for is removed.
struct FlightGuard<'a> {
    in_flight: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    slot: Arc<Mutex<()>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .remove_if(self.key, |_, current| Arc::ptr_eq(current, &self.slot));
    }
}

impl CacheOrchestrator {
    pub fn builder() -> CacheOrchestratorBuilder {
        CacheOrchestratorBuilder {
            config: OrchestratorConfig::default(),
            local: None,
            distributed: None,
            durable: None,
            monitor: NoopHook::shared(),
            bus: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn tier(&self, level: TierLevel) -> &SharedTier {
        &self.tiers[slot(level)]
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Look `key` up in tier order, promoting hits below tier-1.
    pub async fn get(&self, key: &str, ctx: &CallContext) -> CacheResult<Option<CacheHit>> {
        ctx.enforce(self.lookup(key, true))
            .await
            .map_err(|_| CacheError::timeout("get"))
    }

    /// Return the cached value or run `loader` once and cache its result in
    /// all tiers.
    ///
    /// Concurrent calls for the same key share one loader invocation. Loader
    /// errors are returned unchanged and are not cached.
    pub async fn get_or_load<F, Fut, E>(
        &self,
        key: &str,
        options: SetOptions,
        ctx: &CallContext,
        loader: F,
    ) -> Result<CacheHit, LoadError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
    {
        ctx.enforce(self.load_through(key, options, loader))
            .await
            .map_err(|_| LoadError::Cache(CacheError::timeout("get_or_load")))?
    }

    async fn load_through<F, Fut, E>(
        &self,
        key: &str,
        options: SetOptions,
        loader: F,
    ) -> Result<CacheHit, LoadError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
    {
        if let Some(hit) = self.lookup(key, true).await {
            return Ok(hit);
        }

        let flight = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _leader = flight.lock().await;
        let _cleanup = FlightGuard {
            in_flight: &self.in_flight,
            key,
            slot: Arc::clone(&flight),
        };

        // Another caller may have loaded while we waited.
        if let Some(hit) = self.lookup(key, false).await {
            return Ok(hit);
        }

        let value = loader().await.map_err(LoadError::Loader)?;
        self.counters.loads.fetch_add(1, Ordering::Relaxed);

        let options = options.strategy(WriteStrategy::WriteThrough);
        let entry = self.write(key, value, options).await?;
        Ok(CacheHit::from_entry(&entry, HitSource::Loader))
    }

    async fn lookup(&self, key: &str, record_access: bool) -> Option<CacheHit> {
        if record_access {
            self.ttl.record_access(key);
        }

        for level in TierLevel::ALL {
            let Some(entry) = self.read_tier(level, key).await else {
                self.record_miss(level);
                continue;
            };

            self.record_hit(level);
            debug!(key = %key, tier = %level, "cache hit");
            if level != TierLevel::Local {
                self.promote(&entry, level).await;
            }
            return Some(CacheHit::from_entry(&entry, HitSource::Tier(level)));
        }

        debug!(key = %key, "cache miss");
        None
    }

    /// Read one tier, treating unavailability and invalidated entries as
    /// misses.
    async fn read_tier(&self, level: TierLevel, key: &str) -> Option<CacheEntry> {
        let tier = self.tier(level);
        match self.with_retry(level, || tier.get(key)).await {
            Ok(Some(entry)) if self.tombstones.is_buried(&entry) => None,
            Ok(found) => found,
            Err(e) => {
                warn!(key = %key, tier = %level, error = %e, "tier unavailable on read, skipping");
                self.monitor.tier_unavailable(level);
                None
            }
        }
    }

    /// Copy `entry` into every tier faster than `found_in`.
    async fn promote(&self, entry: &CacheEntry, found_in: TierLevel) {
        let _guard = self.locks.lock(&entry.key).await;
        if self.tombstones.is_buried(entry) {
            return;
        }

        let ttl = self.ttl.ttl_for(&entry.key, self.config.base_ttl);
        for level in found_in.faster_tiers() {
            let copy = entry.copy_for(level, self.ttl_in(level, ttl));
            match self.tier(level).put(copy).await {
                Ok(PutOutcome::Stored) => {
                    self.counters.promotions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %entry.key, from = %found_in, to = %level, "promoted entry");
                }
                Ok(PutOutcome::Superseded) => {}
                Err(e) => {
                    warn!(key = %entry.key, tier = %level, error = %e, "promotion failed");
                    self.monitor.tier_unavailable(level);
                }
            }
        }

        // Tag tombstones are laid without the key lock; one that landed
        // during the copies above must still win.
        if self.tombstones.is_buried(entry) {
            for level in found_in.faster_tiers() {
                if let Err(e) = self.tier(level).remove(&entry.key).await {
                    warn!(key = %entry.key, tier = %level, error = %e, "dropping buried promotion failed");
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    pub async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        options: SetOptions,
        ctx: &CallContext,
    ) -> CacheResult<()> {
        ctx.enforce(self.write(key, value, options))
            .await
            .map_err(|_| CacheError::timeout("set"))?
            .map(|_| ())
    }

    async fn write(&self, key: &str, value: Vec<u8>, options: SetOptions) -> CacheResult<CacheEntry> {
        let base = options.ttl.unwrap_or(self.config.base_ttl);
        let ttl = self.ttl.ttl_for(key, base);
        let entry = CacheEntry::new(key, value, ttl, options.tags, TierLevel::Local);

        match options.strategy {
            WriteStrategy::WriteThrough => {
                for level in TierLevel::ALL {
                    self.put_tier(level, &entry, ttl).await?;
                }
            }
            WriteStrategy::WriteBack => {
                self.put_tier(TierLevel::Local, &entry, ttl).await?;
                self.write_back
                    .enqueue(WriteBackJob {
                        entry: entry.clone(),
                        ttl,
                        targets: vec![TierLevel::Distributed, TierLevel::Durable],
                    })
                    .await?;
            }
            WriteStrategy::WriteAround => {
                self.put_tier(TierLevel::Distributed, &entry, ttl).await?;
                self.put_tier(TierLevel::Durable, &entry, ttl).await?;

                let _guard = self.locks.lock(key).await;
                self.tombstones.bury_key(key, entry.created_at);
                self.with_retry(TierLevel::Local, || self.tier(TierLevel::Local).remove(key))
                    .await?;
            }
        }

        debug!(key = %key, strategy = ?options.strategy, ttl_secs = ttl.as_secs(), "cache set");
        Ok(entry)
    }

    async fn put_tier(&self, level: TierLevel, entry: &CacheEntry, ttl: Duration) -> CacheResult<()> {
        let tier = self.tier(level);
        let ttl = self.ttl_in(level, ttl);
        let result = self
            .with_retry(level, || tier.put(entry.copy_for(level, ttl)))
            .await;
        if let Err(e) = &result {
            warn!(key = %entry.key, tier = %level, error = %e, "tier write failed");
            self.monitor.tier_unavailable(level);
        }
        result.map(|_| ()).map_err(CacheError::from)
    }

    fn ttl_in(&self, level: TierLevel, ttl: Duration) -> Duration {
        match level {
            TierLevel::Local => ttl.min(self.config.local_max_ttl),
            _ => ttl,
        }
    }

    // ---------------------------------------------------------------------
    // Invalidation
    // ---------------------------------------------------------------------

    /// Remove `key` from all tiers.
    ///
    /// Fails with [`CacheError::PartialInvalidation`] naming every tier that
    /// could not be reached.
    pub async fn invalidate(&self, key: &str, ctx: &CallContext) -> CacheResult<()> {
        ctx.enforce(self.invalidate_key(key))
            .await
            .map_err(|_| CacheError::timeout("invalidate"))?
    }

    async fn invalidate_key(&self, key: &str) -> CacheResult<()> {
        let _guard = self.locks.lock(key).await;
        let at = write_clock();
        self.tombstones.bury_key(key, at);

        let mut failed = Vec::new();
        for level in TierLevel::ALL.into_iter().rev() {
            let tier = self.tier(level);
            if let Err(e) = self.with_retry(level, || tier.remove(key)).await {
                warn!(key = %key, tier = %level, error = %e, "invalidation failed for tier");
                self.monitor.tier_unavailable(level);
                failed.push(level);
            }
        }
        self.ttl.forget(key);

        if !failed.is_empty() {
            failed.sort();
            return Err(CacheError::PartialInvalidation {
                target: key.to_string(),
                failed,
            });
        }

        debug!(key = %key, "invalidated key in all tiers");
        self.broadcast(InvalidationTarget::Key(key.to_string()), at).await;
        Ok(())
    }

    /// Remove every entry tagged `tag` from all tiers. Returns the number of
    /// distinct keys removed.
    pub async fn invalidate_by_tag(&self, tag: &str, ctx: &CallContext) -> CacheResult<usize> {
        ctx.enforce(self.invalidate_tag(tag))
            .await
            .map_err(|_| CacheError::timeout("invalidate_by_tag"))?
    }

    async fn invalidate_tag(&self, tag: &str) -> CacheResult<usize> {
        let at = write_clock();
        self.tombstones.bury_tag(tag, at);

        let mut failed = Vec::new();
        let mut removed = std::collections::BTreeSet::new();
        for level in TierLevel::ALL.into_iter().rev() {
            let tier = self.tier(level);
            match self.with_retry(level, || tier.remove_by_tag(tag)).await {
                Ok(keys) => removed.extend(keys),
                Err(e) => {
                    warn!(tag = %tag, tier = %level, error = %e, "tag invalidation failed for tier");
                    self.monitor.tier_unavailable(level);
                    failed.push(level);
                }
            }
        }

        // A promotion that read a tagged entry before the tombstone existed
        // may have re-inserted it; sweep the faster tiers under the key lock.
        for key in &removed {
            let _guard = self.locks.lock(key).await;
            for level in TierLevel::Durable.faster_tiers() {
                if failed.contains(&level) {
                    continue;
                }
                if let Err(e) = self.tier(level).remove(key).await {
                    warn!(key = %key, tier = %level, error = %e, "tag sweep failed for tier");
                    failed.push(level);
                }
            }
        }

        if !failed.is_empty() {
            failed.sort();
            failed.dedup();
            return Err(CacheError::PartialInvalidation {
                target: format!("tag:{tag}"),
                failed,
            });
        }

        debug!(tag = %tag, keys = removed.len(), "invalidated tag in all tiers");
        self.broadcast(InvalidationTarget::Tag(tag.to_string()), at).await;
        Ok(removed.len())
    }

    async fn broadcast(&self, target: InvalidationTarget, at: DateTime<Utc>) {
        if let Some(bus) = &self.bus
            && let Err(e) = bus.publish(target, at).await
        {
            warn!(error = %e, "failed to broadcast invalidation to peers");
        }
    }

    /// Apply an invalidation performed by a peer instance at `at`.
    ///
    /// Tiers 2 and 3 are shared and were cleared by the peer, so only tier-1
    /// copies are dropped. The tombstone keeps promotions of older copies
    /// from bringing them back. Returns the number of tier-1 entries removed.
    pub async fn apply_peer_invalidation(&self, target: &InvalidationTarget, at: DateTime<Utc>) -> TierResult<usize> {
        let local = self.tier(TierLevel::Local);
        match target {
            InvalidationTarget::Key(key) => {
                let _guard = self.locks.lock(key).await;
                self.tombstones.bury_key(key, at);
                self.ttl.forget(key);
                Ok(usize::from(local.remove(key).await?))
            }
            InvalidationTarget::Tag(tag) => {
                self.tombstones.bury_tag(tag, at);
                Ok(local.remove_by_tag(tag).await?.len())
            }
        }
    }

    // ---------------------------------------------------------------------
    // Typed helpers
    // ---------------------------------------------------------------------

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str, ctx: &CallContext) -> CacheResult<Option<T>> {
        match self.get(key, ctx).await? {
            Some(hit) => Ok(Some(serde_json::from_slice(hit.bytes())?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
        ctx: &CallContext,
    ) -> CacheResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes, options, ctx).await
    }

    // ---------------------------------------------------------------------
    // Introspection and lifecycle
    // ---------------------------------------------------------------------

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: Counters::snapshot(&self.counters.hits),
            misses: Counters::snapshot(&self.counters.misses),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            local_entries: self.tier(TierLevel::Local).entry_count().unwrap_or(0),
            write_back_pending: self.write_back.pending(),
        }
    }

    pub async fn health(&self) -> Vec<TierHealth> {
        let mut report = Vec::with_capacity(3);
        for tier in &self.tiers {
            let result = tier.ping().await;
            report.push(TierHealth {
                tier: tier.level(),
                backend: tier.backend(),
                healthy: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            });
        }
        report
    }

    /// Stop accepting write-back jobs and wait for queued ones to be
    /// delivered.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.worker.lock().await.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "write-back worker terminated abnormally");
        }
    }

    /// Wait until the write-back queue is empty or `timeout` elapses.
    /// Returns whether the queue drained.
    pub async fn flush_write_back(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.write_back.pending() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    async fn with_retry<T, F, Fut>(&self, level: TierLevel, mut op: F) -> TierResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TierResult<T>>,
    {
        let policy = self.config.tier_retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                    debug!(tier = %level, attempt, error = %e, "retrying tier operation");
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record_hit(&self, level: TierLevel) {
        self.counters.hits[slot(level)].fetch_add(1, Ordering::Relaxed);
        self.monitor.cache_hit(level);
    }

    fn record_miss(&self, level: TierLevel) {
        self.counters.misses[slot(level)].fetch_add(1, Ordering::Relaxed);
        self.monitor.cache_miss(level);
    }
}

fn slot(level: TierLevel) -> usize {
    usize::from(level.index() - 1)
}
