//! Cache entries and write options.

use chrono::{DateTime, SubsecRound, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use strata_core::TierLevel;

/// A cached value as stored in one tier.
///
/// The value is wrapped in `Arc` so tier-1 hits and promotions share the
/// same bytes instead of copying them.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Arc<Vec<u8>>,
    pub tags: BTreeSet<String>,
    /// Wall-clock time of the write that produced this value, at
    /// [`write_clock`] precision. Tiers resolve conflicting writes by keeping
    /// the latest `created_at`.
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub tier: TierLevel,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        value: Vec<u8>,
        ttl: Duration,
        tags: BTreeSet<String>,
        tier: TierLevel,
    ) -> Self {
        let created_at = write_clock();
        Self {
            key: key.into(),
            value: Arc::new(value),
            tags,
            created_at,
            expires_at: expiry_after(created_at, ttl),
            tier,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Time left before expiry, zero if already expired.
    pub fn remaining_ttl(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Copy of this entry for another tier with a fresh TTL counted from now.
    ///
    /// `created_at` is preserved so last-write-wins still compares the
    /// original write times.
    pub fn copy_for(&self, tier: TierLevel, ttl: Duration) -> Self {
        Self {
            key: self.key.clone(),
            value: Arc::clone(&self.value),
            tags: self.tags.clone(),
            created_at: self.created_at,
            expires_at: expiry_after(Utc::now(), ttl),
            tier,
        }
    }

    /// Whether this entry may replace `stored` under last-write-wins.
    pub fn supersedes(&self, stored: &CacheEntry) -> bool {
        self.created_at >= stored.created_at
    }
}

/// Current time truncated to microseconds.
///
/// Write times and invalidation tombstones are compared after a round trip
/// through tiers 2 and 3, which keep microseconds. Both sides use this clock
/// so a value read back compares equal to the time it was written with.
pub fn write_clock() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub(crate) fn expiry_after(from: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| from.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// How [`set`](crate::CacheOrchestrator::set) propagates a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Write tier-1, tier-2 and tier-3 before returning.
    #[default]
    WriteThrough,
    /// Write tier-1 and queue tiers 2 and 3 for a background worker.
    WriteBack,
    /// Write tiers 2 and 3 and drop any tier-1 copy.
    WriteAround,
}

/// Options for a cache write.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Explicit TTL. `None` uses the orchestrator's base TTL.
    pub ttl: Option<Duration>,
    pub tags: BTreeSet<String>,
    pub strategy: WriteStrategy,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn strategy(mut self, strategy: WriteStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Where a value returned by the orchestrator came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    Tier(TierLevel),
    /// Produced by the loader passed to `get_or_load`.
    Loader,
}

/// A value returned by the orchestrator.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub value: Arc<Vec<u8>>,
    pub source: HitSource,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheHit {
    pub(crate) fn from_entry(entry: &CacheEntry, source: HitSource) -> Self {
        Self {
            value: Arc::clone(&entry.value),
            source,
            created_at: entry.created_at,
            expires_at: entry.expires_at,
        }
    }

    /// Tier that served the value, `None` for freshly loaded values.
    pub fn tier(&self) -> Option<TierLevel> {
        match self.source {
            HitSource::Tier(tier) => Some(tier),
            HitSource::Loader => None,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.value
    }
}
