//! In-process tier backed by `DashMap`.
//!
//! Used as tier-1 on every instance, and as a stand-in for tier-2/tier-3
//! when Redis or PostgreSQL are disabled.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use strata_core::TierLevel;

use super::{CacheTier, PutOutcome};
use crate::entry::{CacheEntry, expiry_after};
use crate::error::TierResult;

/// Stored keys ordered by expiry, soonest first.
type ExpiryIndex = BTreeSet<(DateTime<Utc>, String)>;

pub struct MemoryTier {
    level: TierLevel,
    entries: DashMap<String, CacheEntry>,
    tag_index: DashMap<String, HashSet<String>>,
    /// Every insert and removal happens under this lock, so admission and
    /// eviction are atomic with respect to `capacity`. Reads do not take it.
    expiry: Mutex<ExpiryIndex>,
    capacity: usize,
    max_ttl: Option<Duration>,
    evictions: AtomicU64,
}

impl MemoryTier {
    /// Tier-1 with a fixed capacity and a short TTL ceiling.
    pub fn local(capacity: usize, max_ttl: Duration) -> Self {
        Self::new(TierLevel::Local, capacity, Some(max_ttl))
    }

    /// Unbounded in-memory stand-in for a slower tier.
    pub fn standalone(level: TierLevel) -> Self {
        Self::new(level, usize::MAX, None)
    }

    pub fn new(level: TierLevel, capacity: usize, max_ttl: Option<Duration>) -> Self {
        Self {
            level,
            entries: DashMap::new(),
            tag_index: DashMap::new(),
            expiry: Mutex::new(BTreeSet::new()),
            capacity: capacity.max(1),
            max_ttl,
            evictions: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live entries dropped to stay within capacity.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn clamp(&self, mut entry: CacheEntry) -> CacheEntry {
        if let Some(max_ttl) = self.max_ttl {
            let ceiling = expiry_after(Utc::now(), max_ttl);
            if entry.expires_at > ceiling {
                entry.expires_at = ceiling;
            }
        }
        entry.tier = self.level;
        entry
    }

    /// Make room for one more key by dropping the entries closest to expiry.
    /// Expired entries sort first, so they go before live ones.
    fn make_room(&self, expiry: &mut ExpiryIndex) {
        let now = Utc::now();
        while self.entries.len() >= self.capacity {
            let Some((expires_at, key)) = expiry.pop_first() else {
                break;
            };
            if let Some((_, removed)) = self.entries.remove(&key) {
                self.unindex_tags(&key, &removed.tags);
                if expires_at > now {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn index_tags(&self, key: &str, tags: &BTreeSet<String>) {
        for tag in tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn unindex_tags<'a>(&self, key: &str, tags: impl IntoIterator<Item = &'a String>) {
        for tag in tags {
            let emptied = match self.tag_index.get_mut(tag) {
                Some(mut keys) => {
                    keys.remove(key);
                    keys.is_empty()
                }
                None => false,
            };
            if emptied {
                self.tag_index.remove_if(tag, |_, keys| keys.is_empty());
            }
        }
    }

    /// Caller holds the `expiry` lock.
    fn remove_locked(&self, expiry: &mut ExpiryIndex, key: &str) -> Option<CacheEntry> {
        let (_, removed) = self.entries.remove(key)?;
        expiry.remove(&(removed.expires_at, key.to_string()));
        self.unindex_tags(key, &removed.tags);
        Some(removed)
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn level(&self) -> TierLevel {
        self.level
    }

    fn backend(&self) -> &'static str {
        "dashmap"
    }

    async fn get(&self, key: &str) -> TierResult<Option<CacheEntry>> {
        let now = Utc::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired_at(now) => return Ok(Some(entry.clone())),
            Some(_) => {}
            None => return Ok(None),
        }

        let mut expiry = self.expiry.lock();
        if self.entries.get(key).is_some_and(|e| e.is_expired_at(now)) {
            self.remove_locked(&mut expiry, key);
        }
        Ok(None)
    }

    async fn put(&self, entry: CacheEntry) -> TierResult<PutOutcome> {
        let entry = self.clamp(entry);
        let key = entry.key.clone();
        let tags = entry.tags.clone();

        let mut expiry = self.expiry.lock();
        let current = self.entries.get(&key).map(|e| e.clone());
        match &current {
            Some(stored) if !entry.supersedes(stored) => return Ok(PutOutcome::Superseded),
            Some(stored) => {
                expiry.remove(&(stored.expires_at, key.clone()));
            }
            None => self.make_room(&mut expiry),
        }

        expiry.insert((entry.expires_at, key.clone()));
        self.entries.insert(key.clone(), entry);
        if let Some(stored) = current {
            self.unindex_tags(&key, stored.tags.difference(&tags));
        }
        self.index_tags(&key, &tags);
        Ok(PutOutcome::Stored)
    }

    async fn remove(&self, key: &str) -> TierResult<bool> {
        let mut expiry = self.expiry.lock();
        Ok(self.remove_locked(&mut expiry, key).is_some())
    }

    async fn remove_by_tag(&self, tag: &str) -> TierResult<Vec<String>> {
        let mut expiry = self.expiry.lock();
        let keys = match self.tag_index.remove(tag) {
            Some((_, keys)) => keys,
            None => return Ok(Vec::new()),
        };

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if self.remove_locked(&mut expiry, &key).is_some() {
                removed.push(key);
            }
        }
        removed.sort();
        Ok(removed)
    }

    fn entry_count(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}
