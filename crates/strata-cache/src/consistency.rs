//! Ordering helpers shared by promotion, invalidation and write-back.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::hash::{BuildHasher, RandomState};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

use crate::entry::CacheEntry;

/// Striped async locks keyed by cache key.
///
/// Promotion and invalidation of the same key take the same stripe, so an
/// invalidation can never be overtaken by a promotion that read the old value.
pub struct KeyLocks {
    stripes: Vec<Mutex<()>>,
    hasher: RandomState,
}

impl KeyLocks {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    pub async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let idx = (self.hasher.hash_one(key) as usize) % self.stripes.len();
        self.stripes[idx].lock().await
    }
}

/// Recent invalidations.
///
/// An entry created before the tombstone of its key (or of any of its tags)
/// is dead: promotions and write-back jobs carrying it are dropped.
pub struct Tombstones {
    keys: DashMap<String, DateTime<Utc>>,
    tags: DashMap<String, DateTime<Utc>>,
    retention: ChronoDuration,
}

/// Tombstone tables are swept once they grow past this size.
const SWEEP_THRESHOLD: usize = 4096;

impl Tombstones {
    pub fn new(retention: Duration) -> Self {
        Self {
            keys: DashMap::new(),
            tags: DashMap::new(),
            retention: ChronoDuration::from_std(retention).unwrap_or(ChronoDuration::MAX),
        }
    }

    /// Kill every version of `key` created before `at`.
    pub fn bury_key(&self, key: &str, at: DateTime<Utc>) {
        bury(&self.keys, key, at);
        self.sweep_if_large();
    }

    /// Kill every entry tagged `tag` created before `at`.
    pub fn bury_tag(&self, tag: &str, at: DateTime<Utc>) {
        bury(&self.tags, tag, at);
        self.sweep_if_large();
    }

    pub fn is_buried(&self, entry: &CacheEntry) -> bool {
        let dead = |stone: Option<DateTime<Utc>>| stone.is_some_and(|at| entry.created_at < at);

        if dead(self.keys.get(&entry.key).map(|t| *t)) {
            return true;
        }
        entry
            .tags
            .iter()
            .any(|tag| dead(self.tags.get(tag).map(|t| *t)))
    }

    pub fn len(&self) -> usize {
        self.keys.len() + self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget tombstones older than the retention window.
    pub fn sweep(&self) {
        let Some(cutoff) = Utc::now().checked_sub_signed(self.retention) else {
            return;
        };
        self.keys.retain(|_, at| *at > cutoff);
        self.tags.retain(|_, at| *at > cutoff);
    }

    fn sweep_if_large(&self) {
        if self.len() > SWEEP_THRESHOLD {
            self.sweep();
        }
    }
}

fn bury(map: &DashMap<String, DateTime<Utc>>, name: &str, at: DateTime<Utc>) {
    map.entry(name.to_string())
        .and_modify(|existing| {
            if at > *existing {
                *existing = at;
            }
        })
        .or_insert(at);
}
