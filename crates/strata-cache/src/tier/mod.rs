//! Storage tiers.
//!
//! Each tier is a [`CacheTier`]: an async key/value store with tags and
//! last-write-wins semantics. The orchestrator only talks to tiers through
//! this trait, so tier-2 and tier-3 can be swapped for [`MemoryTier`] when
//! Redis or PostgreSQL are not configured.
//!
//! | Tier | Implementation | Conflict control |
//! |------|----------------|------------------|
//! | 1 (local) | [`MemoryTier`] (sharded `DashMap`) | entry lock |
//! | 2 (distributed) | [`RedisTier`] | Lua compare-and-set |
//! | 3 (durable) | [`PostgresTier`] | `ON CONFLICT ... WHERE` |

mod memory;
mod postgres;
mod redis;

pub use memory::MemoryTier;
pub use postgres::PostgresTier;
pub use redis::RedisTier;

use async_trait::async_trait;
use std::sync::Arc;
use strata_core::TierLevel;

use crate::entry::CacheEntry;
use crate::error::TierResult;

/// Result of a tier write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// The tier already holds a value with a later `created_at`.
    Superseded,
}

#[async_trait]
pub trait CacheTier: Send + Sync {
    fn level(&self) -> TierLevel;

    /// Short backend name for logs (`"dashmap"`, `"redis"`, ...).
    fn backend(&self) -> &'static str;

    /// Fetch a live entry. Expired entries are reported as absent.
    async fn get(&self, key: &str) -> TierResult<Option<CacheEntry>>;

    /// Store an entry unless the tier holds a newer write for the same key.
    async fn put(&self, entry: CacheEntry) -> TierResult<PutOutcome>;

    /// Remove a key. Returns whether something was removed.
    async fn remove(&self, key: &str) -> TierResult<bool>;

    /// Remove every entry carrying `tag`, returning the removed keys.
    async fn remove_by_tag(&self, tag: &str) -> TierResult<Vec<String>>;

    /// Cheap reachability check.
    async fn ping(&self) -> TierResult<()> {
        Ok(())
    }

    /// Number of stored entries, when the tier can count cheaply.
    fn entry_count(&self) -> Option<usize> {
        None
    }
}

pub type SharedTier = Arc<dyn CacheTier>;
