//! Tier-2: shared Redis cache.
//!
//! ## Key layout
//!
//! ```text
//! {prefix}:entry:{key}   HASH  e = msgpack(WireEntry), c = created_at (µs)
//! {prefix}:tag:{tag}     SET   logical keys carrying the tag
//! ```
//!
//! Writes go through a Lua script that compares `c` before overwriting, so
//! concurrent writers from different instances resolve by last-write-wins
//! without a read-modify-write round trip.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};
use strata_core::TierLevel;

use super::{CacheTier, PutOutcome};
use crate::entry::CacheEntry;
use crate::error::{TierError, TierResult};

/// KEYS[1] = entry hash, KEYS[2..] = tag sets.
/// ARGV = encoded entry, created_at µs, ttl ms, logical key.
static PUT_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r#"
local current = redis.call('HGET', KEYS[1], 'c')
if current and tonumber(current) > tonumber(ARGV[2]) then
  return 0
end
redis.call('HSET', KEYS[1], 'e', ARGV[1], 'c', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
for i = 2, #KEYS do
  redis.call('SADD', KEYS[i], ARGV[4])
  if redis.call('PTTL', KEYS[i]) < tonumber(ARGV[3]) then
    redis.call('PEXPIRE', KEYS[i], ARGV[3])
  end
end
return 1
"#,
    )
});

/// Serialized form of an entry inside the `e` hash field.
#[derive(Debug, Serialize, Deserialize)]
struct WireEntry {
    value: Vec<u8>,
    tags: Vec<String>,
    created_at_us: i64,
    expires_at_ms: i64,
}

pub struct RedisTier {
    pool: Pool,
    prefix: String,
}

impl RedisTier {
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}:entry:{}", self.prefix, key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}:tag:{}", self.prefix, tag)
    }

    async fn conn(&self) -> TierResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(unavailable)
    }

    fn decode(key: &str, raw: &[u8]) -> TierResult<CacheEntry> {
        let wire: WireEntry = rmp_serde::from_slice(raw)
            .map_err(|e| TierError::codec(TierLevel::Distributed, e))?;
        Ok(CacheEntry {
            key: key.to_string(),
            value: Arc::new(wire.value),
            tags: wire.tags.into_iter().collect::<BTreeSet<_>>(),
            created_at: from_micros(wire.created_at_us)?,
            expires_at: from_millis(wire.expires_at_ms)?,
            tier: TierLevel::Distributed,
        })
    }
}

fn unavailable(e: impl std::fmt::Display) -> TierError {
    TierError::unavailable(TierLevel::Distributed, e)
}

/// Write times keep microseconds so they compare equal to invalidation
/// tombstones taken from the same clock.
fn from_micros(us: i64) -> TierResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us)
        .ok_or_else(|| TierError::codec(TierLevel::Distributed, format!("invalid timestamp {us}")))
}

fn from_millis(ms: i64) -> TierResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| TierError::codec(TierLevel::Distributed, format!("invalid timestamp {ms}")))
}

#[async_trait]
impl CacheTier for RedisTier {
    fn level(&self) -> TierLevel {
        TierLevel::Distributed
    }

    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> TierResult<Option<CacheEntry>> {
        let mut conn = self.conn().await?;
        let raw: Option<Vec<u8>> = conn
            .hget(self.entry_key(key), "e")
            .await
            .map_err(unavailable)?;

        match raw {
            Some(raw) => {
                let entry = Self::decode(key, &raw)?;
                if entry.is_expired() {
                    return Ok(None);
                }
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, entry: CacheEntry) -> TierResult<PutOutcome> {
        let ttl_ms = entry.remaining_ttl().as_millis().clamp(1, i64::MAX as u128) as i64;
        let created_us = entry.created_at.timestamp_micros();
        let wire = WireEntry {
            value: entry.value.as_ref().clone(),
            tags: entry.tags.iter().cloned().collect(),
            created_at_us: created_us,
            expires_at_ms: entry.expires_at.timestamp_millis(),
        };
        let encoded = rmp_serde::to_vec_named(&wire)
            .map_err(|e| TierError::codec(TierLevel::Distributed, e))?;

        let mut invocation = PUT_SCRIPT.prepare_invoke();
        invocation.key(self.entry_key(&entry.key));
        for tag in &entry.tags {
            invocation.key(self.tag_key(tag));
        }
        invocation
            .arg(encoded)
            .arg(created_us)
            .arg(ttl_ms)
            .arg(&entry.key);

        let mut conn = self.conn().await?;
        let applied: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        tracing::debug!(key = %entry.key, applied, "redis tier put");
        Ok(if applied == 1 {
            PutOutcome::Stored
        } else {
            PutOutcome::Superseded
        })
    }

    async fn remove(&self, key: &str) -> TierResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(self.entry_key(key)).await.map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn remove_by_tag(&self, tag: &str) -> TierResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let tag_key = self.tag_key(tag);
        let mut members: Vec<String> = conn.smembers(&tag_key).await.map_err(unavailable)?;
        members.sort();

        let mut pipe = redis::pipe();
        pipe.atomic();
        if !members.is_empty() {
            let entry_keys: Vec<String> = members.iter().map(|k| self.entry_key(k)).collect();
            pipe.del(entry_keys).ignore();
        }
        pipe.del(&tag_key).ignore();
        let _: () = pipe.query_async(&mut conn).await.map_err(unavailable)?;

        Ok(members)
    }

    async fn ping(&self) -> TierResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
