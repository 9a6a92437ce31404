//! Cross-instance tier-1 invalidation over Redis Pub/Sub.
//!
//! ```text
//! Instance 1: orchestrator.invalidate("deal:7")
//!   ↓
//! PUBLISH strata:invalidate {"origin":"<uuid>","at":"...","target":{"key":"deal:7"}}
//!   ↓
//! Instance 2: listener buries "deal:7" at `at` and drops its tier-1 copy
//! Instance 3: listener buries "deal:7" at `at` and drops its tier-1 copy
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use strata_core::{ExponentialBackoff, TierLevel};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{TierError, TierResult};
use crate::orchestrator::CacheOrchestrator;

pub const INVALIDATION_CHANNEL: &str = "strata:invalidate";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationTarget {
    Key(String),
    Tag(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    /// Instance that performed the invalidation; it ignores its own echo.
    pub origin: Uuid,
    /// Tombstone time at the origin.
    pub at: DateTime<Utc>,
    pub target: InvalidationTarget,
}

/// Broadcasts successful invalidations to peer instances.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    async fn publish(&self, target: InvalidationTarget, at: DateTime<Utc>) -> TierResult<()>;
}

pub struct RedisInvalidationBus {
    pool: Pool,
    origin: Uuid,
}

impl RedisInvalidationBus {
    pub fn new(pool: Pool, origin: Uuid) -> Self {
        Self { pool, origin }
    }
}

#[async_trait]
impl InvalidationBus for RedisInvalidationBus {
    async fn publish(&self, target: InvalidationTarget, at: DateTime<Utc>) -> TierResult<()> {
        let message = InvalidationMessage {
            origin: self.origin,
            at,
            target,
        };
        let payload = serde_json::to_string(&message)
            .map_err(|e| TierError::codec(TierLevel::Distributed, e))?;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TierError::unavailable(TierLevel::Distributed, e))?;
        conn.publish::<_, _, ()>(INVALIDATION_CHANNEL, payload)
            .await
            .map_err(|e| TierError::unavailable(TierLevel::Distributed, e))?;

        tracing::debug!(target = ?message.target, "published cache invalidation");
        Ok(())
    }
}

/// Subscribes to [`INVALIDATION_CHANNEL`] and applies peer invalidations
/// through the local orchestrator.
pub struct InvalidationListener {
    pub redis_url: String,
    pub origin: Uuid,
    pub cache: Arc<CacheOrchestrator>,
    pub reconnect: ExponentialBackoff,
}

impl InvalidationListener {
    pub fn new(redis_url: impl Into<String>, origin: Uuid, cache: Arc<CacheOrchestrator>) -> Self {
        Self {
            redis_url: redis_url.into(),
            origin,
            cache,
            reconnect: ExponentialBackoff::new(
                Duration::from_secs(1),
                Duration::from_secs(300),
                u32::MAX,
            ),
        }
    }

    /// Spawn the listener. It reconnects with exponential backoff until
    /// `shutdown` fires.
    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                let outcome = tokio::select! {
                    result = self.run() => result,
                    _ = shutdown.cancelled() => break,
                };
                match outcome {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let backoff = self.reconnect.delay(failures);
                        tracing::error!(
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "invalidation listener error, reconnecting"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown.cancelled() => break,
                        }
                    }
                }
            }
            tracing::info!("invalidation listener stopped");
        })
    }

    async fn run(&self) -> Result<(), String> {
        use futures_util::StreamExt;

        let client = redis::Client::open(self.redis_url.clone())
            .map_err(|e| format!("failed to create Redis client: {e}"))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| format!("failed to get pub/sub connection: {e}"))?;
        pubsub
            .subscribe(INVALIDATION_CHANNEL)
            .await
            .map_err(|e| format!("failed to subscribe: {e}"))?;

        tracing::info!(channel = INVALIDATION_CHANNEL, "subscribed to invalidation channel");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let Ok(raw) = msg.get_payload::<String>() else {
                tracing::warn!("failed to read invalidation message payload");
                continue;
            };
            match serde_json::from_str::<InvalidationMessage>(&raw) {
                Ok(message) => self.apply(message).await,
                Err(e) => tracing::warn!(error = %e, "malformed invalidation message"),
            }
        }
        Err("pub/sub connection closed".to_string())
    }

    /// Apply one peer invalidation. Messages from this instance are skipped.
    pub async fn apply(&self, message: InvalidationMessage) {
        if message.origin == self.origin {
            return;
        }
        match self.cache.apply_peer_invalidation(&message.target, message.at).await {
            Ok(removed) => {
                tracing::debug!(target = ?message.target, removed, "applied peer invalidation")
            }
            Err(e) => tracing::warn!(target = ?message.target, error = %e, "failed to apply peer invalidation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CallContext;
    use crate::entry::{CacheEntry, SetOptions, write_clock};
    use crate::tier::{CacheTier, SharedTier};
    use std::collections::BTreeSet;

    fn listener(origin: Uuid) -> InvalidationListener {
        InvalidationListener::new("redis://unused", origin, CacheOrchestrator::builder().build())
    }

    #[test]
    fn test_message_wire_format() {
        let message = InvalidationMessage {
            origin: Uuid::nil(),
            at: write_clock(),
            target: InvalidationTarget::Tag("entity:deal".into()),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["target"]["tag"], "entity:deal");
        let back: InvalidationMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }

    #[tokio::test]
    async fn test_apply_ignores_own_messages() {
        let me = Uuid::new_v4();
        let listener = listener(me);
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        listener
            .cache
            .set("k", b"v".to_vec(), SetOptions::new().tag("grp"), &ctx)
            .await
            .unwrap();
        let local = listener.cache.tier(TierLevel::Local);

        listener
            .apply(InvalidationMessage {
                origin: me,
                at: write_clock(),
                target: InvalidationTarget::Key("k".into()),
            })
            .await;
        assert!(local.get("k").await.unwrap().is_some());

        listener
            .apply(InvalidationMessage {
                origin: Uuid::new_v4(),
                at: write_clock(),
                target: InvalidationTarget::Tag("grp".into()),
            })
            .await;
        assert!(local.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peer_invalidation_blocks_stale_promotion() {
        let listener = listener(Uuid::new_v4());
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let tags: BTreeSet<String> = ["grp".to_string()].into();
        let stale = CacheEntry::new("k", b"old".to_vec(), Duration::from_secs(60), tags, TierLevel::Distributed);
        let distributed: &SharedTier = listener.cache.tier(TierLevel::Distributed);
        distributed.put(stale.clone()).await.unwrap();

        // The peer cleared the shared tiers, but a copy written before its
        // invalidation is still in flight to tier-2.
        listener
            .apply(InvalidationMessage {
                origin: Uuid::new_v4(),
                at: write_clock(),
                target: InvalidationTarget::Key("k".into()),
            })
            .await;
        assert!(listener.cache.get("k", &ctx).await.unwrap().is_none());
        assert!(listener.cache.tier(TierLevel::Local).get("k").await.unwrap().is_none());

        listener
            .apply(InvalidationMessage {
                origin: Uuid::new_v4(),
                at: write_clock(),
                target: InvalidationTarget::Tag("grp".into()),
            })
            .await;
        let mut other = stale;
        other.key = "other".into();
        distributed.put(other).await.unwrap();
        assert!(listener.cache.get("other", &ctx).await.unwrap().is_none());
        assert!(listener.cache.tier(TierLevel::Local).get("other").await.unwrap().is_none());

        listener
            .cache
            .set("k", b"new".to_vec(), SetOptions::new(), &ctx)
            .await
            .unwrap();
        let hit = listener.cache.get("k", &ctx).await.unwrap().unwrap();
        assert_eq!(hit.bytes(), b"new");
    }
}
