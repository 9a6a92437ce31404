//! Feed backed by a Redis stream.
//!
//! Each stream entry carries the fields `entity_type`, `entity_id`,
//! `change_kind` and `payload` (JSON text). The entry id (`ms-seq`) is the
//! sequence token.

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use redis::streams::{StreamId, StreamRangeReply};
use std::collections::HashMap;
use strata_core::{ChangeEvent, ChangeKind, FeedId, SequenceToken};

use super::{ChangeFeed, FeedBatch, FeedRecord, MalformedRecord};
use crate::error::FeedError;

pub struct RedisStreamFeed {
    id: FeedId,
    pool: Pool,
    stream_key: String,
}

impl RedisStreamFeed {
    pub fn new(id: FeedId, pool: Pool, stream_key: impl Into<String>) -> Self {
        Self {
            id,
            pool,
            stream_key: stream_key.into(),
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Append an entry (used by producers and tests). Returns the entry token.
    pub async fn append(
        &self,
        entity_type: &str,
        entity_id: &str,
        change_kind: ChangeKind,
        payload: &serde_json::Value,
    ) -> Result<SequenceToken, FeedError> {
        let mut conn = self.pool.get().await.map_err(FeedError::unavailable)?;
        let body = payload.to_string();
        let id: String = conn
            .xadd(
                &self.stream_key,
                "*",
                &[
                    ("entity_type", entity_type),
                    ("entity_id", entity_id),
                    ("change_kind", change_kind.as_str()),
                    ("payload", body.as_str()),
                ],
            )
            .await
            .map_err(FeedError::unavailable)?;
        id.parse()
            .map_err(|e| FeedError::unavailable(format!("unexpected stream id '{id}': {e}")))
    }

    /// Highest id removed by trimming, if the server reports it.
    async fn max_deleted(
        &self,
        conn: &mut deadpool_redis::Connection,
    ) -> Result<Option<SequenceToken>, FeedError> {
        let info: HashMap<String, redis::Value> = match redis::cmd("XINFO")
            .arg("STREAM")
            .arg(&self.stream_key)
            .query_async(conn)
            .await
        {
            Ok(info) => info,
            // A stream that does not exist yet has nothing trimmed.
            Err(e) if e.kind() == redis::ErrorKind::ResponseError => return Ok(None),
            Err(e) => return Err(FeedError::unavailable(e)),
        };

        let Some(value) = info.get("max-deleted-entry-id") else {
            return Ok(None);
        };
        let raw: String = redis::from_redis_value(value).map_err(FeedError::unavailable)?;
        let token: SequenceToken = raw
            .parse()
            .map_err(|e| FeedError::unavailable(format!("unexpected stream id '{raw}': {e}")))?;
        Ok((token > SequenceToken::ZERO).then_some(token))
    }

    fn decode(&self, entry: &StreamId) -> Option<FeedRecord> {
        let token: SequenceToken = entry.id.parse().ok()?;
        let field = |name: &str| entry.get::<String>(name);

        let malformed = |reason: String| {
            let raw: serde_json::Map<String, serde_json::Value> = ["entity_type", "entity_id", "change_kind", "payload"]
                .iter()
                .filter_map(|name| field(name).map(|v| (name.to_string(), serde_json::Value::String(v))))
                .collect();
            FeedRecord::Malformed(MalformedRecord {
                token,
                reason,
                raw: serde_json::Value::Object(raw),
            })
        };

        let (Some(entity_type), Some(entity_id), Some(kind)) =
            (field("entity_type"), field("entity_id"), field("change_kind"))
        else {
            return Some(malformed("missing entity_type, entity_id or change_kind".into()));
        };
        let change_kind: ChangeKind = match kind.parse() {
            Ok(kind) => kind,
            Err(e) => return Some(malformed(format!("{e}"))),
        };
        let payload = match field("payload") {
            Some(text) if !text.is_empty() => match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(e) => return Some(malformed(format!("payload is not JSON: {e}"))),
            },
            _ => serde_json::Value::Null,
        };

        Some(
            match ChangeEvent::normalize(self.id.clone(), token, entity_type, entity_id, change_kind, payload) {
                Ok(event) => FeedRecord::Event(event),
                Err(e) => malformed(e.to_string()),
            },
        )
    }
}

#[async_trait]
impl ChangeFeed for RedisStreamFeed {
    fn id(&self) -> &FeedId {
        &self.id
    }

    async fn poll(&self, since: Option<SequenceToken>, max: usize) -> Result<FeedBatch, FeedError> {
        let mut conn = self.pool.get().await.map_err(FeedError::unavailable)?;

        let position = since.unwrap_or(SequenceToken::ZERO);
        if let Some(deleted) = self.max_deleted(&mut conn).await?
            && deleted > position
        {
            return Err(FeedError::TokenExpired {
                requested: position,
                earliest: deleted.successor(),
            });
        }

        let start = match since {
            Some(token) => format!("({token}"),
            None => "-".to_string(),
        };
        let reply: StreamRangeReply = conn
            .xrange_count(&self.stream_key, start, "+", max)
            .await
            .map_err(FeedError::unavailable)?;

        let records: Vec<FeedRecord> = reply.ids.iter().filter_map(|e| self.decode(e)).collect();
        let next_token = records.last().map(FeedRecord::token);
        Ok(FeedBatch { records, next_token })
    }
}
