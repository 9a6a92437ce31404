//! Per-feed checkpoint persistence.
//!
//! The checkpoint is the token of the last event whose effects were fully
//! applied (or dead-lettered). Ingestion resumes strictly after it.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::PgPool;
use strata_core::{FeedId, SequenceToken};

use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, feed: &FeedId) -> StoreResult<Option<SequenceToken>>;

    /// Persist `token` for `feed`. Stores never move a checkpoint backwards.
    async fn save(&self, feed: &FeedId, token: SequenceToken) -> StoreResult<()>;
}

/// Process-local checkpoints. Lost on restart unless the store itself is
/// shared with the restarted ingestion layer (tests do this).
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    tokens: DashMap<FeedId, SequenceToken>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, feed: &FeedId) -> Option<SequenceToken> {
        self.tokens.get(feed).map(|t| *t)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, feed: &FeedId) -> StoreResult<Option<SequenceToken>> {
        Ok(self.get(feed))
    }

    async fn save(&self, feed: &FeedId, token: SequenceToken) -> StoreResult<()> {
        self.tokens
            .entry(feed.clone())
            .and_modify(|current| {
                if token > *current {
                    *current = token;
                }
            })
            .or_insert(token);
        Ok(())
    }
}

/// Checkpoints in the `strata_feed_checkpoints` table.
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> StoreResult<()> {
        query(
            r#"
            CREATE TABLE IF NOT EXISTS strata_feed_checkpoints (
                feed_id     TEXT PRIMARY KEY,
                major       BIGINT NOT NULL,
                minor       BIGINT NOT NULL,
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn to_db(value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::InvalidToken(format!("{value} exceeds BIGINT")))
}

fn from_db(value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::InvalidToken(format!("negative component {value}")))
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn load(&self, feed: &FeedId) -> StoreResult<Option<SequenceToken>> {
        let row: Option<(i64, i64)> =
            query_as("SELECT major, minor FROM strata_feed_checkpoints WHERE feed_id = $1")
                .bind(feed.as_str())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((major, minor)) => Ok(Some(SequenceToken::new(from_db(major)?, from_db(minor)?))),
            None => Ok(None),
        }
    }

    async fn save(&self, feed: &FeedId, token: SequenceToken) -> StoreResult<()> {
        query(
            r#"
            INSERT INTO strata_feed_checkpoints (feed_id, major, minor, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (feed_id) DO UPDATE
            SET major = EXCLUDED.major,
                minor = EXCLUDED.minor,
                updated_at = NOW()
            WHERE (strata_feed_checkpoints.major, strata_feed_checkpoints.minor)
                < (EXCLUDED.major, EXCLUDED.minor)
            "#,
        )
        .bind(feed.as_str())
        .bind(to_db(token.major())?)
        .bind(to_db(token.minor())?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
