//! Dead-letter log for events that could not be processed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx_core::query::query;
use sqlx_postgres::PgPool;
use strata_core::{FeedId, SequenceToken};

use crate::error::StoreResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub feed: FeedId,
    pub token: SequenceToken,
    pub processor: String,
    pub reason: String,
    pub attempts: u32,
    /// The event (or raw record) that failed.
    pub record: serde_json::Value,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: DeadLetter) -> StoreResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryDeadLetterLog {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterLog {
    async fn record(&self, letter: DeadLetter) -> StoreResult<()> {
        self.letters.lock().push(letter);
        Ok(())
    }
}

/// Dead letters in the `strata_dead_letters` table. Re-recording the same
/// `(feed, token)` updates the existing row.
pub struct PostgresDeadLetterLog {
    pool: PgPool,
}

impl PostgresDeadLetterLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> StoreResult<()> {
        query(
            r#"
            CREATE TABLE IF NOT EXISTS strata_dead_letters (
                feed_id     TEXT NOT NULL,
                token       TEXT NOT NULL,
                processor   TEXT NOT NULL,
                reason      TEXT NOT NULL,
                attempts    INTEGER NOT NULL,
                record      JSONB NOT NULL,
                failed_at   TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (feed_id, token)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for PostgresDeadLetterLog {
    async fn record(&self, letter: DeadLetter) -> StoreResult<()> {
        query(
            r#"
            INSERT INTO strata_dead_letters
                (feed_id, token, processor, reason, attempts, record, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (feed_id, token) DO UPDATE
            SET reason = EXCLUDED.reason,
                attempts = EXCLUDED.attempts,
                failed_at = EXCLUDED.failed_at
            "#,
        )
        .bind(letter.feed.as_str())
        .bind(letter.token.to_string())
        .bind(&letter.processor)
        .bind(&letter.reason)
        .bind(i32::try_from(letter.attempts).unwrap_or(i32::MAX))
        .bind(&letter.record)
        .bind(letter.failed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
