//! Tier-3: durable cache table in PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::PgPool;
use std::collections::BTreeSet;
use std::sync::Arc;
use strata_core::TierLevel;
use tracing::{debug, info};

use super::{CacheTier, PutOutcome};
use crate::entry::CacheEntry;
use crate::error::{TierError, TierResult};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS strata_cache_entries (
    key         TEXT PRIMARY KEY,
    value       BYTEA NOT NULL,
    tags        TEXT[] NOT NULL DEFAULT '{}',
    created_at  TIMESTAMPTZ NOT NULL,
    expires_at  TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_TAG_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS strata_cache_entries_tags_idx
    ON strata_cache_entries USING GIN (tags)
"#;

type EntryRow = (Vec<u8>, Vec<String>, DateTime<Utc>, DateTime<Utc>);

pub struct PostgresTier {
    pool: PgPool,
}

impl PostgresTier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the cache table and its tag index if missing.
    pub async fn ensure_schema(&self) -> TierResult<()> {
        query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        query(CREATE_TAG_INDEX)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        info!("durable cache schema ready");
        Ok(())
    }

    /// Delete expired rows. Returns the number of rows removed.
    pub async fn purge_expired(&self) -> TierResult<u64> {
        let result = query("DELETE FROM strata_cache_entries WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        debug!(purged = result.rows_affected(), "purged expired cache rows");
        Ok(result.rows_affected())
    }
}

fn unavailable(e: sqlx_core::Error) -> TierError {
    TierError::unavailable(TierLevel::Durable, e)
}

#[async_trait]
impl CacheTier for PostgresTier {
    fn level(&self) -> TierLevel {
        TierLevel::Durable
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn get(&self, key: &str) -> TierResult<Option<CacheEntry>> {
        let row: Option<EntryRow> = query_as(
            r#"
            SELECT value, tags, created_at, expires_at
            FROM strata_cache_entries
            WHERE key = $1
              AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row.map(|(value, tags, created_at, expires_at)| CacheEntry {
            key: key.to_string(),
            value: Arc::new(value),
            tags: tags.into_iter().collect::<BTreeSet<_>>(),
            created_at,
            expires_at,
            tier: TierLevel::Durable,
        }))
    }

    async fn put(&self, entry: CacheEntry) -> TierResult<PutOutcome> {
        let tags: Vec<String> = entry.tags.iter().cloned().collect();
        let result = query(
            r#"
            INSERT INTO strata_cache_entries (key, value, tags, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                tags = EXCLUDED.tags,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            WHERE strata_cache_entries.created_at <= EXCLUDED.created_at
            "#,
        )
        .bind(&entry.key)
        .bind(entry.value.as_slice())
        .bind(tags)
        .bind(entry.created_at)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(if result.rows_affected() > 0 {
            PutOutcome::Stored
        } else {
            PutOutcome::Superseded
        })
    }

    async fn remove(&self, key: &str) -> TierResult<bool> {
        let result = query("DELETE FROM strata_cache_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_by_tag(&self, tag: &str) -> TierResult<Vec<String>> {
        let rows: Vec<(String,)> = query_as(
            "DELETE FROM strata_cache_entries WHERE $1 = ANY(tags) RETURNING key",
        )
        .bind(tag)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let mut keys: Vec<String> = rows.into_iter().map(|(key,)| key).collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> TierResult<()> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
