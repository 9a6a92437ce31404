//! Event envelope types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::payload::EntityPayload;
use super::token::SequenceToken;
use crate::error::CoreError;

// ============================================================================
// Feed identity
// ============================================================================

/// Identifier of an external change feed.
///
/// Restricted to `[A-Za-z0-9_.:-]` so it can be embedded in cache keys,
/// Redis key names and dedupe keys without escaping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeedId(String);

impl FeedId {
    pub fn new(id: impl Into<String>) -> Result<Self, CoreError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= 128
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'));
        if valid {
            Ok(Self(id))
        } else {
            Err(CoreError::invalid_feed_id(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FeedId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for FeedId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FeedId> for String {
    fn from(value: FeedId) -> Self {
        value.0
    }
}

// ============================================================================
// Change kinds
// ============================================================================

/// Type of entity change carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created" | "create" | "insert" => Ok(ChangeKind::Created),
            "updated" | "update" => Ok(ChangeKind::Updated),
            "deleted" | "delete" | "remove" => Ok(ChangeKind::Deleted),
            other => Err(CoreError::payload_schema(
                "change_kind",
                format!("unknown change kind '{other}'"),
            )),
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Canonical envelope for a change observed on an external feed.
///
/// `(source_feed, sequence_token)` uniquely identifies the event and is the
/// idempotency key for every downstream effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub source_feed: FeedId,
    pub entity_type: String,
    pub entity_id: String,
    pub change_kind: ChangeKind,
    pub payload: EntityPayload,
    pub sequence_token: SequenceToken,
    /// When the ingestion layer normalized the event.
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Build an envelope, decoding the raw JSON payload against the schema
    /// registered for `entity_type`.
    pub fn normalize(
        source_feed: FeedId,
        sequence_token: SequenceToken,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        change_kind: ChangeKind,
        raw_payload: serde_json::Value,
    ) -> Result<Self, CoreError> {
        let entity_type = entity_type.into();
        let payload = EntityPayload::decode(&entity_type, change_kind, raw_payload)?;
        Ok(Self {
            source_feed,
            entity_type,
            entity_id: entity_id.into(),
            change_kind,
            payload,
            sequence_token,
            observed_at: Utc::now(),
        })
    }

    /// Idempotency key for downstream effects.
    pub fn idempotency_key(&self) -> String {
        format!("{}@{}", self.source_feed, self.sequence_token)
    }

    pub fn is_deletion(&self) -> bool {
        self.change_kind == ChangeKind::Deleted
    }
}
