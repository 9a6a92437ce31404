//! Typed payloads for the entity types the dashboard knows about.
//!
//! Known entity types are decoded against an explicit schema. Anything else
//! is carried as [`EntityPayload::Opaque`] so new producers can ship events
//! before a schema exists for them.

use serde::{Deserialize, Serialize};

use super::types::ChangeKind;
use crate::error::CoreError;

/// CRM deal snapshot (`entity_type = "deal"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRecord {
    pub name: String,
    pub stage: String,
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

/// Call-analytics record (`entity_type = "call"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub agent: String,
    pub duration_secs: u64,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub sentiment: Option<f32>,
}

/// Chat connector message (`entity_type = "chat_message"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub conversation_id: String,
    pub author: String,
    pub body: String,
}

/// Payload of a [`ChangeEvent`](super::ChangeEvent), keyed by entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EntityPayload {
    Deal(DealRecord),
    Call(CallRecord),
    ChatMessage(ChatMessage),
    /// Deletion without a body.
    Tombstone,
    /// Entity type without a registered schema.
    Opaque(serde_json::Value),
}

impl EntityPayload {
    pub const DEAL: &'static str = "deal";
    pub const CALL: &'static str = "call";
    pub const CHAT_MESSAGE: &'static str = "chat_message";

    /// Decode a raw feed payload for `entity_type`.
    ///
    /// Deletions with an empty body become [`EntityPayload::Tombstone`]. A
    /// known entity type whose body does not match its schema is an error;
    /// unknown entity types are kept opaque.
    pub fn decode(
        entity_type: &str,
        change_kind: ChangeKind,
        raw: serde_json::Value,
    ) -> Result<Self, CoreError> {
        let empty = match &raw {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        };
        if change_kind == ChangeKind::Deleted && empty {
            return Ok(EntityPayload::Tombstone);
        }

        let schema_err = |e: serde_json::Error| CoreError::payload_schema(entity_type, e.to_string());
        match entity_type {
            Self::DEAL => serde_json::from_value(raw).map(EntityPayload::Deal).map_err(schema_err),
            Self::CALL => serde_json::from_value(raw).map(EntityPayload::Call).map_err(schema_err),
            Self::CHAT_MESSAGE => serde_json::from_value(raw)
                .map(EntityPayload::ChatMessage)
                .map_err(schema_err),
            _ => Ok(EntityPayload::Opaque(raw)),
        }
    }

    /// Whether the payload was decoded against a known schema.
    pub fn is_typed(&self) -> bool {
        !matches!(self, EntityPayload::Opaque(_) | EntityPayload::Tombstone)
    }

    /// Plain JSON body, as published to dashboard clients.
    pub fn to_json(&self) -> serde_json::Value {
        let body = match self {
            EntityPayload::Deal(deal) => serde_json::to_value(deal),
            EntityPayload::Call(call) => serde_json::to_value(call),
            EntityPayload::ChatMessage(msg) => serde_json::to_value(msg),
            EntityPayload::Tombstone => return serde_json::Value::Null,
            EntityPayload::Opaque(value) => return value.clone(),
        };
        body.unwrap_or(serde_json::Value::Null)
    }
}
