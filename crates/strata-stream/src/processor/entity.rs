//! Business CDC processor for CRM, call-analytics and chat entities.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use strata_core::{ChangeEvent, ChangeKind, EntityPayload};

use super::{CacheEffect, Effects, PublishEffect, StreamProcessor, entity_key, entity_tag};
use crate::error::ProcessorError;

/// What happens to the cached entity on create/update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityWriteMode {
    /// Write the fresh payload into the cache.
    #[default]
    Upsert,
    /// Drop the entity and every entry tagged with its type.
    Invalidate,
}

pub struct EntityChangeProcessor {
    /// Entity types handled; empty means all.
    entity_types: HashSet<String>,
    mode: EntityWriteMode,
    ttl: Option<Duration>,
}

impl EntityChangeProcessor {
    pub fn new() -> Self {
        Self {
            entity_types: HashSet::new(),
            mode: EntityWriteMode::default(),
            ttl: None,
        }
    }

    pub fn with_entity_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mode(mut self, mode: EntityWriteMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn handles(&self, entity_type: &str) -> bool {
        self.entity_types.is_empty() || self.entity_types.contains(entity_type)
    }
}

impl Default for EntityChangeProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamProcessor for EntityChangeProcessor {
    fn name(&self) -> &str {
        "entity-change"
    }

    fn process(&self, event: &ChangeEvent) -> Result<Effects, ProcessorError> {
        if !self.handles(&event.entity_type) {
            return Ok(Effects::none());
        }
        if event.entity_id.is_empty() {
            return Err(ProcessorError::rejected("entity id is empty"));
        }
        if !event.is_deletion() && matches!(event.payload, EntityPayload::Tombstone) {
            return Err(ProcessorError::rejected("non-delete change without a body"));
        }

        let key = entity_key(&event.entity_type, &event.entity_id);
        let tag = entity_tag(&event.entity_type);
        let data = event.payload.to_json();

        let mut effects = Effects::none();
        match (event.change_kind, self.mode) {
            (ChangeKind::Deleted, _) => {
                effects = effects.cache(CacheEffect::Invalidate { key: key.clone() });
            }
            (_, EntityWriteMode::Upsert) => {
                effects = effects.cache(CacheEffect::Upsert {
                    key: key.clone(),
                    value: serde_json::to_vec(&data)?,
                    ttl: self.ttl,
                    tags: vec![tag.clone()],
                });
            }
            (_, EntityWriteMode::Invalidate) => {
                effects = effects
                    .cache(CacheEffect::Invalidate { key: key.clone() })
                    .cache(CacheEffect::InvalidateTag { tag: tag.clone() });
            }
        }

        let message = json!({
            "entity_type": event.entity_type,
            "entity_id": event.entity_id,
            "change": event.change_kind.as_str(),
            "data": data,
            "feed": event.source_feed.as_str(),
            "token": event.sequence_token.to_string(),
            "observed_at": event.observed_at,
        });
        Ok(effects.publish(PublishEffect::for_event(event, key, message)))
    }
}
