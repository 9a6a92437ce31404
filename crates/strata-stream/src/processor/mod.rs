//! Stream processors.
//!
//! A processor turns one [`ChangeEvent`] into a set of [`Effects`]. It does
//! no I/O itself: the ingestion worker applies the effects, so a processor
//! can be retried freely and tested without a cache or gateway.

mod channel;
mod entity;

pub use channel::ChannelEventProcessor;
pub use entity::{EntityChangeProcessor, EntityWriteMode};

use std::time::Duration;
use strata_core::{ChangeEvent, Publication};

use crate::error::ProcessorError;

/// A cache mutation requested by a processor.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEffect {
    Invalidate {
        key: String,
    },
    InvalidateTag {
        tag: String,
    },
    Upsert {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
        tags: Vec<String>,
    },
}

/// A message to fan out to subscribed clients.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishEffect {
    pub topic: String,
    pub payload: serde_json::Value,
    /// `"{feed}@{token}/{topic}"`: replays of the same event publish the same
    /// key and are suppressed downstream.
    pub dedupe_key: String,
}

impl PublishEffect {
    pub fn for_event(event: &ChangeEvent, topic: impl Into<String>, payload: serde_json::Value) -> Self {
        let topic = topic.into();
        Self {
            dedupe_key: format!("{}/{}", event.idempotency_key(), topic),
            topic,
            payload,
        }
    }

    pub fn into_publication(self) -> Publication {
        Publication::new(self.topic, self.payload).with_dedupe_key(self.dedupe_key)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Effects {
    pub cache: Vec<CacheEffect>,
    pub publish: Vec<PublishEffect>,
}

impl Effects {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty() && self.publish.is_empty()
    }

    pub fn cache(mut self, effect: CacheEffect) -> Self {
        self.cache.push(effect);
        self
    }

    pub fn publish(mut self, effect: PublishEffect) -> Self {
        self.publish.push(effect);
        self
    }
}

pub trait StreamProcessor: Send + Sync {
    /// Name recorded in dead letters and logs.
    fn name(&self) -> &str;

    fn process(&self, event: &ChangeEvent) -> Result<Effects, ProcessorError>;
}

/// Cache key for one entity.
pub fn entity_key(entity_type: &str, entity_id: &str) -> String {
    format!("entity:{entity_type}:{entity_id}")
}

/// Tag shared by every cached entry of one entity type.
pub fn entity_tag(entity_type: &str) -> String {
    format!("entity:{entity_type}")
}
