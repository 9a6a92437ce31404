//! Generic event feed processor: routes events to named channels.
//!
//! The payload must be an object with a `channel` string. Its `data` field
//! (or the whole payload when absent) is published to `channel:{name}`,
//! enriched with the feed and observation time. An optional
//! `invalidate_tags` array is turned into tag invalidations.

use serde_json::{Value, json};
use strata_core::{ChangeEvent, EntityPayload};
use tracing::debug;

use super::{CacheEffect, Effects, PublishEffect, StreamProcessor};
use crate::error::ProcessorError;

#[derive(Debug, Default)]
pub struct ChannelEventProcessor;

impl ChannelEventProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl StreamProcessor for ChannelEventProcessor {
    fn name(&self) -> &str {
        "channel-event"
    }

    fn process(&self, event: &ChangeEvent) -> Result<Effects, ProcessorError> {
        let body = match &event.payload {
            EntityPayload::Opaque(Value::Object(map)) => map,
            _ => {
                debug!(token = %event.sequence_token, "event without channel payload dropped");
                return Ok(Effects::none());
            }
        };
        let Some(channel) = body.get("channel").and_then(Value::as_str) else {
            debug!(token = %event.sequence_token, "event without channel dropped");
            return Ok(Effects::none());
        };
        if channel.is_empty() {
            return Err(ProcessorError::rejected("channel name is empty"));
        }

        let mut effects = Effects::none();
        if let Some(tags) = body.get("invalidate_tags") {
            let tags = tags
                .as_array()
                .ok_or_else(|| ProcessorError::rejected("invalidate_tags must be an array"))?;
            for tag in tags {
                let tag = tag
                    .as_str()
                    .ok_or_else(|| ProcessorError::rejected("invalidate_tags must contain strings"))?;
                effects = effects.cache(CacheEffect::InvalidateTag { tag: tag.to_string() });
            }
        }

        let data = body
            .get("data")
            .cloned()
            .unwrap_or_else(|| Value::Object(body.clone()));
        let message = json!({
            "event": event.entity_type,
            "id": event.entity_id,
            "data": data,
            "feed": event.source_feed.as_str(),
            "observed_at": event.observed_at,
        });
        Ok(effects.publish(PublishEffect::for_event(event, format!("channel:{channel}"), message)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{ChangeKind, FeedId, SequenceToken};

    fn event(payload: Value) -> ChangeEvent {
        ChangeEvent::normalize(
            FeedId::new("events").unwrap(),
            SequenceToken::offset(1),
            "alert",
            "a1",
            ChangeKind::Created,
            payload,
        )
        .unwrap()
    }

    #[test]
    fn test_routes_to_channel() {
        let effects = ChannelEventProcessor::new()
            .process(&event(json!({"channel": "ops", "data": {"level": "high"}})))
            .unwrap();

        assert!(effects.cache.is_empty());
        let publish = &effects.publish[0];
        assert_eq!(publish.topic, "channel:ops");
        assert_eq!(publish.payload["data"]["level"], "high");
        assert_eq!(publish.payload["feed"], "events");
    }

    #[test]
    fn test_without_channel_is_dropped() {
        let effects = ChannelEventProcessor::new()
            .process(&event(json!({"data": 1})))
            .unwrap();
        assert!(effects.is_empty());
    }

    #[test]
    fn test_invalidate_tags() {
        let effects = ChannelEventProcessor::new()
            .process(&event(json!({"channel": "ops", "invalidate_tags": ["view:ops"]})))
            .unwrap();
        assert_eq!(
            effects.cache,
            vec![CacheEffect::InvalidateTag {
                tag: "view:ops".into()
            }]
        );

        let err = ChannelEventProcessor::new()
            .process(&event(json!({"channel": "ops", "invalidate_tags": "view:ops"})))
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Rejected(_)));
    }
}
