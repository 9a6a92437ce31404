//! Publication boundary between stream processing and client fan-out.

use serde::{Deserialize, Serialize};

/// A message routed to every connection subscribed to `topic`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub topic: String,
    pub payload: serde_json::Value,
    /// Publications sharing a dedupe key inside the dedupe window are
    /// delivered at most once.
    pub dedupe_key: Option<String>,
}

impl Publication {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            dedupe_key: None,
        }
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Outcome of a single publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    /// Connections whose subscriptions matched the topic.
    pub matched: usize,
    /// Connections the message was enqueued for.
    pub enqueued: usize,
    /// Connections evicted as slow consumers during this call.
    pub evicted: usize,
    /// The publication was suppressed as a duplicate.
    pub duplicate: bool,
}

/// Non-blocking fan-out target.
///
/// Implementations must never block the caller: a slow receiver is degraded
/// or evicted, never waited on.
pub trait PublishSink: Send + Sync {
    fn publish(&self, publication: Publication) -> PublishReport;
}
