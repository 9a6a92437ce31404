//! Change feeds.
//!
//! A feed is an ordered, resumable log of change events. Consumers poll it
//! with the last token they processed and receive strictly newer records.

mod memory;
mod redis_stream;

pub use memory::MemoryFeed;
pub use redis_stream::RedisStreamFeed;

use async_trait::async_trait;
use strata_core::{ChangeEvent, FeedId, SequenceToken};

use crate::error::FeedError;

/// A record whose payload could not be normalized into a [`ChangeEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedRecord {
    pub token: SequenceToken,
    pub reason: String,
    /// Raw record as received, for the dead-letter log.
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedRecord {
    Event(ChangeEvent),
    Malformed(MalformedRecord),
}

impl FeedRecord {
    pub fn token(&self) -> SequenceToken {
        match self {
            FeedRecord::Event(event) => event.sequence_token,
            FeedRecord::Malformed(record) => record.token,
        }
    }
}

/// One page of records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedBatch {
    pub records: Vec<FeedRecord>,
    /// Position to poll from next. `None` when nothing new was returned.
    pub next_token: Option<SequenceToken>,
}

impl FeedBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Feed subscription interface.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    fn id(&self) -> &FeedId;

    /// Return up to `max` records with tokens strictly after `since`
    /// (`None` = from the beginning), in token order.
    ///
    /// Fails with [`FeedError::TokenExpired`] when `since` predates the
    /// oldest retained record.
    async fn poll(&self, since: Option<SequenceToken>, max: usize) -> Result<FeedBatch, FeedError>;
}
