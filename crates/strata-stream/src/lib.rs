//! Change-feed ingestion for Strata.
//!
//! Feeds are polled from their last checkpoint, each event is turned into
//! cache and publish effects by a [`StreamProcessor`], and the effects are
//! applied at least once. Events that keep failing land in a dead-letter
//! log instead of blocking their feed.

pub mod checkpoint;
pub mod dead_letter;
pub mod error;
pub mod feed;
pub mod ingestion;
pub mod processor;

pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, PostgresCheckpointStore};
pub use dead_letter::{DeadLetter, DeadLetterSink, MemoryDeadLetterLog, PostgresDeadLetterLog};
pub use error::{FeedError, ProcessorError, StoreError, StoreResult, StreamError, StreamResult};
pub use feed::{ChangeFeed, FeedBatch, FeedRecord, MalformedRecord, MemoryFeed, RedisStreamFeed};
pub use ingestion::{
    FeedState, FeedStatus, FeedStatuses, IngestionConfig, IngestionHandle, IngestionLayer,
    IngestionLayerBuilder, ShutdownReport,
};
pub use processor::{
    CacheEffect, ChannelEventProcessor, Effects, EntityChangeProcessor, EntityWriteMode,
    PublishEffect, StreamProcessor, entity_key, entity_tag,
};
