//! Stream error types.

use strata_cache::CacheError;
use strata_core::{FeedId, SequenceToken};
use thiserror::Error;

/// Failure reported by a [`ChangeFeed`](crate::ChangeFeed).
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    /// The requested position has been compacted away.
    #[error("token {requested} is no longer available (earliest retained: {earliest})")]
    TokenExpired {
        requested: SequenceToken,
        earliest: SequenceToken,
    },

    /// The feed could not be reached. Retried with backoff.
    #[error("feed unavailable: {0}")]
    Unavailable(String),
}

impl FeedError {
    pub fn unavailable(reason: impl ToString) -> Self {
        Self::Unavailable(reason.to_string())
    }
}

/// Why a processor could not handle an event.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("event rejected: {0}")]
    Rejected(String),

    #[error("processor panicked: {0}")]
    Panicked(String),

    #[error("applying cache effect failed: {0}")]
    Cache(#[from] CacheError),

    #[error("payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl ProcessorError {
    pub fn rejected(reason: impl ToString) -> Self {
        Self::Rejected(reason.to_string())
    }
}

/// Storage failure in a checkpoint store or dead-letter log.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx_core::Error),

    #[error("stored token is invalid: {0}")]
    InvalidToken(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors surfaced by the ingestion layer.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The feed cannot resume from its checkpoint. Fatal for that feed.
    #[error("feed '{feed}' cannot resume from {requested}: earliest retained token is {earliest}")]
    FeedResumption {
        feed: FeedId,
        requested: SequenceToken,
        earliest: SequenceToken,
    },

    /// An event failed every processing attempt and was dead-lettered.
    #[error("event {feed}@{token} is poison: {reason}")]
    PoisonEvent {
        feed: FeedId,
        token: SequenceToken,
        reason: String,
    },

    #[error("feed '{0}' is registered twice")]
    DuplicateFeed(FeedId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type StreamResult<T> = Result<T, StreamError>;
pub type StoreResult<T> = Result<T, StoreError>;
