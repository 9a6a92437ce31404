use thiserror::Error;

/// Core error types shared by every Strata crate.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid sequence token: {0}")]
    InvalidToken(String),

    #[error("Invalid feed id: {0}")]
    InvalidFeedId(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Payload for entity type '{entity_type}' does not match its schema: {message}")]
    PayloadSchema {
        entity_type: String,
        message: String,
    },

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a new InvalidToken error
    pub fn invalid_token(token: impl Into<String>) -> Self {
        Self::InvalidToken(token.into())
    }

    /// Create a new InvalidFeedId error
    pub fn invalid_feed_id(id: impl Into<String>) -> Self {
        Self::InvalidFeedId(id.into())
    }

    /// Create a new InvalidTopic error
    pub fn invalid_topic(topic: impl Into<String>) -> Self {
        Self::InvalidTopic(topic.into())
    }

    /// Create a new PayloadSchema error
    pub fn payload_schema(entity_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PayloadSchema {
            entity_type: entity_type.into(),
            message: message.into(),
        }
    }

    /// Check if this error was caused by malformed input rather than a system fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidToken(_)
                | Self::InvalidFeedId(_)
                | Self::InvalidTopic(_)
                | Self::PayloadSchema { .. }
                | Self::JsonError(_)
        )
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
