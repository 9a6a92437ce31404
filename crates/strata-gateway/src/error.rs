//! Gateway error types.

use strata_core::CoreError;
use thiserror::Error;

use crate::manager::ConnectionId;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    InvalidTopic(#[from] CoreError),

    #[error("malformed client message: {0}")]
    Protocol(String),

    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid gateway configuration: {0}")]
    InvalidConfig(String),

    #[error("gateway is shutting down")]
    ShuttingDown,
}

impl GatewayError {
    pub fn transport(reason: impl ToString) -> Self {
        Self::Transport(reason.to_string())
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
