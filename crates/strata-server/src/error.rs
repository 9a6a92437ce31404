use strata_cache::TierError;
use strata_core::CoreError;
use strata_stream::{StoreError, StreamError};
use thiserror::Error;

use crate::config::ConfigError;

/// Startup failures. Anything after startup is handled by the component
/// that owns it.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("postgres: {0}")]
    Postgres(#[from] sqlx_core::Error),

    #[error("redis: {0}")]
    Redis(String),

    #[error("cache tier: {0}")]
    Tier(#[from] TierError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;
