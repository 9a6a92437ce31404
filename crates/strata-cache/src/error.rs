//! Cache error taxonomy.
//!
//! A cache miss is not an error: lookups return `Option`. Everything that
//! can go wrong while talking to a tier is a [`TierError`]; the orchestrator
//! decides whether to degrade (reads) or to fail loudly (writes,
//! invalidation).

use strata_core::TierLevel;
use thiserror::Error;

/// Failure reported by a single tier.
#[derive(Debug, Clone, Error)]
pub enum TierError {
    /// The tier cannot be reached (connection refused, pool exhausted, ...).
    #[error("{tier} tier unavailable: {reason}")]
    Unavailable { tier: TierLevel, reason: String },

    /// The tier answered with data that could not be decoded.
    #[error("{tier} tier returned undecodable data: {reason}")]
    Codec { tier: TierLevel, reason: String },
}

impl TierError {
    pub fn unavailable(tier: TierLevel, reason: impl ToString) -> Self {
        Self::Unavailable {
            tier,
            reason: reason.to_string(),
        }
    }

    pub fn codec(tier: TierLevel, reason: impl ToString) -> Self {
        Self::Codec {
            tier,
            reason: reason.to_string(),
        }
    }

    pub fn tier(&self) -> TierLevel {
        match self {
            Self::Unavailable { tier, .. } | Self::Codec { tier, .. } => *tier,
        }
    }

    /// Transient failures are retried locally before surfacing.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Errors returned by the cache orchestrator.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Tier(#[from] TierError),

    /// Invalidation removed the target from some tiers but not all of them.
    /// Readers may still observe the old value from the failed tiers.
    #[error("invalidation of '{target}' did not reach tiers {failed:?}")]
    PartialInvalidation {
        target: String,
        failed: Vec<TierLevel>,
    },

    #[error("deadline exceeded during {operation}")]
    Timeout { operation: &'static str },

    #[error("write-back queue is closed")]
    WriteBackClosed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    pub fn timeout(operation: &'static str) -> Self {
        Self::Timeout { operation }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Error from [`get_or_load`](crate::CacheOrchestrator::get_or_load).
///
/// Loader failures are handed back unchanged in [`LoadError::Loader`].
#[derive(Debug, Error)]
pub enum LoadError<E> {
    #[error("loader failed: {0}")]
    Loader(E),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl<E> LoadError<E> {
    /// The loader's own error, if that is what failed.
    pub fn into_loader_error(self) -> Option<E> {
        match self {
            Self::Loader(e) => Some(e),
            Self::Cache(_) => None,
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
pub type TierResult<T> = Result<T, TierError>;
