//! Multi-tier cache for dashboard reads.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  CacheOrchestrator                  │
//! │  get / get_or_load / set / invalidate(_by_tag)      │
//! └──────────┬──────────────────┬──────────────────┬────┘
//!            │                  │                  │
//!     ┌──────▼──────┐    ┌──────▼──────┐    ┌──────▼──────┐
//!     │   tier-1    │    │   tier-2    │    │   tier-3    │
//!     │  DashMap    │    │   Redis     │    │ PostgreSQL  │
//!     └─────────────┘    └──────┬──────┘    └─────────────┘
//!                               │ pub/sub
//!                        peer tier-1 invalidation
//! ```
//!
//! Reads fall through the tiers and promote hits forward. Writes choose a
//! [`WriteStrategy`]. Invalidation clears every tier or reports exactly which
//! tiers it could not reach.

pub mod adaptive_ttl;
pub mod consistency;
pub mod context;
pub mod entry;
pub mod error;
pub mod orchestrator;
pub mod pubsub;
pub mod tier;
pub mod write_back;

pub use adaptive_ttl::{AdaptiveTtl, AdaptiveTtlConfig};
pub use context::{CallContext, DeadlineExceeded};
pub use entry::{CacheEntry, CacheHit, HitSource, SetOptions, WriteStrategy, write_clock};
pub use error::{CacheError, CacheResult, LoadError, TierError, TierResult};
pub use orchestrator::{
    CacheOrchestrator, CacheOrchestratorBuilder, CacheStats, OrchestratorConfig, TierCounts,
    TierHealth,
};
pub use pubsub::{
    INVALIDATION_CHANNEL, InvalidationBus, InvalidationListener, InvalidationMessage,
    InvalidationTarget, RedisInvalidationBus,
};
pub use tier::{CacheTier, MemoryTier, PostgresTier, PutOutcome, RedisTier, SharedTier};
