//! Cache tier identifiers.

use serde::{Deserialize, Serialize};

/// One layer of the cache hierarchy.
///
/// Tiers are ordered from fastest to slowest, so `Local < Distributed < Durable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierLevel {
    /// Tier 1: in-process memory, per instance.
    Local,
    /// Tier 2: shared across instances (Redis).
    Distributed,
    /// Tier 3: durable, tag-addressable store (PostgreSQL).
    Durable,
}

impl TierLevel {
    /// All tiers, fastest first.
    pub const ALL: [TierLevel; 3] = [TierLevel::Local, TierLevel::Distributed, TierLevel::Durable];

    /// Numeric tier index (1-based).
    pub fn index(&self) -> u8 {
        match self {
            TierLevel::Local => 1,
            TierLevel::Distributed => 2,
            TierLevel::Durable => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TierLevel::Local => "local",
            TierLevel::Distributed => "distributed",
            TierLevel::Durable => "durable",
        }
    }

    /// Tiers strictly faster than this one, fastest first.
    pub fn faster_tiers(&self) -> impl Iterator<Item = TierLevel> + use<> {
        let this = *self;
        Self::ALL.into_iter().filter(move |t| *t < this)
    }
}

impl std::fmt::Display for TierLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
