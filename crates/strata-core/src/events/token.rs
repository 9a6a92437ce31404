//! Sequence tokens used to resume feed consumption.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Feed-specific, monotonically increasing watermark.
///
/// A token is a `(major, minor)` pair compared lexicographically. Plain
/// offsets use `minor = 0` and render as `"42-0"`; Redis stream ids
/// (`"1700000000000-3"`) map onto the pair directly. Parsing accepts both
/// `"42"` and `"42-0"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceToken {
    major: u64,
    minor: u64,
}

impl SequenceToken {
    pub const ZERO: SequenceToken = SequenceToken { major: 0, minor: 0 };

    pub fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    /// Token for a plain numeric offset.
    pub fn offset(offset: u64) -> Self {
        Self::new(offset, 0)
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> u64 {
        self.minor
    }

    /// Smallest token strictly greater than this one.
    pub fn successor(&self) -> Self {
        match self.minor.checked_add(1) {
            Some(minor) => Self::new(self.major, minor),
            None => Self::new(self.major.saturating_add(1), 0),
        }
    }

    pub fn is_after(&self, other: &SequenceToken) -> bool {
        self > other
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.major, self.minor)
    }
}

impl FromStr for SequenceToken {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (major, minor) = match s.split_once('-') {
            Some((major, minor)) => (major, minor),
            None => (s, "0"),
        };
        let major = major
            .parse::<u64>()
            .map_err(|_| CoreError::invalid_token(s))?;
        let minor = minor
            .parse::<u64>()
            .map_err(|_| CoreError::invalid_token(s))?;
        Ok(Self::new(major, minor))
    }
}

impl Serialize for SequenceToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SequenceToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
