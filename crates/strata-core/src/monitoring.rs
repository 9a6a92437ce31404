//! Monitoring hook consumed by an external metrics collector.
//!
//! Components never talk to a metrics backend directly; they report through
//! a shared [`MonitoringHook`]. The server installs a Prometheus-backed
//! implementation, tests install [`CountingHook`].

use dashmap::DashMap;
use std::sync::Arc;

use crate::connection::ConnectionState;
use crate::events::{FeedId, SequenceToken};
use crate::tier::TierLevel;

/// Receiver for operational counters.
///
/// Every method has a no-op default so implementations only override what
/// they export. Implementations must be cheap and non-blocking.
pub trait MonitoringHook: Send + Sync {
    fn cache_hit(&self, _tier: TierLevel) {}

    fn cache_miss(&self, _tier: TierLevel) {}

    /// A tier could not be reached and was skipped or reported.
    fn tier_unavailable(&self, _tier: TierLevel) {}

    /// A write-back job exhausted its retries for `tier`.
    fn write_back_failed(&self, _key: &str, _tier: TierLevel, _error: &str) {}

    /// An event was routed to the dead-letter log.
    fn event_dead_lettered(&self, _feed: &FeedId, _token: &SequenceToken) {}

    fn connection_transition(&self, _from: ConnectionState, _to: ConnectionState) {}
}

/// Hook that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl MonitoringHook for NoopHook {}

impl NoopHook {
    pub fn shared() -> Arc<dyn MonitoringHook> {
        Arc::new(NoopHook)
    }
}

/// In-memory hook that counts every signal by name.
///
/// Counter names follow `"<signal>:<label>"`, e.g. `"hit:local"`,
/// `"write_back_failed:durable"`, `"transition:connected->closed"`.
#[derive(Debug, Default)]
pub struct CountingHook {
    counters: DashMap<String, u64>,
}

impl CountingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counters.get(name).map(|c| *c).unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut all: Vec<_> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort();
        all
    }

    fn bump(&self, name: String) {
        *self.counters.entry(name).or_insert(0) += 1;
    }
}

impl MonitoringHook for CountingHook {
    fn cache_hit(&self, tier: TierLevel) {
        self.bump(format!("hit:{tier}"));
    }

    fn cache_miss(&self, tier: TierLevel) {
        self.bump(format!("miss:{tier}"));
    }

    fn tier_unavailable(&self, tier: TierLevel) {
        self.bump(format!("tier_unavailable:{tier}"));
    }

    fn write_back_failed(&self, _key: &str, tier: TierLevel, _error: &str) {
        self.bump(format!("write_back_failed:{tier}"));
    }

    fn event_dead_lettered(&self, feed: &FeedId, _token: &SequenceToken) {
        self.bump(format!("dead_letter:{feed}"));
    }

    fn connection_transition(&self, from: ConnectionState, to: ConnectionState) {
        self.bump(format!("transition:{from}->{to}"));
    }
}
