//! Prometheus metrics for Strata.
//!
//! [`PrometheusHook`] turns monitoring events from the cache, the ingestion
//! layer and the gateway into counters. Gauges are refreshed on scrape.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Arc, OnceLock};
use strata_core::{ConnectionState, FeedId, MonitoringHook, SequenceToken, TierLevel};
use strata_gateway::GatewayStats;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "strata_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "strata_cache_misses_total";
    pub const TIER_UNAVAILABLE_TOTAL: &str = "strata_tier_unavailable_total";
    pub const WRITE_BACK_FAILURES_TOTAL: &str = "strata_write_back_failures_total";
    pub const DEAD_LETTERS_TOTAL: &str = "strata_dead_letters_total";
    pub const CONNECTION_TRANSITIONS_TOTAL: &str = "strata_connection_transitions_total";

    pub const GATEWAY_CONNECTIONS: &str = "strata_gateway_connections";
    pub const GATEWAY_DEGRADED_CONNECTIONS: &str = "strata_gateway_degraded_connections";
    pub const GATEWAY_TOPICS: &str = "strata_gateway_topics";
    pub const CACHE_LOCAL_ENTRIES: &str = "strata_cache_local_entries";
}

/// Install the Prometheus recorder. Returns `false` if it was already
/// installed or installation failed.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics renders from the handle.
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format, `None` before
/// [`init_metrics`].
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

pub fn record_gateway_stats(stats: &GatewayStats) {
    gauge!(names::GATEWAY_CONNECTIONS).set(stats.connections as f64);
    gauge!(names::GATEWAY_DEGRADED_CONNECTIONS).set(stats.degraded as f64);
    gauge!(names::GATEWAY_TOPICS).set(stats.topics as f64);
}

pub fn record_local_entries(entries: usize) {
    gauge!(names::CACHE_LOCAL_ENTRIES).set(entries as f64);
}

/// [`MonitoringHook`] backed by the `metrics` facade.
#[derive(Debug, Default)]
pub struct PrometheusHook;

impl PrometheusHook {
    pub fn shared() -> Arc<dyn MonitoringHook> {
        Arc::new(PrometheusHook)
    }
}

impl MonitoringHook for PrometheusHook {
    fn cache_hit(&self, tier: TierLevel) {
        counter!(names::CACHE_HITS_TOTAL, "tier" => tier.as_str()).increment(1);
    }

    fn cache_miss(&self, tier: TierLevel) {
        counter!(names::CACHE_MISSES_TOTAL, "tier" => tier.as_str()).increment(1);
    }

    fn tier_unavailable(&self, tier: TierLevel) {
        counter!(names::TIER_UNAVAILABLE_TOTAL, "tier" => tier.as_str()).increment(1);
    }

    fn write_back_failed(&self, key: &str, tier: TierLevel, error: &str) {
        tracing::debug!(key, %tier, error, "write-back delivery failed");
        counter!(names::WRITE_BACK_FAILURES_TOTAL, "tier" => tier.as_str()).increment(1);
    }

    fn event_dead_lettered(&self, feed: &FeedId, _token: &SequenceToken) {
        counter!(names::DEAD_LETTERS_TOTAL, "feed" => feed.as_str().to_string()).increment(1);
    }

    fn connection_transition(&self, from: ConnectionState, to: ConnectionState) {
        counter!(
            names::CONNECTION_TRANSITIONS_TOTAL,
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
    }
}
