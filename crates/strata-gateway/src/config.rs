//! Connection manager options.
//!
//! Durations are carried as milliseconds so the struct maps one to one onto
//! the `gateway` configuration section. The camelCase aliases match the
//! option names dashboard clients already use.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use strata_core::ExponentialBackoff;

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// A connection silent for longer than this is degraded.
    #[serde(default = "default_heartbeat_interval_ms", alias = "heartbeatIntervalMs")]
    pub heartbeat_interval_ms: u64,

    /// A connection silent for longer than this is closed.
    #[serde(default = "default_heartbeat_timeout_ms", alias = "heartbeatTimeoutMs")]
    pub heartbeat_timeout_ms: u64,

    /// Queue depth above which a connection is degraded.
    #[serde(default = "default_soft_queue_threshold", alias = "softQueueThreshold")]
    pub soft_queue_threshold: usize,

    /// Queue capacity. A publish that finds the queue full evicts the
    /// connection as a slow consumer.
    #[serde(default = "default_hard_queue_ceiling", alias = "hardQueueCeiling")]
    pub hard_queue_ceiling: usize,

    /// A single transport write slower than this degrades the connection.
    #[serde(default = "default_write_timeout_ms", alias = "writeTimeoutMs")]
    pub write_timeout_ms: u64,

    #[serde(default = "default_sweep_interval_ms", alias = "sweepIntervalMs")]
    pub sweep_interval_ms: u64,

    /// Publications repeating a dedupe key inside this window are dropped.
    #[serde(default = "default_dedupe_window_ms", alias = "dedupeWindowMs")]
    pub dedupe_window_ms: u64,

    #[serde(default = "default_dedupe_capacity", alias = "dedupeCapacity")]
    pub dedupe_capacity: u64,

    /// Reconnect hint for evicted clients, grown per recent eviction.
    #[serde(default = "default_reconnect_backoff", alias = "reconnectBackoff")]
    pub reconnect_backoff: ExponentialBackoff,

    /// How long an eviction counts towards a client's reconnect backoff.
    #[serde(default = "default_eviction_memory_ms", alias = "evictionMemoryMs")]
    pub eviction_memory_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    45_000
}

fn default_soft_queue_threshold() -> usize {
    64
}

fn default_hard_queue_ceiling() -> usize {
    256
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_dedupe_window_ms() -> u64 {
    60_000
}

fn default_dedupe_capacity() -> u64 {
    100_000
}

fn default_reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(60), u32::MAX)
}

fn default_eviction_memory_ms() -> u64 {
    300_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            soft_queue_threshold: default_soft_queue_threshold(),
            hard_queue_ceiling: default_hard_queue_ceiling(),
            write_timeout_ms: default_write_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            dedupe_window_ms: default_dedupe_window_ms(),
            dedupe_capacity: default_dedupe_capacity(),
            reconnect_backoff: default_reconnect_backoff(),
            eviction_memory_ms: default_eviction_memory_ms(),
        }
    }
}

impl GatewayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn dedupe_window(&self) -> Duration {
        Duration::from_millis(self.dedupe_window_ms)
    }

    pub fn eviction_memory(&self) -> Duration {
        Duration::from_millis(self.eviction_memory_ms)
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.hard_queue_ceiling == 0 {
            return Err(GatewayError::invalid_config("hard_queue_ceiling must be positive"));
        }
        if self.soft_queue_threshold >= self.hard_queue_ceiling {
            return Err(GatewayError::invalid_config(format!(
                "soft_queue_threshold ({}) must be below hard_queue_ceiling ({})",
                self.soft_queue_threshold, self.hard_queue_ceiling
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.sweep_interval_ms == 0 {
            return Err(GatewayError::invalid_config(
                "heartbeat_interval_ms and sweep_interval_ms must be positive",
            ));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(GatewayError::invalid_config(format!(
                "heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.write_timeout_ms == 0 {
            return Err(GatewayError::invalid_config("write_timeout_ms must be positive"));
        }
        Ok(())
    }
}
