//! Access-frequency based TTL extension.
//!
//! Every lookup records an access. Keys accessed at least `hot_threshold`
//! times within the sliding `window` are considered hot and their TTL is
//! stretched:
//!
//! ```text
//! ttl = min(base * (1 + (freq - hot_threshold + 1) * extension_step), max_ttl)
//! ```
//!
//! Colder keys keep the base TTL.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Cap on remembered accesses per key; frequencies above it saturate.
const MAX_SAMPLES_PER_KEY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveTtlConfig {
    pub enabled: bool,
    pub window: Duration,
    pub hot_threshold: u32,
    pub extension_step: f64,
    pub max_ttl: Duration,
    /// Tracking stops for new keys beyond this many tracked keys.
    pub max_tracked_keys: usize,
}

impl Default for AdaptiveTtlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            hot_threshold: 10,
            extension_step: 0.5,
            max_ttl: Duration::from_secs(3600),
            max_tracked_keys: 100_000,
        }
    }
}

pub struct AdaptiveTtl {
    config: AdaptiveTtlConfig,
    accesses: DashMap<String, VecDeque<Instant>>,
}

impl AdaptiveTtl {
    pub fn new(config: AdaptiveTtlConfig) -> Self {
        Self {
            config,
            accesses: DashMap::new(),
        }
    }

    pub fn config(&self) -> &AdaptiveTtlConfig {
        &self.config
    }

    pub fn record_access(&self, key: &str) {
        if !self.config.enabled {
            return;
        }
        let now = Instant::now();

        if let Some(mut samples) = self.accesses.get_mut(key) {
            push_sample(&mut samples, now, self.config.window);
            return;
        }
        if self.accesses.len() >= self.config.max_tracked_keys {
            self.prune();
            if self.accesses.len() >= self.config.max_tracked_keys {
                return;
            }
        }
        let mut samples = self.accesses.entry(key.to_string()).or_default();
        push_sample(&mut samples, now, self.config.window);
    }

    /// Accesses to `key` inside the current window.
    pub fn frequency(&self, key: &str) -> u32 {
        let Some(mut samples) = self.accesses.get_mut(key) else {
            return 0;
        };
        evict_older_than(&mut samples, Instant::now(), self.config.window);
        samples.len() as u32
    }

    /// TTL to apply to `key` given the caller's base TTL.
    pub fn ttl_for(&self, key: &str, base: Duration) -> Duration {
        if !self.config.enabled {
            return base;
        }
        let freq = self.frequency(key);
        if freq < self.config.hot_threshold {
            return base;
        }

        let multiplier =
            1.0 + f64::from(freq - self.config.hot_threshold + 1) * self.config.extension_step;
        let extended = base.mul_f64(multiplier.max(1.0));
        extended.min(self.config.max_ttl.max(base))
    }

    pub fn forget(&self, key: &str) {
        self.accesses.remove(key);
    }

    pub fn tracked_keys(&self) -> usize {
        self.accesses.len()
    }

    /// Drop keys with no access inside the window.
    pub fn prune(&self) {
        let now = Instant::now();
        let window = self.config.window;
        self.accesses.retain(|_, samples| {
            evict_older_than(samples, now, window);
            !samples.is_empty()
        });
    }
}

fn evict_older_than(samples: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = samples.front() {
        if now.duration_since(*oldest) > window {
            samples.pop_front();
        } else {
            break;
        }
    }
}

fn push_sample(samples: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    evict_older_than(samples, now, window);
    if samples.len() >= MAX_SAMPLES_PER_KEY {
        samples.pop_front();
    }
    samples.push_back(now);
}
