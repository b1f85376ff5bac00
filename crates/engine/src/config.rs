//! Tuning knobs for the engine.
//!
//! All values are plain data so a host can load them from a file; the CLI
//! reads them from TOML.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded exponential back-off for transient step failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. `0` is treated as `1`.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub base_delay_ms: u64,
    /// Upper bound for a single back-off delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Back-off to wait after `attempt` (1-based) failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of nodes executing concurrently within one run.
    pub max_in_flight: usize,
    /// Timeout for a single registry call, unless the node overrides it.
    pub step_timeout_ms: u64,
    /// How long in-flight nodes may keep running after cancellation.
    pub cancel_grace_ms: u64,
    /// Default retry policy for nodes without their own.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            step_timeout_ms: 30_000,
            cancel_grace_ms: 5_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// `max_in_flight`, never below one.
    pub fn parallelism(&self) -> usize {
        self.max_in_flight.max(1)
    }
}
