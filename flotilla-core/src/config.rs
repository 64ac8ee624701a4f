//! Manager configuration
//!
//! All tunables recognized by the core. The embedding binary maps its own
//! surface (env vars, flags) onto this struct; the core mandates neither.

use std::time::Duration;

use crate::error::{FlotillaError, Result};
use crate::{DEFAULT_LIVENESS_THRESHOLD_SECS, DEFAULT_REBALANCE_DEBOUNCE_MS};

/// Configuration for a [`Manager`](crate::manager::Manager) instance
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Fixed shard count N; shard ids live in `[1, N]`. Immutable after
    /// bootstrap.
    pub total_shards: u32,
    /// Commit-coalescing window for rebalance rounds
    pub rebalance_debounce: Duration,
    /// Silence after which a runner becomes probe-eligible
    pub liveness_threshold: Duration,
    /// Interval between health ticks
    pub probe_interval: Duration,
    /// Deadline for a single health ping
    pub ping_timeout: Duration,
    /// Maximum pings in flight per tick
    pub probe_concurrency: usize,
    /// Consecutive failed pings before eviction
    pub max_strikes: u32,
    /// Starting backoff for persister retries (doubles per attempt)
    pub persist_retry_backoff: Duration,
    /// Per-runner notification channel capacity
    pub notification_buffer: usize,
    /// Maximum shards vacated per rebalance round
    pub move_budget: usize,
    /// Rebalance pauses while unpersisted commits exceed this bound
    pub persist_backlog_bound: u64,
    /// Optional hard cap on shards per runner; `None` means unbounded
    pub max_shards_per_runner: Option<u32>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            total_shards: 1024,
            rebalance_debounce: Duration::from_millis(DEFAULT_REBALANCE_DEBOUNCE_MS),
            liveness_threshold: Duration::from_secs(DEFAULT_LIVENESS_THRESHOLD_SECS),
            probe_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(2),
            probe_concurrency: 16,
            max_strikes: 3,
            persist_retry_backoff: Duration::from_millis(500),
            notification_buffer: 64,
            move_budget: 256,
            persist_backlog_bound: 1,
            max_shards_per_runner: None,
        }
    }
}

impl ManagerConfig {
    /// Reject configurations the manager cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.total_shards == 0 {
            return Err(FlotillaError::InvalidConfig {
                reason: "total_shards must be at least 1".into(),
            });
        }
        if self.probe_concurrency == 0 {
            return Err(FlotillaError::InvalidConfig {
                reason: "probe_concurrency must be at least 1".into(),
            });
        }
        if self.max_strikes == 0 {
            return Err(FlotillaError::InvalidConfig {
                reason: "max_strikes must be at least 1".into(),
            });
        }
        if let Some(cap) = self.max_shards_per_runner {
            if cap == 0 {
                return Err(FlotillaError::InvalidConfig {
                    reason: "max_shards_per_runner of 0 would strand every shard".into(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ManagerConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_shards_rejected() {
        let cfg = ManagerConfig {
            total_shards: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
