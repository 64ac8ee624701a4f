//! Flotilla Core - centralized shard-management control plane
//!
//! This crate partitions a fixed, integer-indexed shard space across a
//! dynamic fleet of stateless runners and keeps the assignment balanced,
//! healthy, and monotonic under churn. It provides:
//! - Versioned runner membership with health probing and eviction
//! - A pure, deterministic assignment and rebalance engine
//! - A single-consumer control loop with debounced rebalance rounds
//! - Durable state snapshots and per-runner assignment notifications

pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod transport;

pub use config::ManagerConfig;
pub use error::{ErrorKind, FlotillaError, Result};
pub use manager::{Manager, ManagerHandle};

/// Default commit-coalescing window for rebalance rounds, in milliseconds
pub const DEFAULT_REBALANCE_DEBOUNCE_MS: u64 = 300;

/// Default silence threshold before a runner is probed, in seconds
pub const DEFAULT_LIVENESS_THRESHOLD_SECS: u64 = 15;

/// Format version of the persisted state snapshot
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;
