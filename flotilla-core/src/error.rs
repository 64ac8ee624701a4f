//! Error types for the shard manager
//!
//! Every failure the core distinguishes maps onto one of four kinds:
//! transient transport trouble, persistence trouble, invariant violations
//! (fatal), and client misuse (rejected, state unchanged).

use thiserror::Error;

use crate::manager::state::{RunnerAddress, ShardId};

/// Primary error type for all shard-manager operations
#[derive(Debug, Error)]
pub enum FlotillaError {
    // ========== Transport Errors ==========

    /// Health ping failed or timed out
    #[error("ping to {addr} failed: {reason}")]
    PingFailed { addr: RunnerAddress, reason: String },

    /// Connection to a remote endpoint failed
    #[error("connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The manager is shutting down and no longer accepts commands
    #[error("manager is shutting down")]
    ManagerShutdown,

    // ========== Persistence Errors ==========

    /// Writing the durable snapshot failed
    #[error("persisting snapshot version {version} failed: {reason}")]
    PersistFailed { version: u64, reason: String },

    /// A stored snapshot could not be decoded
    #[error("persisted snapshot is corrupt: {reason}")]
    SnapshotCorrupt { reason: String },

    // ========== Invariant Violations (fatal) ==========

    /// A well-formed snapshot from a newer format than this build supports
    #[error("persisted snapshot format {format} is newer than supported {supported}")]
    SnapshotTooNew { format: u32, supported: u32 },

    /// Shard id outside the configured `[1, N]` space
    #[error("shard {shard} outside configured space [1, {total}]")]
    ShardOutOfRange { shard: ShardId, total: u32 },

    /// Assignment targeted an address with no runner record
    #[error("shard {shard} assigned to unknown runner {addr}")]
    UnknownOwner { shard: ShardId, addr: RunnerAddress },

    /// An assignment would be overwritten without an intervening unassign
    #[error("shard {shard} already owned by {current}; refusing in-place overwrite")]
    AssignmentOverwrite { shard: ShardId, current: RunnerAddress },

    /// A vacate named an owner that does not match the assignment map
    #[error("shard {shard} owner mismatch: expected {expected}, map has {actual}")]
    OwnerMismatch {
        shard: ShardId,
        expected: RunnerAddress,
        actual: String,
    },

    /// Durable watermark regressed or repeated a commit version
    #[error("duplicate or regressing persisted version {version} (durable watermark {durable})")]
    DuplicateCommit { version: u64, durable: u64 },

    /// A recovered snapshot does not match the configured shard space
    #[error("snapshot shard space {snapshot} does not match configured {configured}")]
    SnapshotMismatch { snapshot: u32, configured: u32 },

    /// Internal error that should never occur
    #[error("internal error: {message}")]
    Internal { message: String },

    // ========== Client Misuse ==========

    /// Command referenced an address with no runner record
    #[error("runner {addr} is not registered")]
    RunnerNotRegistered { addr: RunnerAddress },

    /// Re-registration with a lower version than the current record
    #[error("runner {addr} version regressed: registered {current}, got {proposed}")]
    VersionRegression {
        addr: RunnerAddress,
        current: u64,
        proposed: u64,
    },

    /// Configuration rejected at startup
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// The four-way dispatch tag call sites branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Logged and retried per policy; never terminates the loop
    Transient,
    /// Logged and retried with backoff; rebalance pauses on backlog
    Persistence,
    /// Fatal: the manager stops accepting events and exits
    Invariant,
    /// Rejected with a typed error; state unchanged
    ClientMisuse,
}

impl FlotillaError {
    /// Classify this error for dispatch
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlotillaError::PingFailed { .. }
            | FlotillaError::ConnectionFailed { .. }
            | FlotillaError::ManagerShutdown => ErrorKind::Transient,

            FlotillaError::PersistFailed { .. } | FlotillaError::SnapshotCorrupt { .. } => {
                ErrorKind::Persistence
            }

            FlotillaError::SnapshotTooNew { .. }
            | FlotillaError::ShardOutOfRange { .. }
            | FlotillaError::UnknownOwner { .. }
            | FlotillaError::AssignmentOverwrite { .. }
            | FlotillaError::OwnerMismatch { .. }
            | FlotillaError::DuplicateCommit { .. }
            | FlotillaError::SnapshotMismatch { .. }
            | FlotillaError::Internal { .. } => ErrorKind::Invariant,

            FlotillaError::RunnerNotRegistered { .. }
            | FlotillaError::VersionRegression { .. }
            | FlotillaError::InvalidConfig { .. } => ErrorKind::ClientMisuse,
        }
    }

    /// Returns true if this error must terminate the control loop
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Invariant
    }
}

/// Result type alias for shard-manager operations
pub type Result<T> = std::result::Result<T, FlotillaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_dispatch() {
        let addr = RunnerAddress::new("10.0.0.1", 7000);
        assert_eq!(
            FlotillaError::RunnerNotRegistered { addr: addr.clone() }.kind(),
            ErrorKind::ClientMisuse
        );
        assert_eq!(
            FlotillaError::PingFailed {
                addr,
                reason: "timeout".into()
            }
            .kind(),
            ErrorKind::Transient
        );
        assert!(FlotillaError::ShardOutOfRange { shard: 9, total: 8 }.is_fatal());
        assert!(!FlotillaError::ManagerShutdown.is_fatal());
        // Corrupt snapshots are a persistence problem; a future-format
        // snapshot is a fatal recovery mismatch.
        assert_eq!(
            FlotillaError::SnapshotCorrupt { reason: "torn".into() }.kind(),
            ErrorKind::Persistence
        );
        assert!(FlotillaError::SnapshotTooNew { format: 2, supported: 1 }.is_fatal());
    }
}
