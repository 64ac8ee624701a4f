//! Durable state contract
//!
//! The manager mirrors its authoritative state into whatever implements
//! [`StateStorage`]; a fresh instance seeds itself from the mirror on
//! start. Implementations must make `save_state` atomic with respect to
//! `load_state`: a reader sees either the previous snapshot or the new
//! one, never a torn write.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::{MemoryStorage, NoopStorage};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FlotillaError, Result};
use crate::manager::state::{RunnerAddress, ShardId};
use crate::SNAPSHOT_FORMAT_VERSION;

/// One registered runner as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRunner {
    pub host: String,
    pub port: u16,
    pub version: u64,
}

/// One shard slot as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedAssignment {
    pub shard: ShardId,
    pub owner: Option<RunnerAddress>,
}

/// The durable mirror of the manager's committed state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    /// Snapshot format, gated on load
    pub format: u32,
    /// The manager's monotonic commit counter at save time
    pub version: u64,
    /// Wall-clock save time, informational only
    pub saved_at: DateTime<Utc>,
    /// Fixed shard space; must match the manager's configuration
    pub total_shards: u32,
    pub runners: Vec<PersistedRunner>,
    pub assignments: Vec<PersistedAssignment>,
}

impl PersistedState {
    pub fn new(
        version: u64,
        total_shards: u32,
        runners: Vec<PersistedRunner>,
        assignments: Vec<PersistedAssignment>,
    ) -> Self {
        Self {
            format: SNAPSHOT_FORMAT_VERSION,
            version,
            saved_at: Utc::now(),
            total_shards,
            runners,
            assignments,
        }
    }

    /// Serialize to JSON
    ///
    /// Failure here is a bug in our own encoding, not a storage problem.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| FlotillaError::Internal {
            message: format!("snapshot serialization failed: {e}"),
        })
    }

    /// Deserialize from JSON
    ///
    /// A snapshot that does not decode is corrupt (persistence kind); a
    /// well-formed snapshot from a newer format is rejected fatally
    /// rather than guessing a migration.
    pub fn from_json(json: &str) -> Result<Self> {
        let state: Self = serde_json::from_str(json).map_err(|e| FlotillaError::SnapshotCorrupt {
            reason: format!("deserialization failed: {e}"),
        })?;
        if state.format > SNAPSHOT_FORMAT_VERSION {
            return Err(FlotillaError::SnapshotTooNew {
                format: state.format,
                supported: SNAPSHOT_FORMAT_VERSION,
            });
        }
        Ok(state)
    }
}

/// Storage backend contract
#[async_trait]
pub trait StateStorage: Send + Sync {
    /// Read the latest snapshot, or `None` for a fresh cluster
    async fn load_state(&self) -> Result<Option<PersistedState>>;

    /// Durably replace the snapshot; atomic with respect to `load_state`
    async fn save_state(&self, state: &PersistedState) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn json_roundtrip() {
        let state = PersistedState::new(
            17,
            8,
            vec![PersistedRunner {
                host: "10.0.0.1".into(),
                port: 7000,
                version: 2,
            }],
            vec![
                PersistedAssignment {
                    shard: 1,
                    owner: Some(RunnerAddress::new("10.0.0.1", 7000)),
                },
                PersistedAssignment {
                    shard: 2,
                    owner: None,
                },
            ],
        );

        let restored = PersistedState::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(restored.version, 17);
        assert_eq!(restored.runners, state.runners);
        assert_eq!(restored.assignments, state.assignments);
    }

    #[test]
    fn newer_format_rejected_as_invariant() {
        let mut state = PersistedState::new(1, 4, Vec::new(), Vec::new());
        state.format = SNAPSHOT_FORMAT_VERSION + 1;
        let json = serde_json::to_string(&state).unwrap();

        let err = PersistedState::from_json(&json).unwrap_err();
        assert!(matches!(err, FlotillaError::SnapshotTooNew { .. }));
        // Recovery from a future format must be fatal, not retried.
        assert_eq!(err.kind(), ErrorKind::Invariant);
        assert!(err.is_fatal());
    }

    #[test]
    fn undecodable_snapshot_is_persistence_kind() {
        let err = PersistedState::from_json("not json").unwrap_err();
        assert!(matches!(err, FlotillaError::SnapshotCorrupt { .. }));
        assert_eq!(err.kind(), ErrorKind::Persistence);
    }
}
