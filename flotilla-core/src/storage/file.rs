//! File-backed snapshot storage
//!
//! Writes go to a sibling temp file and replace the snapshot with an
//! atomic rename, so `load_state` never observes a torn write.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{PersistedState, StateStorage};
use crate::error::{FlotillaError, Result};

pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn staging_path(&self) -> PathBuf {
        let mut staging = self.path.clone();
        staging.as_mut_os_string().push(".tmp");
        staging
    }
}

#[async_trait]
impl StateStorage for FileStorage {
    async fn load_state(&self) -> Result<Option<PersistedState>> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(FlotillaError::PersistFailed {
                    version: 0,
                    reason: format!("reading {}: {e}", self.path.display()),
                });
            }
        };
        PersistedState::from_json(&json).map(Some)
    }

    async fn save_state(&self, state: &PersistedState) -> Result<()> {
        let staging = self.staging_path();
        let io_err = |e: std::io::Error| FlotillaError::PersistFailed {
            version: state.version,
            reason: e.to_string(),
        };

        tokio::fs::write(&staging, state.to_json()?)
            .await
            .map_err(io_err)?;
        tokio::fs::rename(&staging, &self.path).await.map_err(io_err)?;
        debug!(version = state.version, path = %self.path.display(), "snapshot written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_fresh_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("state.json"));
        assert!(storage.load_state().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("state.json"));

        let state = PersistedState::new(5, 16, Vec::new(), Vec::new());
        storage.save_state(&state).await.unwrap();
        let loaded = storage.load_state().await.unwrap().unwrap();
        assert_eq!(loaded.version, 5);
        assert_eq!(loaded.total_shards, 16);

        // Overwrite replaces, never appends
        let state = PersistedState::new(6, 16, Vec::new(), Vec::new());
        storage.save_state(&state).await.unwrap();
        assert_eq!(storage.load_state().await.unwrap().unwrap().version, 6);
    }

    #[tokio::test]
    async fn corrupt_file_surfaces_as_snapshot_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let storage = FileStorage::new(path);
        assert!(matches!(
            storage.load_state().await,
            Err(FlotillaError::SnapshotCorrupt { .. })
        ));
    }
}
