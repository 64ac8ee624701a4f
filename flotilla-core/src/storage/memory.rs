//! In-memory and no-op snapshot storage

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{PersistedState, StateStorage};
use crate::error::Result;

/// Keeps the latest snapshot in memory; survives manager restarts within
/// a process, which is what the recovery tests exercise
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<Option<PersistedState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStorage for MemoryStorage {
    async fn load_state(&self) -> Result<Option<PersistedState>> {
        Ok(self.state.lock().clone())
    }

    async fn save_state(&self, state: &PersistedState) -> Result<()> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }
}

/// Discards every snapshot; for ephemeral clusters
#[derive(Default)]
pub struct NoopStorage;

impl NoopStorage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StateStorage for NoopStorage {
    async fn load_state(&self) -> Result<Option<PersistedState>> {
        Ok(None)
    }

    async fn save_state(&self, _state: &PersistedState) -> Result<()> {
        Ok(())
    }
}
