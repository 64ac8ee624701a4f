//! Durable snapshot writer
//!
//! A dedicated task mirrors every committed state version into the
//! storage contract. Writes are sequential and in commit order with no
//! coalescing, so the persisted version sequence is strictly increasing
//! and gapless, and the durable copy is always a prefix of the in-memory
//! commit sequence. Failures retry with exponential backoff; each outcome
//! is reported back to the control loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::manager::control::Event;
use crate::metrics::standard::{PERSIST_DURATION, PERSIST_FAILURES};
use crate::storage::{PersistedState, StateStorage};

/// Commits waiting for the writer; a full queue blocks the next commit
pub(crate) const PERSIST_QUEUE_DEPTH: usize = 8;

/// Backoff ceiling for persist retries
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

pub(crate) struct PersistJob {
    pub state: PersistedState,
}

/// Spawn the persister task; the returned sender enqueues snapshots in
/// commit order, and dropping it drains the queue and stops the task
pub(crate) fn spawn(
    storage: Arc<dyn StateStorage>,
    feedback: mpsc::UnboundedSender<Event>,
    retry_backoff: Duration,
) -> (mpsc::Sender<PersistJob>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<PersistJob>(PERSIST_QUEUE_DEPTH);

    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let version = job.state.version;
            let mut delay = retry_backoff;
            loop {
                let started = tokio::time::Instant::now();
                match storage.save_state(&job.state).await {
                    Ok(()) => {
                        PERSIST_DURATION.observe(started.elapsed().as_secs_f64());
                        debug!(version, "snapshot persisted");
                        let _ = feedback.send(Event::Persisted { version });
                        break;
                    }
                    Err(e) => {
                        PERSIST_FAILURES.inc();
                        warn!(version, error = %e, "snapshot persist failed, backing off");
                        let _ = feedback.send(Event::PersistFailed { version });
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(MAX_RETRY_BACKOFF);
                    }
                }
            }
        }
        debug!("persister drained, exiting");
    });

    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn persists_in_commit_order_and_drains_on_drop() {
        let storage = Arc::new(MemoryStorage::new());
        let (feedback, mut events) = mpsc::unbounded_channel();
        let (tx, handle) = spawn(storage.clone(), feedback, Duration::from_millis(1));

        for version in 1..=3u64 {
            let state = PersistedState::new(version, 4, Vec::new(), Vec::new());
            tx.send(PersistJob { state }).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let stored = storage.load_state().await.unwrap().unwrap();
        assert_eq!(stored.version, 3);

        let mut seen = Vec::new();
        while let Ok(Event::Persisted { version }) = events.try_recv() {
            seen.push(version);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
