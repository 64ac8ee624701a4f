//! Assignment notification fan-out
//!
//! One bounded channel per subscribed runner. Streams open with a full
//! snapshot of the runner's shards; every commit that touches the runner
//! appends a delta, so the concatenated stream always reconstructs its
//! current assignment set. A full channel back-pressures the control
//! loop; a dropped receiver detaches the runner.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::manager::state::{Delta, RunnerAddress, ShardId};
use crate::metrics::standard::NOTIFICATIONS_SENT;

/// Message delivered on a runner's notification stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// Full current assignment set, sent when a stream attaches
    Snapshot {
        version: u64,
        shards: BTreeSet<ShardId>,
    },
    /// Per-commit difference
    Delta {
        version: u64,
        assigned: BTreeSet<ShardId>,
        revoked: BTreeSet<ShardId>,
    },
}

pub(crate) struct Notifier {
    channels: Mutex<HashMap<RunnerAddress, mpsc::Sender<Notification>>>,
    buffer: usize,
}

impl Notifier {
    pub fn new(buffer: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Open a stream for a runner, replacing any previous one
    ///
    /// The snapshot message is enqueued before the receiver is handed out,
    /// so it always precedes any delta for the same stream.
    pub fn attach(&self, addr: &RunnerAddress, snapshot: Notification) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(self.buffer);
        tx.try_send(snapshot)
            .expect("fresh notification channel has capacity");
        if self.channels.lock().insert(addr.clone(), tx).is_some() {
            debug!(runner = %addr, "replaced existing notification stream");
        }
        rx
    }

    /// Deliver a commit's delta to every affected, attached runner
    ///
    /// Sends block when a channel is full, back-pressuring the commit
    /// pipeline. Runners whose receiver is gone are detached; pending
    /// messages for them are dropped.
    pub async fn fanout(&self, version: u64, delta: &Delta) {
        for (addr, change) in delta.changes() {
            let sender = self.channels.lock().get(addr).cloned();
            let Some(sender) = sender else { continue };

            let message = Notification::Delta {
                version,
                assigned: change.assigned.clone(),
                revoked: change.revoked.clone(),
            };
            if sender.send(message).await.is_err() {
                debug!(runner = %addr, "notification stream disconnected, detaching");
                self.channels.lock().remove(addr);
            } else {
                NOTIFICATIONS_SENT.inc();
            }
        }
    }

    /// Close one runner's stream, dropping anything still queued
    pub fn close(&self, addr: &RunnerAddress) {
        self.channels.lock().remove(addr);
    }

    /// Close every stream; used during shutdown
    pub fn close_all(&self) {
        self.channels.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u16) -> RunnerAddress {
        RunnerAddress::new("runner", n)
    }

    #[tokio::test]
    async fn snapshot_precedes_deltas() {
        let notifier = Notifier::new(4);
        let mut rx = notifier.attach(
            &addr(1),
            Notification::Snapshot {
                version: 7,
                shards: BTreeSet::from([1, 2]),
            },
        );

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Notification::Snapshot { version: 7, .. }));
    }

    #[tokio::test]
    async fn detaches_on_dropped_receiver() {
        let notifier = Notifier::new(4);
        let rx = notifier.attach(
            &addr(1),
            Notification::Snapshot {
                version: 1,
                shards: BTreeSet::new(),
            },
        );
        drop(rx);

        let store = crate::manager::state::StateStore::new(4);
        store
            .add_runner(&addr(1), 1, tokio::time::Instant::now())
            .unwrap();
        let commit = store.apply_assignments(&[], &[(1, addr(1))]).unwrap().unwrap();
        notifier.fanout(commit.version, &commit.delta).await;
        assert!(notifier.channels.lock().is_empty());
    }
}
