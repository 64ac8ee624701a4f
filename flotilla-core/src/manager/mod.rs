//! The shard manager: assembly and lifecycle
//!
//! [`Manager::start`] recovers durable state, spawns the persister, the
//! health ticker, and the control loop, and returns a [`Manager`] plus a
//! cloneable [`ManagerHandle`] for the runner-facing commands. Shutdown
//! cancels the prober first, then stops the loop, which drains the
//! intake, flushes the persister, and closes every notification stream.

pub mod engine;
pub mod state;

pub(crate) mod control;
mod notifier;
mod persister;
mod prober;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

use crate::config::ManagerConfig;
use crate::error::{FlotillaError, Result};
use crate::metrics::standard::REGISTERED_RUNNERS;
use crate::runtime::ShutdownSignal;
use crate::storage::StateStorage;
use crate::transport::Pinger;

use control::{ControlLoop, Event, EVENT_CHANNEL_CAPACITY};
use notifier::Notifier;
use prober::Prober;

pub use notifier::Notification;
pub use state::{Delta, RunnerAddress, RunnerDelta, RunnerRecord, ShardId, StateStore};

/// Cloneable command surface for the manager
///
/// Mutating commands round-trip the control loop; snapshot reads go
/// straight to the state store's read accessors.
#[derive(Clone)]
pub struct ManagerHandle {
    commands: mpsc::Sender<Event>,
    store: Arc<StateStore>,
}

impl ManagerHandle {
    async fn command(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> Event,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| FlotillaError::ManagerShutdown)?;
        rx.await.map_err(|_| FlotillaError::ManagerShutdown)?
    }

    /// Register a runner; idempotent on `(address, version)`
    pub async fn register(&self, addr: RunnerAddress, version: u64) -> Result<()> {
        self.command(|reply| Event::Register {
            addr,
            version,
            reply: Some(reply),
        })
        .await
    }

    /// Remove a runner and unassign its shards
    pub async fn unregister(&self, addr: RunnerAddress) -> Result<()> {
        self.command(|reply| Event::Unregister {
            addr,
            reply: Some(reply),
        })
        .await
    }

    /// Refresh a runner's heartbeat; rejected for unknown addresses
    pub async fn heartbeat(&self, addr: RunnerAddress) -> Result<()> {
        self.command(|reply| Event::Heartbeat {
            addr,
            reply: Some(reply),
        })
        .await
    }

    /// Open the runner's notification stream; the first message is a full
    /// snapshot of its current shards
    pub async fn subscribe(
        &self,
        addr: RunnerAddress,
    ) -> Result<mpsc::Receiver<Notification>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Event::Subscribe { addr, reply: tx })
            .await
            .map_err(|_| FlotillaError::ManagerShutdown)?;
        rx.await.map_err(|_| FlotillaError::ManagerShutdown)?
    }

    /// Snapshot of the full shard→owner map
    pub fn get_assignments(&self) -> BTreeMap<ShardId, Option<RunnerAddress>> {
        self.store.all_assignments()
    }

    /// Shards currently owned by one runner
    pub fn assignments_for(&self, addr: &RunnerAddress) -> BTreeSet<ShardId> {
        self.store.assignments_for(addr)
    }

    /// Snapshot of the registered runner records
    pub fn runners(&self) -> BTreeMap<RunnerAddress, RunnerRecord> {
        self.store.all_runners()
    }

    /// Monotonic commit counter of the in-memory authority
    pub fn commit_version(&self) -> u64 {
        self.store.commit_version()
    }
}

/// A running shard manager instance
pub struct Manager {
    handle: ManagerHandle,
    shutdown: ShutdownSignal,
    prober_shutdown: ShutdownSignal,
    loop_task: JoinHandle<Result<()>>,
    prober_task: JoinHandle<()>,
    persister_task: JoinHandle<()>,
}

impl Manager {
    /// Recover durable state and bring the control plane up
    ///
    /// `load_state` runs before the event intake opens; recovered runners
    /// are unverified until their first heartbeat and the prober starts
    /// pinging them on its first tick.
    pub async fn start(
        cfg: ManagerConfig,
        storage: Arc<dyn StateStorage>,
        pinger: Arc<dyn Pinger>,
    ) -> Result<Self> {
        cfg.validate()?;

        let store = Arc::new(StateStore::new(cfg.total_shards));
        match storage.load_state().await? {
            Some(snapshot) => {
                store.seed(&snapshot, Instant::now())?;
                info!(
                    version = snapshot.version,
                    runners = snapshot.runners.len(),
                    "recovered state from durable snapshot"
                );
            }
            None => info!(shards = cfg.total_shards, "no snapshot found, starting empty"),
        }
        REGISTERED_RUNNERS.set(store.runner_count() as i64);

        let (commands, intake) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();

        let (persist_tx, persister_task) =
            persister::spawn(storage, feedback_tx.clone(), cfg.persist_retry_backoff);

        let shutdown = ShutdownSignal::new();
        let prober_shutdown = ShutdownSignal::new();
        let prober_task = prober::spawn_ticker(
            cfg.probe_interval,
            feedback_tx.clone(),
            prober_shutdown.subscribe(),
        );
        let prober = Prober::new(pinger, feedback_tx, cfg.probe_concurrency, cfg.ping_timeout);

        let notifier = Arc::new(Notifier::new(cfg.notification_buffer));
        let control = ControlLoop::new(
            cfg,
            store.clone(),
            intake,
            feedback_rx,
            notifier,
            persist_tx,
            prober,
            shutdown.subscribe(),
        );
        let loop_task = tokio::spawn(async move {
            let result = control.run().await;
            if let Err(e) = &result {
                error!(error = %e, "control loop terminated");
            }
            result
        });

        Ok(Self {
            handle: ManagerHandle { commands, store },
            shutdown,
            prober_shutdown,
            loop_task,
            prober_task,
            persister_task,
        })
    }

    /// Command surface for embedding or serving
    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    /// Graceful shutdown: prober first, then the loop (drain + persist
    /// flush + stream close). In-flight pings are abandoned; no final
    /// rebalance is forced.
    pub async fn shutdown(self) -> Result<()> {
        self.prober_shutdown.shutdown();
        let _ = self.prober_task.await;

        self.shutdown.shutdown();
        let loop_result = match self.loop_task.await {
            Ok(r) => r,
            Err(join) => Err(FlotillaError::Internal {
                message: format!("control loop panicked: {join}"),
            }),
        };
        let _ = self.persister_task.await;
        loop_result
    }
}
