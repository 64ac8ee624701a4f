//! Control loop
//!
//! Single-consumer event serializer. One worker drains the intake and
//! holds exclusive mutation authority over the state store; commits flow
//! to the persister and then the notifier before the next event is
//! processed, which is what keeps per-runner notification order equal to
//! commit order without holding the store lock across awaits.
//!
//! Rebalance rounds are debounced: the first trigger arms a timer,
//! further triggers within the window coalesce. A round vacates
//! overloaded runners, reassigns everything unassigned, and commits the
//! combined batch atomically. Rounds are deferred while the unpersisted
//! backlog exceeds its bound.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::error::{ErrorKind, FlotillaError, Result};
use crate::manager::engine;
use crate::manager::notifier::{Notification, Notifier};
use crate::manager::persister::PersistJob;
use crate::manager::prober::Prober;
use crate::manager::state::{Commit, RunnerAddress, StateStore};
use crate::metrics::standard::{
    ASSIGNED_SHARDS, DURABLE_VERSION, EVICTIONS, REBALANCE_DURATION, REBALANCE_ROUNDS,
    REGISTERED_RUNNERS, SHARD_MOVES, UNASSIGNED_SHARDS,
};

/// Capacity of the command intake; producers enqueue without blocking at
/// the event rates the manager is designed for
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Everything the loop serializes
#[derive(Debug)]
pub(crate) enum Event {
    Register {
        addr: RunnerAddress,
        version: u64,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Unregister {
        addr: RunnerAddress,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Heartbeat {
        addr: RunnerAddress,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    /// Attach a notification stream; routed through the loop so the
    /// initial snapshot is ordered against commits
    Subscribe {
        addr: RunnerAddress,
        reply: oneshot::Sender<Result<mpsc::Receiver<Notification>>>,
    },
    HealthTick,
    ProbeFailed {
        addr: RunnerAddress,
    },
    Persisted {
        version: u64,
    },
    PersistFailed {
        version: u64,
    },
}

fn reply(tx: Option<oneshot::Sender<Result<()>>>, result: Result<()>) {
    if let Some(tx) = tx {
        let _ = tx.send(result);
    }
}

pub(crate) struct ControlLoop {
    pub cfg: ManagerConfig,
    pub store: Arc<StateStore>,
    pub intake: mpsc::Receiver<Event>,
    pub feedback: mpsc::UnboundedReceiver<Event>,
    pub notifier: Arc<Notifier>,
    pub persister: mpsc::Sender<PersistJob>,
    pub prober: Prober,
    pub shutdown: broadcast::Receiver<()>,
    pub durable_version: u64,
    rebalance_at: Option<Instant>,
    rebalance_deferred: bool,
    draining: bool,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ManagerConfig,
        store: Arc<StateStore>,
        intake: mpsc::Receiver<Event>,
        feedback: mpsc::UnboundedReceiver<Event>,
        notifier: Arc<Notifier>,
        persister: mpsc::Sender<PersistJob>,
        prober: Prober,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let durable_version = store.commit_version();
        Self {
            cfg,
            store,
            intake,
            feedback,
            notifier,
            persister,
            prober,
            shutdown,
            durable_version,
            rebalance_at: None,
            rebalance_deferred: false,
            draining: false,
        }
    }

    /// Drain events until shutdown; a fatal invariant violation exits
    /// with the error after logging a diagnostic
    pub async fn run(mut self) -> Result<()> {
        loop {
            let deadline = self.rebalance_at.unwrap_or_else(Instant::now);
            let step = tokio::select! {
                _ = self.shutdown.recv() => break,
                ev = self.intake.recv() => match ev {
                    Some(ev) => self.handle(ev).await,
                    None => break,
                },
                ev = self.feedback.recv() => match ev {
                    Some(ev) => self.handle(ev).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if self.rebalance_at.is_some() => {
                    self.rebalance_at = None;
                    self.run_rebalance().await
                }
            };
            if let Err(e) = step {
                error!(error = %e, "invariant violated; manager stops accepting events");
                return Err(e);
            }
        }

        self.drain().await;
        Ok(())
    }

    /// Shutdown tail: apply already-enqueued events without starting new
    /// rebalance rounds, flush the persister, close all streams
    async fn drain(&mut self) {
        self.draining = true;
        self.rebalance_at = None;
        loop {
            let ev = match self.intake.try_recv() {
                Ok(ev) => ev,
                Err(_) => match self.feedback.try_recv() {
                    Ok(ev) => ev,
                    Err(_) => break,
                },
            };
            if let Err(e) = self.handle(ev).await {
                warn!(error = %e, "event dropped during shutdown drain");
                break;
            }
        }
        self.notifier.close_all();
        info!("control loop drained");
    }

    async fn handle(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Register {
                addr,
                version,
                reply: tx,
            } => {
                match self.store.add_runner(&addr, version, Instant::now()) {
                    Ok(Some(commit)) => {
                        info!(runner = %addr, version, "runner registered");
                        REGISTERED_RUNNERS.set(self.store.runner_count() as i64);
                        self.commit_pipeline(commit).await?;
                        self.schedule_rebalance();
                        reply(tx, Ok(()));
                    }
                    Ok(None) => reply(tx, Ok(())),
                    Err(e) => reply(tx, Err(e)),
                }
                Ok(())
            }
            Event::Unregister { addr, reply: tx } => {
                match self.unregister(&addr).await? {
                    Ok(()) => reply(tx, Ok(())),
                    Err(e) => reply(tx, Err(e)),
                }
                Ok(())
            }
            Event::Heartbeat { addr, reply: tx } => {
                let result = self.store.heartbeat(&addr, Instant::now());
                if let Err(e) = &result {
                    debug!(runner = %addr, error = %e, "heartbeat rejected");
                }
                reply(tx, result);
                Ok(())
            }
            Event::Subscribe { addr, reply: tx } => {
                let result = if self.store.is_registered(&addr) {
                    let snapshot = Notification::Snapshot {
                        version: self.store.commit_version(),
                        shards: self.store.assignments_for(&addr),
                    };
                    Ok(self.notifier.attach(&addr, snapshot))
                } else {
                    Err(FlotillaError::RunnerNotRegistered { addr })
                };
                let _ = tx.send(result);
                Ok(())
            }
            Event::HealthTick => {
                if self.draining {
                    return Ok(());
                }
                let candidates = self
                    .store
                    .probe_candidates(Instant::now(), self.cfg.liveness_threshold);
                if !candidates.is_empty() {
                    debug!(count = candidates.len(), "probing silent runners");
                    self.prober.dispatch(candidates);
                }
                Ok(())
            }
            Event::ProbeFailed { addr } => {
                match self.store.record_strike(&addr) {
                    Ok(strikes) => {
                        debug!(runner = %addr, strikes, "health strike recorded");
                        if strikes >= self.cfg.max_strikes {
                            warn!(runner = %addr, strikes, "evicting silent runner");
                            EVICTIONS.inc();
                            // Tolerates a concurrent unregister having won.
                            let _ = self.unregister(&addr).await?;
                        }
                    }
                    Err(_) => debug!(runner = %addr, "strike for unknown runner ignored"),
                }
                Ok(())
            }
            Event::Persisted { version } => {
                if version <= self.durable_version {
                    return Err(FlotillaError::DuplicateCommit {
                        version,
                        durable: self.durable_version,
                    });
                }
                self.durable_version = version;
                DURABLE_VERSION.set(version as i64);
                if self.rebalance_deferred && !self.backlogged() {
                    self.rebalance_deferred = false;
                    self.schedule_rebalance();
                }
                Ok(())
            }
            Event::PersistFailed { version } => {
                warn!(version, "persist failure reported; rebalance may pause");
                Ok(())
            }
        }
    }

    /// Remove a runner and unassign its shards in one commit; the outer
    /// `Result` carries fatal errors, the inner one client misuse
    async fn unregister(&mut self, addr: &RunnerAddress) -> Result<Result<()>> {
        match self.store.remove_runner(addr) {
            Ok(commit) => {
                info!(runner = %addr, "runner removed");
                self.notifier.close(addr);
                REGISTERED_RUNNERS.set(self.store.runner_count() as i64);
                self.commit_pipeline(commit).await?;
                self.schedule_rebalance();
                Ok(Ok(()))
            }
            Err(e) if e.kind() == ErrorKind::ClientMisuse => Ok(Err(e)),
            Err(e) => Err(e),
        }
    }

    fn schedule_rebalance(&mut self) {
        if self.draining {
            return;
        }
        if self.rebalance_at.is_none() {
            self.rebalance_at = Some(Instant::now() + self.cfg.rebalance_debounce);
        }
    }

    fn backlogged(&self) -> bool {
        self.store.commit_version() - self.durable_version > self.cfg.persist_backlog_bound
    }

    async fn run_rebalance(&mut self) -> Result<()> {
        if self.backlogged() {
            debug!(
                committed = self.store.commit_version(),
                durable = self.durable_version,
                "rebalance deferred until the persister catches up"
            );
            self.rebalance_deferred = true;
            return Ok(());
        }

        let started = Instant::now();
        let view = self.store.engine_view();
        let plan = engine::plan_rebalance(&view, self.cfg.move_budget, self.cfg.max_shards_per_runner);
        if plan.is_empty() {
            return Ok(());
        }

        let moves = plan.move_count();
        if let Some(commit) = self.store.apply_assignments(&plan.removes, &plan.adds)? {
            REBALANCE_ROUNDS.inc();
            SHARD_MOVES.inc_by(moves as u64);
            info!(
                version = commit.version,
                vacated = plan.removes.len(),
                assigned = plan.adds.len(),
                "rebalance round committed"
            );
            self.commit_pipeline(commit).await?;
            if plan.budget_exhausted {
                // The budget cut this round short; converge over further
                // debounced rounds.
                self.schedule_rebalance();
            }
        }
        REBALANCE_DURATION.observe(started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Hand a commit to the persister, then the notifier, in that order
    async fn commit_pipeline(&mut self, commit: Commit) -> Result<()> {
        let assigned = self.store.assigned_count() as i64;
        ASSIGNED_SHARDS.set(assigned);
        UNASSIGNED_SHARDS.set(self.store.total_shards() as i64 - assigned);

        let job = PersistJob {
            state: self.store.persisted_state(),
        };
        if self.persister.send(job).await.is_err() {
            // Persister gone outside shutdown means the mirror can no
            // longer follow the commit sequence.
            if !self.draining {
                return Err(FlotillaError::Internal {
                    message: "persister task terminated".into(),
                });
            }
            return Ok(());
        }
        if !self.draining {
            self.notifier.fanout(commit.version, &commit.delta).await;
        }
        Ok(())
    }
}
