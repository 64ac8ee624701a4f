//! Health prober
//!
//! A ticker drives `HealthTick` at a fixed interval; the control loop
//! answers with the set of probe candidates, which are pinged in parallel
//! under a concurrency bound. Outcomes re-enter the loop as `Heartbeat`
//! or `ProbeFailed` events. A failed ping is one strike; pings are never
//! retried within a tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::manager::control::Event;
use crate::manager::state::RunnerAddress;
use crate::transport::Pinger;

/// Spawn the ticker that emits `HealthTick` until shutdown
pub(crate) fn spawn_ticker(
    interval: Duration,
    feedback: mpsc::UnboundedSender<Event>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would race registration on startup.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if feedback.send(Event::HealthTick).is_err() {
                        break;
                    }
                }
            }
        }
        debug!("health ticker stopped");
    })
}

/// Dispatches bounded-parallel pings for one tick's candidates
pub(crate) struct Prober {
    pinger: Arc<dyn Pinger>,
    feedback: mpsc::UnboundedSender<Event>,
    permits: Arc<Semaphore>,
    ping_timeout: Duration,
}

impl Prober {
    pub fn new(
        pinger: Arc<dyn Pinger>,
        feedback: mpsc::UnboundedSender<Event>,
        concurrency: usize,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            pinger,
            feedback,
            permits: Arc::new(Semaphore::new(concurrency)),
            ping_timeout,
        }
    }

    /// Ping each candidate once, reporting the outcome as an event
    ///
    /// Returns immediately; pings run on spawned tasks gated by the
    /// concurrency semaphore. In-flight pings are simply abandoned at
    /// shutdown when the feedback channel closes.
    pub fn dispatch(&self, candidates: Vec<RunnerAddress>) {
        for addr in candidates {
            let pinger = self.pinger.clone();
            let feedback = self.feedback.clone();
            let permits = self.permits.clone();
            let deadline = self.ping_timeout;
            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                let event = match pinger.ping(&addr, deadline).await {
                    Ok(()) => Event::Heartbeat { addr, reply: None },
                    Err(e) => {
                        debug!(runner = %addr, error = %e, "health ping failed");
                        Event::ProbeFailed { addr }
                    }
                };
                let _ = feedback.send(event);
            });
        }
    }
}
