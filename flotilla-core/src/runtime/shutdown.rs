//! Graceful shutdown signalling
//!
//! Broadcast-based: every background task subscribes, the owner fires
//! once. Separate signals give the manager its ordered teardown (prober
//! before control loop).

use std::sync::Arc;

use tokio::sync::broadcast;

/// One-shot shutdown broadcaster
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<broadcast::Sender<()>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Fire the signal; subscribers' `recv()` resolves
    pub fn shutdown(&self) {
        let _ = self.sender.send(());
    }

    /// Obtain a receiver for a task that should observe shutdown
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
