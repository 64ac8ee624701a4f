//! Health-ping transport contract
//!
//! The manager only needs `Ping(address) -> ok | fail` with a
//! caller-provided deadline. [`TcpPinger`] is the default binding; tests
//! substitute fakes.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::trace;

use crate::error::{FlotillaError, Result};
use crate::manager::state::RunnerAddress;

/// Liveness probe against a runner
#[async_trait]
pub trait Pinger: Send + Sync {
    /// Resolve `Ok` if the runner answered within the deadline
    async fn ping(&self, addr: &RunnerAddress, deadline: Duration) -> Result<()>;
}

/// Pings by opening (and immediately dropping) a TCP connection
pub struct TcpPinger;

#[async_trait]
impl Pinger for TcpPinger {
    async fn ping(&self, addr: &RunnerAddress, deadline: Duration) -> Result<()> {
        let target = (addr.host.as_str(), addr.port);
        match tokio::time::timeout(deadline, TcpStream::connect(target)).await {
            Ok(Ok(_stream)) => {
                trace!(runner = %addr, "ping ok");
                Ok(())
            }
            Ok(Err(e)) => Err(FlotillaError::PingFailed {
                addr: addr.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(FlotillaError::PingFailed {
                addr: addr.clone(),
                reason: format!("no answer within {deadline:?}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_reaches_listening_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr = RunnerAddress::new("127.0.0.1", port);

        TcpPinger
            .ping(&addr, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ping_fails_on_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let addr = RunnerAddress::new("127.0.0.1", port);
        let err = TcpPinger.ping(&addr, Duration::from_secs(1)).await;
        assert!(matches!(err, Err(FlotillaError::PingFailed { .. })));
    }
}
