//! Connection attempts and time sources.
//!
//! Guard selection only decides *which* guard to try; establishing the
//! connection is delegated to a [`Connector`]. Two are provided:
//!
//! | Connector | Use |
//! |-----------|-----|
//! | [`TcpConnector`] | live mode, a plain TCP reachability probe of the OR port |
//! | [`SimConnector`](crate::simulation::SimConnector) | the network simulation |
//!
//! Timestamps come from a [`Clock`] so the simulation can run on simulated
//! time while live mode uses the wall clock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

/// Result of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The guard answered.
    Connected,
    /// The connection was refused or failed.
    Failed,
    /// No answer before the deadline.
    TimedOut,
}

impl ConnectOutcome {
    /// Returns true for [`ConnectOutcome::Connected`].
    pub fn is_success(self) -> bool {
        self == ConnectOutcome::Connected
    }
}

/// Opens connections to guards.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Attempts to reach `fingerprint` at `addr` within `timeout`.
    async fn attempt_connect(
        &self,
        fingerprint: &str,
        addr: SocketAddr,
        timeout: Duration,
    ) -> ConnectOutcome;
}

/// TCP reachability probe.
///
/// Succeeds once the TCP handshake with the OR port completes. No TLS or
/// link protocol is spoken.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn attempt_connect(
        &self,
        fingerprint: &str,
        addr: SocketAddr,
        timeout: Duration,
    ) -> ConnectOutcome {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => ConnectOutcome::Connected,
            Ok(Err(e)) => {
                debug!(guard = fingerprint, %addr, error = %e, "connection failed");
                ConnectOutcome::Failed
            }
            Err(_) => ConnectOutcome::TimedOut,
        }
    }
}

/// Source of Unix timestamps.
pub trait Clock: Send + Sync {
    /// Current time in Unix seconds.
    fn now(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Manually advanced clock shared between the simulator and the manager.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now: Arc<AtomicI64>,
}

impl SimClock {
    /// Starts the clock at `start`.
    pub fn new(start: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start)),
        }
    }

    /// Moves time forward.
    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let outcome = TcpConnector
            .attempt_connect(&"A".repeat(40), addr, Duration::from_secs(5))
            .await;
        assert_eq!(outcome, ConnectOutcome::Connected);
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let outcome = TcpConnector
            .attempt_connect(&"A".repeat(40), addr, Duration::from_secs(5))
            .await;
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_sim_clock_is_shared() {
        let clock = SimClock::new(100);
        let other = clock.clone();
        clock.advance(4);
        assert_eq!(other.now(), 104);
    }

    #[test]
    fn test_system_clock_is_recent() {
        assert!(SystemClock.now() > 1_600_000_000);
    }
}
