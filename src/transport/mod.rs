//! Transport bases: the raw-endpoint half of `TcpBasedWorker`/`SerialBasedWorker`/`UdpBasedWorker`.
//!
//! Each base wraps `establish_connection`/`close_connection`/`check_connection`/
//! `send_keep_alive` so the transport step runs first (on close, last) and the
//! protocol-level step is left to the concrete worker (spec §4.D).

mod serial;
mod tcp;
mod udp;

pub use serial::{SerialBasedWorker, SerialTransportConfig};
pub use tcp::{TcpBasedWorker, TcpTransportConfig};
pub use udp::{UdpBasedWorker, UdpTransportConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-layer error, surfaced to the worker and translated into `WorkerError`.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("receive failed: {0}")]
    ReceiveFailed(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    ConfigError(String),
    #[error("io error: {0}")]
    IoError(String),
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

/// Connection state shared by all three transport bases (spec §4.D: "the two sources of truth
/// the controller correlates" — transport state and the driver's own `IsConnected`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Transport statistics, independent of (but correlated with) `DriverStatistics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub disconnections: u64,
}

impl TransportStats {
    pub fn record_attempt(&mut self) {
        self.connection_attempts += 1;
    }
    pub fn record_success(&mut self) {
        self.successful_connections += 1;
    }
    pub fn record_failure(&mut self) {
        self.failed_connections += 1;
    }
    pub fn record_disconnect(&mut self) {
        self.disconnections += 1;
    }
}

/// The raw-endpoint contract every transport base implements for its concrete worker.
#[async_trait]
pub trait TransportBase: Send + Sync + std::fmt::Debug {
    /// Open the socket/port/fd. Must be safe to retry without leaking resources.
    async fn establish_connection(&mut self) -> Result<(), TransportError>;

    /// Close the socket/port/fd. Idempotent.
    async fn close_connection(&mut self) -> Result<(), TransportError>;

    /// Zero-byte probe or equivalent liveness check; any error other than
    /// "not connected yet" marks the transport down.
    async fn check_connection(&mut self) -> Result<(), TransportError>;

    /// Lightweight keep-alive probe at the transport level.
    async fn send_keep_alive(&mut self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    fn stats(&self) -> TransportStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_stats_default_is_zeroed() {
        let s = TransportStats::default();
        assert_eq!(s.connection_attempts, 0);
        assert_eq!(s.successful_connections, 0);
    }

    #[test]
    fn transport_stats_record_roundtrip() {
        let mut s = TransportStats::default();
        s.record_attempt();
        s.record_success();
        assert_eq!(s.connection_attempts, 1);
        assert_eq!(s.successful_connections, 1);
    }
}
