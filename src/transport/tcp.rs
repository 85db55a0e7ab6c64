//! `TcpBasedWorker`: parses `host:port`, owns a non-blocking TCP socket with
//! configurable timeouts and optional `TCP_NODELAY`/keep-alive at the OS level.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ConnectionState, TransportBase, TransportError, TransportStats};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpTransportConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub tcp_nodelay: bool,
    pub keep_alive: bool,
}

impl TcpTransportConfig {
    /// Parse the `host:port` endpoint form spec §6 mandates, with `port` in `[1, 65535]`.
    pub fn parse_endpoint(endpoint: &str, timeout_ms: u64) -> Result<Self, TransportError> {
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| TransportError::ConfigError(format!("invalid tcp endpoint: {endpoint}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| TransportError::ConfigError(format!("invalid tcp port: {port}")))?;
        if port == 0 {
            return Err(TransportError::ConfigError("tcp port must be in [1, 65535]".into()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            connect_timeout_ms: timeout_ms,
            io_timeout_ms: timeout_ms,
            tcp_nodelay: true,
            keep_alive: true,
        })
    }
}

/// Transport base for TCP-speaking concrete workers (e.g. Modbus TCP).
#[derive(Debug)]
pub struct TcpBasedWorker {
    config: TcpTransportConfig,
    stream: Mutex<Option<TcpStream>>,
    stats: TransportStats,
    state: ConnectionState,
}

impl TcpBasedWorker {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config,
            stream: Mutex::new(None),
            stats: TransportStats::default(),
            state: ConnectionState::Disconnected,
        }
    }

    fn configure_socket(&self, stream: &TcpStream) -> Result<(), TransportError> {
        stream
            .set_nodelay(self.config.tcp_nodelay)
            .map_err(|e| TransportError::ConfigError(format!("set_nodelay failed: {e}")))?;
        if self.config.keep_alive {
            let sock_ref = SockRef::from(stream);
            let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
            sock_ref
                .set_tcp_keepalive(&keepalive)
                .map_err(|e| TransportError::ConfigError(format!("set_tcp_keepalive failed: {e}")))?;
        }
        Ok(())
    }

    pub async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| TransportError::ConnectionLost("not connected".into()))?;
        let timeout = Duration::from_millis(self.config.io_timeout_ms);
        match tokio::time::timeout(timeout, stream.write_all(data)).await {
            Ok(Ok(())) => Ok(data.len()),
            Ok(Err(e)) => Err(TransportError::SendFailed(e.to_string())),
            Err(_) => Err(TransportError::Timeout("send timed out".into())),
        }
    }

    pub async fn receive(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| TransportError::ConnectionLost("not connected".into()))?;
        let timeout = Duration::from_millis(self.config.io_timeout_ms);
        match tokio::time::timeout(timeout, stream.read(buf)).await {
            Ok(Ok(0)) => Err(TransportError::ConnectionLost("peer closed".into())),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            Err(_) => Err(TransportError::Timeout("receive timed out".into())),
        }
    }
}

#[async_trait]
impl TransportBase for TcpBasedWorker {
    async fn establish_connection(&mut self) -> Result<(), TransportError> {
        self.stats.record_attempt();
        let addr_str = format!("{}:{}", self.config.host, self.config.port);
        let addr: SocketAddr = tokio::net::lookup_host(&addr_str)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
            .next()
            .ok_or_else(|| TransportError::ConnectionFailed(format!("no address for {addr_str}")))?;

        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.stats.record_failure();
                self.state = ConnectionState::Error;
                return Err(TransportError::ConnectionFailed(e.to_string()));
            },
            Err(_) => {
                self.stats.record_failure();
                self.state = ConnectionState::Error;
                return Err(TransportError::Timeout(format!("connect to {addr_str} timed out")));
            },
        };

        self.configure_socket(&stream)?;
        *self.stream.lock().await = Some(stream);
        self.stats.record_success();
        self.state = ConnectionState::Connected;
        debug!(addr = %addr_str, "tcp transport connected");
        Ok(())
    }

    async fn close_connection(&mut self) -> Result<(), TransportError> {
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.shutdown().await;
            self.stats.record_disconnect();
        }
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    async fn check_connection(&mut self) -> Result<(), TransportError> {
        let guard = self.stream.lock().await;
        match guard.as_ref() {
            None => Err(TransportError::ConnectionLost("not connected".into())),
            Some(stream) => match stream.peek(&mut [0u8; 1]).await {
                Ok(0) => Err(TransportError::ConnectionLost("peer closed".into())),
                Ok(_) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
                Err(e) => {
                    warn!(error = %e, "tcp check_connection failed");
                    Err(TransportError::ConnectionLost(e.to_string()))
                },
            },
        }
    }

    async fn send_keep_alive(&mut self) -> Result<(), TransportError> {
        // OS-level keepalive is configured at connect time; a zero-byte check doubles as the probe.
        self.check_connection().await
    }

    fn is_open(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_endpoint_accepts_host_port() {
        let cfg = TcpTransportConfig::parse_endpoint("127.0.0.1:502", 2000).unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 502);
    }

    #[test]
    fn parse_endpoint_rejects_port_zero() {
        assert!(TcpTransportConfig::parse_endpoint("127.0.0.1:0", 2000).is_err());
    }

    #[test]
    fn parse_endpoint_rejects_missing_port() {
        assert!(TcpTransportConfig::parse_endpoint("127.0.0.1", 2000).is_err());
    }

    #[tokio::test]
    async fn fresh_worker_is_not_open() {
        let cfg = TcpTransportConfig::parse_endpoint("127.0.0.1:502", 2000).unwrap();
        let worker = TcpBasedWorker::new(cfg);
        assert!(!worker.is_open());
    }

    #[tokio::test]
    async fn connect_refused_reports_transient_error() {
        // Port 1 is privileged/unused in test sandboxes and should refuse immediately.
        let cfg = TcpTransportConfig::parse_endpoint("127.0.0.1:1", 500).unwrap();
        let mut worker = TcpBasedWorker::new(cfg);
        let result = worker.establish_connection().await;
        assert!(result.is_err());
        assert!(!worker.is_open());
    }
}
