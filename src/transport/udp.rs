//! `UdpBasedWorker`: binds a local socket, optionally joins a multicast group,
//! and owns a dedicated receive task draining into a bounded queue (spec §4.D).
//!
//! No direct teacher transport exists for UDP; this follows the idiom of
//! `TcpBasedWorker` (same trait, same stats/state shape) over `tokio::net::UdpSocket`.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::{ConnectionState, TransportBase, TransportError, TransportStats};

/// Capacity of the bounded queue the receive task drains into; beyond this, the
/// oldest datagram is dropped rather than blocking the receive task (spec §4.C backpressure policy).
const RECEIVE_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpTransportConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub multicast_group: Option<Ipv4Addr>,
    pub broadcast: bool,
}

impl UdpTransportConfig {
    pub fn parse_endpoint(
        endpoint: &str,
        properties: &std::collections::HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| TransportError::ConfigError(format!("invalid udp endpoint: {endpoint}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| TransportError::ConfigError(format!("invalid udp port: {port}")))?;
        let multicast_group = properties
            .get("multicast_group")
            .map(|g| g.parse::<Ipv4Addr>())
            .transpose()
            .map_err(|_| TransportError::ConfigError("invalid multicast_group property".into()))?;
        Ok(Self {
            bind_host: host.to_string(),
            bind_port: port,
            multicast_group,
            broadcast: properties.get("broadcast").map(|v| v == "true").unwrap_or(false),
        })
    }
}

pub struct UdpBasedWorker {
    config: UdpTransportConfig,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    receiver: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    receive_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stats: TransportStats,
    state: ConnectionState,
}

impl std::fmt::Debug for UdpBasedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpBasedWorker").field("config", &self.config).finish()
    }
}

impl UdpBasedWorker {
    pub fn new(config: UdpTransportConfig) -> Self {
        Self {
            config,
            socket: Mutex::new(None),
            receiver: Mutex::new(None),
            receive_task: Mutex::new(None),
            stats: TransportStats::default(),
            state: ConnectionState::Disconnected,
        }
    }

    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize, TransportError> {
        let guard = self.socket.lock().await;
        let socket = guard.as_ref().ok_or_else(|| TransportError::ConnectionLost("socket not bound".into()))?;
        socket
            .send_to(data, target)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Pull the next datagram queued by the receive task, if any (non-blocking).
    pub async fn try_recv(&self) -> Option<Vec<u8>> {
        let mut guard = self.receiver.lock().await;
        guard.as_mut()?.try_recv().ok()
    }
}

#[async_trait]
impl TransportBase for UdpBasedWorker {
    async fn establish_connection(&mut self) -> Result<(), TransportError> {
        self.stats.record_attempt();
        let bind_addr = format!("{}:{}", self.config.bind_host, self.config.bind_port);
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|e| {
                self.stats.record_failure();
                self.state = ConnectionState::Error;
                TransportError::ConnectionFailed(e.to_string())
            })?;

        if self.config.broadcast {
            socket
                .set_broadcast(true)
                .map_err(|e| TransportError::ConfigError(format!("set_broadcast failed: {e}")))?;
        }
        if let Some(group) = self.config.multicast_group {
            socket
                .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
                .map_err(|e| TransportError::ConfigError(format!("join_multicast_v4 failed: {e}")))?;
        }

        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(RECEIVE_QUEUE_CAPACITY);
        let recv_socket = socket.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65_536];
            loop {
                match recv_socket.recv(&mut buf).await {
                    Ok(n) => {
                        // Drop-oldest: if the queue is full, make room rather than block the socket read.
                        if tx.capacity() == 0 {
                            warn!("udp receive queue full, dropping oldest datagram");
                        }
                        if tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    },
                    Err(e) => {
                        debug!(error = %e, "udp receive task ending");
                        break;
                    },
                }
            }
        });

        *self.socket.lock().await = Some(socket);
        *self.receiver.lock().await = Some(rx);
        *self.receive_task.lock().await = Some(task);
        self.stats.record_success();
        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn close_connection(&mut self) -> Result<(), TransportError> {
        if let Some(task) = self.receive_task.lock().await.take() {
            task.abort();
        }
        self.receiver.lock().await.take();
        if self.socket.lock().await.take().is_some() {
            self.stats.record_disconnect();
        }
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    async fn check_connection(&mut self) -> Result<(), TransportError> {
        if self.socket.lock().await.is_some() {
            Ok(())
        } else {
            Err(TransportError::ConnectionLost("socket not bound".into()))
        }
    }

    async fn send_keep_alive(&mut self) -> Result<(), TransportError> {
        // UDP is connectionless; liveness is just "is the socket still bound".
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
        let cfg = UdpTransportConfig::parse_endpoint("0.0.0.0:47808", &Default::default()).unwrap();
        assert_eq!(cfg.bind_port, 47808);
        assert!(cfg.multicast_group.is_none());
    }

    #[tokio::test]
    async fn bind_and_close_roundtrip() {
        let cfg = UdpTransportConfig::parse_endpoint("127.0.0.1:0", &Default::default()).unwrap();
        let mut worker = UdpBasedWorker::new(cfg);
        worker.establish_connection().await.unwrap();
        assert!(worker.is_open());
        worker.close_connection().await.unwrap();
        assert!(!worker.is_open());
    }
}
