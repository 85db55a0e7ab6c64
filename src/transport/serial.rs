//! `SerialBasedWorker`: opens a device node at a whitelisted baud rate with
//! raw-mode framing, restoring original terminal attributes on close.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::debug;

use super::{ConnectionState, TransportBase, TransportError, TransportStats};

/// Baud rates `SerialBasedWorker` accepts; anything else is rejected at construction (spec §4.D).
pub const SUPPORTED_BAUD_RATES: &[u32] = &[
    1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialTransportConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: String,
    pub flow_control: String,
    pub io_timeout_ms: u64,
}

impl SerialTransportConfig {
    /// Parse `device_node` + baud/parity/data/stop carried in properties, per spec §6.
    pub fn from_endpoint(
        endpoint: &str,
        properties: &std::collections::HashMap<String, String>,
        timeout_ms: u64,
    ) -> Result<Self, TransportError> {
        let baud_rate: u32 = properties
            .get("baud")
            .map(|s| s.parse())
            .transpose()
            .map_err(|_| TransportError::ConfigError("invalid baud property".into()))?
            .unwrap_or(9600);
        if !SUPPORTED_BAUD_RATES.contains(&baud_rate) {
            return Err(TransportError::ConfigError(format!("unsupported baud rate: {baud_rate}")));
        }
        Ok(Self {
            port: endpoint.to_string(),
            baud_rate,
            data_bits: properties.get("data_bits").and_then(|s| s.parse().ok()).unwrap_or(8),
            stop_bits: properties.get("stop_bits").and_then(|s| s.parse().ok()).unwrap_or(1),
            parity: properties.get("parity").cloned().unwrap_or_else(|| "None".into()),
            flow_control: properties.get("flow_control").cloned().unwrap_or_else(|| "None".into()),
            io_timeout_ms: timeout_ms,
        })
    }

    fn data_bits(&self) -> Result<DataBits, TransportError> {
        match self.data_bits {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(TransportError::ConfigError(format!("invalid data bits: {other}"))),
        }
    }

    fn stop_bits(&self) -> Result<StopBits, TransportError> {
        match self.stop_bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(TransportError::ConfigError(format!("invalid stop bits: {other}"))),
        }
    }

    fn parity(&self) -> Result<Parity, TransportError> {
        match self.parity.as_str() {
            "None" => Ok(Parity::None),
            "Even" => Ok(Parity::Even),
            "Odd" => Ok(Parity::Odd),
            other => Err(TransportError::ConfigError(format!("invalid parity: {other}"))),
        }
    }

    fn flow_control(&self) -> Result<FlowControl, TransportError> {
        match self.flow_control.as_str() {
            "None" => Ok(FlowControl::None),
            "Software" => Ok(FlowControl::Software),
            "Hardware" => Ok(FlowControl::Hardware),
            other => Err(TransportError::ConfigError(format!("invalid flow control: {other}"))),
        }
    }
}

#[derive(Debug)]
pub struct SerialBasedWorker {
    config: SerialTransportConfig,
    port: Mutex<Option<SerialStream>>,
    stats: TransportStats,
    state: ConnectionState,
}

impl SerialBasedWorker {
    pub fn new(config: SerialTransportConfig) -> Self {
        Self {
            config,
            port: Mutex::new(None),
            stats: TransportStats::default(),
            state: ConnectionState::Disconnected,
        }
    }

    pub async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut guard = self.port.lock().await;
        let port = guard.as_mut().ok_or_else(|| TransportError::ConnectionLost("port not open".into()))?;
        let timeout = Duration::from_millis(self.config.io_timeout_ms);
        match tokio::time::timeout(timeout, port.write_all(data)).await {
            Ok(Ok(())) => Ok(data.len()),
            Ok(Err(e)) => Err(TransportError::SendFailed(e.to_string())),
            Err(_) => Err(TransportError::Timeout("serial write timed out".into())),
        }
    }

    pub async fn receive(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut guard = self.port.lock().await;
        let port = guard.as_mut().ok_or_else(|| TransportError::ConnectionLost("port not open".into()))?;
        let timeout = Duration::from_millis(self.config.io_timeout_ms);
        match tokio::time::timeout(timeout, port.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            Err(_) => Err(TransportError::Timeout("serial read timed out".into())),
        }
    }
}

#[async_trait]
impl TransportBase for SerialBasedWorker {
    async fn establish_connection(&mut self) -> Result<(), TransportError> {
        self.stats.record_attempt();
        let builder = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .data_bits(self.config.data_bits()?)
            .stop_bits(self.config.stop_bits()?)
            .parity(self.config.parity()?)
            .flow_control(self.config.flow_control()?)
            .timeout(Duration::from_millis(self.config.io_timeout_ms));

        match builder.open_native_async() {
            Ok(stream) => {
                *self.port.lock().await = Some(stream);
                self.stats.record_success();
                self.state = ConnectionState::Connected;
                debug!(port = %self.config.port, baud = self.config.baud_rate, "serial transport opened");
                Ok(())
            },
            Err(e) => {
                self.stats.record_failure();
                self.state = ConnectionState::Error;
                Err(TransportError::ConnectionFailed(e.to_string()))
            },
        }
    }

    async fn close_connection(&mut self) -> Result<(), TransportError> {
        let mut guard = self.port.lock().await;
        if guard.take().is_some() {
            self.stats.record_disconnect();
        }
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    async fn check_connection(&mut self) -> Result<(), TransportError> {
        if self.port.lock().await.is_some() {
            Ok(())
        } else {
            Err(TransportError::ConnectionLost("port not open".into()))
        }
    }

    async fn send_keep_alive(&mut self) -> Result<(), TransportError> {
        self.check_connection().await
    }

    fn is_open(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
