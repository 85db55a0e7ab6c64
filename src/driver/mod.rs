//! Protocol driver contract (spec §4.A) and the one reference driver this
//! crate ships (`ModbusTcpDriver`) to exercise it end to end.

mod modbus_tcp;

pub use modbus_tcp::ModbusTcpDriver;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::{DataPoint, DriverStatistics, PointValue, ProtocolTag, TimestampedValue};

/// Driver lifecycle status, per spec §4.A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverStatus {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverErrorKind {
    #[default]
    Configuration,
    Transient,
    Protocol,
    Data,
    Resource,
}

/// Structured last-error record: code, message, occurred_at, optional context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverError {
    pub kind_code: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub context: Option<String>,
    #[serde(skip)]
    pub kind: DriverErrorKind,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        let kind_code = match kind {
            DriverErrorKind::Configuration => "CONFIGURATION",
            DriverErrorKind::Transient => "TRANSIENT",
            DriverErrorKind::Protocol => "PROTOCOL",
            DriverErrorKind::Data => "DATA",
            DriverErrorKind::Resource => "RESOURCE",
        }
        .to_string();
        Self {
            kind_code,
            message: message.into(),
            occurred_at: Utc::now(),
            context: None,
            kind,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind_code, self.message)
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Uniform connect/read/write/keep-alive contract every concrete worker binds
/// exactly one instance of (spec §4.A).
///
/// Ordering guarantee: `read_values` calls for one instance are serialized by
/// the caller (the worker); the driver need not be thread-safe across
/// reads/writes but must tolerate concurrent status reads.
#[async_trait]
pub trait ProtocolDriver: Send + Sync + std::fmt::Debug {
    /// Idempotent: calling twice must not leak resources or double-register state.
    async fn initialize(&mut self, device_properties: &HashMap<String, String>) -> DriverResult<()>;

    /// Safe to retry after `initialize` without leaking resources.
    async fn connect(&mut self) -> DriverResult<()>;

    async fn disconnect(&mut self) -> DriverResult<()>;

    async fn is_connected(&self) -> bool;

    /// Atomic at the call site: either a full vector (one sample per requested
    /// point, possibly bad-quality) or an error leaving no partial output.
    async fn read_values(&mut self, points: &[DataPoint]) -> DriverResult<Vec<TimestampedValue>>;

    /// Fails with a typed error when the point is not writable or the value
    /// does not fit the point's data type.
    async fn write_value(&mut self, point: &DataPoint, value: PointValue) -> DriverResult<()>;

    fn protocol_type(&self) -> ProtocolTag;

    fn status(&self) -> DriverStatus;

    fn last_error(&self) -> Option<DriverError>;

    fn statistics(&self) -> DriverStatistics;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_display_includes_kind_code() {
        let err = DriverError::new(DriverErrorKind::Transient, "refused");
        assert!(err.to_string().contains("TRANSIENT"));
        assert!(err.to_string().contains("refused"));
    }
}
