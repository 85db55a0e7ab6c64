//! Core data model: device/point configuration, emitted samples, and worker state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol tag a device is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolTag {
    ModbusTcp,
    ModbusRtu,
    Mqtt,
    BacnetIp,
    OpcUa,
    Ble,
    HttpRest,
    Custom,
}

impl ProtocolTag {
    /// Case-insensitive parse, as `WorkerFactory::CreateWorker` requires.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "modbus_tcp" | "modbustcp" => Some(Self::ModbusTcp),
            "modbus_rtu" | "modbusrtu" => Some(Self::ModbusRtu),
            "mqtt" => Some(Self::Mqtt),
            "bacnet_ip" | "bacnetip" => Some(Self::BacnetIp),
            "opc_ua" | "opcua" => Some(Self::OpcUa),
            "ble" => Some(Self::Ble),
            "http_rest" | "httprest" => Some(Self::HttpRest),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Configuration snapshot a worker runs against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_key: u64,
    pub name: String,
    pub protocol: ProtocolTag,
    pub endpoint: String,
    pub enabled: bool,
    pub polling_interval_ms: u64,
    pub timeout_ms: u64,
    pub retry_count: u32,
    pub properties: HashMap<String, String>,
}

impl DeviceInfo {
    /// Invariant check per spec §3: polling_interval >= 1, timeout >= 1, retry >= 0 (always true for u32).
    pub fn validate(&self) -> Result<(), String> {
        if self.polling_interval_ms < 1 {
            return Err("polling_interval_ms must be >= 1".into());
        }
        if self.timeout_ms < 1 {
            return Err("timeout_ms must be >= 1".into());
        }
        Ok(())
    }
}

/// Semantic data type of a point's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    I8,
    I16,
    I32,
    U8,
    U16,
    U32,
    F32,
    F64,
    String,
    Bytes,
}

impl DataType {
    pub fn is_numeric(self) -> bool {
        !matches!(self, DataType::String | DataType::Bytes | DataType::Bool)
    }
}

/// Linear scaling applied to a raw numeric reading: `value = raw * factor + offset`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Scaling {
    pub factor: f64,
    pub offset: f64,
}

impl Default for Scaling {
    fn default() -> Self {
        Self { factor: 1.0, offset: 0.0 }
    }
}

/// A single logical readable/writable signal on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPoint {
    pub id: String,
    pub device_id: String,
    pub name: String,
    /// Protocol-specific transport address (e.g. Modbus register number), free-form.
    pub address: String,
    pub data_type: DataType,
    pub writable: bool,
    pub scan_interval_override_ms: Option<u64>,
    pub scaling: Scaling,
    pub range_min: f64,
    pub range_max: f64,
    pub deadband: f64,
    pub unit: String,
}

impl DataPoint {
    /// Invariant per spec §3: max >= min.
    pub fn validate(&self) -> Result<(), String> {
        if self.range_max < self.range_min {
            return Err(format!(
                "point {}: range_max ({}) < range_min ({})",
                self.id, self.range_max, self.range_min
            ));
        }
        Ok(())
    }
}

/// Quality tag attached to every emitted sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
    CommFailure,
    LastKnown,
}

/// Tagged-union value matching a point's `DataType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PointValue {
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl PointValue {
    /// Numeric distance used for deadband comparisons; `None` for non-numeric variants.
    pub fn numeric(&self) -> Option<f64> {
        match self {
            PointValue::I64(v) => Some(*v as f64),
            PointValue::U64(v) => Some(*v as f64),
            PointValue::F64(v) => Some(*v),
            _ => None,
        }
    }
}

/// The emission quantum: one sampled value with quality, sequence, and change detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedValue {
    pub point_id: String,
    pub value: PointValue,
    pub quality: Quality,
    pub sequence: u64,
    pub captured_at_ms: i64,
    pub changed: bool,
}

/// Per-worker supervision policy for the reconnect controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectionSettings {
    pub auto_reconnect: bool,
    pub retry_interval_ms: u64,
    pub max_retries_per_cycle: u32,
    pub wait_time_after_max_retries_ms: u64,
    pub keep_alive_enabled: bool,
    pub keep_alive_interval_s: u64,
    pub connection_timeout_s: u64,
}

impl ReconnectionSettings {
    /// `UpdateReconnectionSettings` rejects non-positive intervals.
    pub fn validate(&self) -> Result<(), String> {
        if self.retry_interval_ms == 0 {
            return Err("retry_interval_ms must be > 0".into());
        }
        if self.wait_time_after_max_retries_ms == 0 {
            return Err("wait_time_after_max_retries_ms must be > 0".into());
        }
        if self.keep_alive_enabled && self.keep_alive_interval_s == 0 {
            return Err("keep_alive_interval_s must be > 0 when keep-alive is enabled".into());
        }
        if self.connection_timeout_s == 0 {
            return Err("connection_timeout_s must be > 0".into());
        }
        Ok(())
    }
}

impl Default for ReconnectionSettings {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            retry_interval_ms: 1_000,
            max_retries_per_cycle: 3,
            wait_time_after_max_retries_ms: 5_000,
            keep_alive_enabled: true,
            keep_alive_interval_s: 30,
            connection_timeout_s: 5,
        }
    }
}

/// Worker lifecycle/error/operational/reconnect state, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    // lifecycle
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
    // error
    Error,
    DeviceOffline,
    CommunicationError,
    DataInvalid,
    SensorFault,
    // operational
    Maintenance,
    Simulation,
    Calibration,
    Commissioning,
    ManualOverride,
    EmergencyStop,
    BypassMode,
    DiagnosticMode,
    // reconnect
    Reconnecting,
    WaitingRetry,
    MaxRetriesExceeded,
    Unknown,
}

impl Default for WorkerState {
    fn default() -> Self {
        WorkerState::Stopped
    }
}

/// A state transition record, timestamped for observability (spec §3: "every transition is timestamped").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: WorkerState,
    pub to: WorkerState,
    pub at: DateTime<Utc>,
}

/// Per-driver counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverStatistics {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub timeouts: u64,
    pub exceptions: u64,
    pub reconnects: u64,
    pub avg_response_time_ms: f64,
    pub last_operation_at: Option<DateTime<Utc>>,
}

impl DriverStatistics {
    pub fn record_operation(&mut self, elapsed_ms: f64, outcome: OperationOutcome) {
        self.total_operations += 1;
        self.last_operation_at = Some(Utc::now());
        match outcome {
            OperationOutcome::Success => self.successful_operations += 1,
            OperationOutcome::Failure => self.failed_operations += 1,
            OperationOutcome::Timeout => {
                self.failed_operations += 1;
                self.timeouts += 1;
            },
            OperationOutcome::Exception => {
                self.failed_operations += 1;
                self.exceptions += 1;
            },
        }
        // running average over total_operations, matching DriverStatistics' monotonic-counter contract
        let n = self.total_operations as f64;
        self.avg_response_time_ms += (elapsed_ms - self.avg_response_time_ms) / n;
    }
}

#[derive(Debug, Clone, Copy)]
pub enum OperationOutcome {
    Success,
    Failure,
    Timeout,
    Exception,
}
