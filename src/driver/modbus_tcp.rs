//! Minimal Modbus-TCP driver: enough of the MBAP + function-code-3 (read
//! holding registers) wire format to exercise the `ProtocolDriver` contract
//! end to end. The full Modbus stack (exceptions beyond the basics, other
//! function codes, RTU framing) is the excluded wire-codec layer per spec §1;
//! this is deliberately a register-map-only reference, not a complete client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use crate::model::{DataType, DriverStatistics, OperationOutcome, PointValue, ProtocolTag, TimestampedValue, Quality};
use crate::model::DataPoint;
use crate::transport::{TcpBasedWorker, TcpTransportConfig, TransportBase};

use super::{DriverError, DriverErrorKind, DriverResult, DriverStatus, ProtocolDriver};

const READ_HOLDING_REGISTERS: u8 = 0x03;
const WRITE_SINGLE_REGISTER: u8 = 0x06;

#[derive(Debug)]
pub struct ModbusTcpDriver {
    transport: TcpBasedWorker,
    transaction_id: AtomicU16,
    status: DriverStatus,
    last_error: Option<DriverError>,
    stats: DriverStatistics,
}

impl ModbusTcpDriver {
    pub fn new(endpoint: &str, timeout_ms: u64) -> DriverResult<Self> {
        let config = TcpTransportConfig::parse_endpoint(endpoint, timeout_ms)
            .map_err(|e| DriverError::new(DriverErrorKind::Configuration, e.to_string()))?;
        Ok(Self {
            transport: TcpBasedWorker::new(config),
            transaction_id: AtomicU16::new(1),
            status: DriverStatus::Uninitialized,
            last_error: None,
            stats: DriverStatistics::default(),
        })
    }

    fn next_transaction_id(&self) -> u16 {
        self.transaction_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register address from a `DataPoint`'s address string, e.g. "40001" -> 0.
    fn register_address(point: &DataPoint) -> DriverResult<u16> {
        let raw: u32 = point
            .address
            .parse()
            .map_err(|_| DriverError::new(DriverErrorKind::Configuration, format!("invalid modbus address: {}", point.address)))?;
        // Conventional 4xxxx holding-register numbering maps to zero-based offset.
        let offset = if (40_001..=49_999).contains(&raw) { raw - 40_001 } else { raw };
        u16::try_from(offset).map_err(|_| DriverError::new(DriverErrorKind::Configuration, "modbus address out of range"))
    }

    async fn read_holding_register(&mut self, register: u16) -> DriverResult<u16> {
        let txn = self.next_transaction_id();
        let mut pdu = Vec::with_capacity(12);
        pdu.extend_from_slice(&txn.to_be_bytes());
        pdu.extend_from_slice(&[0, 0]); // protocol id
        pdu.extend_from_slice(&6u16.to_be_bytes()); // remaining length
        pdu.push(0x01); // unit id
        pdu.push(READ_HOLDING_REGISTERS);
        pdu.extend_from_slice(&register.to_be_bytes());
        pdu.extend_from_slice(&1u16.to_be_bytes()); // quantity

        self.transport
            .send(&pdu)
            .await
            .map_err(|e| DriverError::new(DriverErrorKind::Transient, e.to_string()))?;

        let mut buf = [0u8; 256];
        let n = self
            .transport
            .receive(&mut buf)
            .await
            .map_err(|e| DriverError::new(DriverErrorKind::Transient, e.to_string()))?;

        if n < 11 {
            return Err(DriverError::new(DriverErrorKind::Protocol, "short modbus response"));
        }
        if buf[7] & 0x80 != 0 {
            return Err(DriverError::new(DriverErrorKind::Protocol, format!("modbus exception code {}", buf[8])));
        }
        Ok(u16::from_be_bytes([buf[9], buf[10]]))
    }

    async fn write_holding_register(&mut self, register: u16, value: u16) -> DriverResult<()> {
        let txn = self.next_transaction_id();
        let mut pdu = Vec::with_capacity(12);
        pdu.extend_from_slice(&txn.to_be_bytes());
        pdu.extend_from_slice(&[0, 0]);
        pdu.extend_from_slice(&6u16.to_be_bytes());
        pdu.push(0x01);
        pdu.push(WRITE_SINGLE_REGISTER);
        pdu.extend_from_slice(&register.to_be_bytes());
        pdu.extend_from_slice(&value.to_be_bytes());

        self.transport
            .send(&pdu)
            .await
            .map_err(|e| DriverError::new(DriverErrorKind::Transient, e.to_string()))?;

        let mut buf = [0u8; 256];
        let n = self
            .transport
            .receive(&mut buf)
            .await
            .map_err(|e| DriverError::new(DriverErrorKind::Transient, e.to_string()))?;
        if n < 8 || (buf[7] & 0x80 != 0) {
            return Err(DriverError::new(DriverErrorKind::Protocol, "modbus write rejected"));
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolDriver for ModbusTcpDriver {
    async fn initialize(&mut self, _device_properties: &HashMap<String, String>) -> DriverResult<()> {
        // Idempotent: safe to call repeatedly, matches spec §4.A.
        self.status = DriverStatus::Initialized;
        Ok(())
    }

    async fn connect(&mut self) -> DriverResult<()> {
        self.transport
            .establish_connection()
            .await
            .map_err(|e| {
                let err = DriverError::new(DriverErrorKind::Transient, e.to_string());
                self.last_error = Some(err.clone());
                self.status = DriverStatus::Error;
                err
            })?;
        self.status = DriverStatus::Running;
        Ok(())
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        self.transport
            .close_connection()
            .await
            .map_err(|e| DriverError::new(DriverErrorKind::Resource, e.to_string()))?;
        self.status = DriverStatus::Stopped;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    async fn read_values(&mut self, points: &[DataPoint]) -> DriverResult<Vec<TimestampedValue>> {
        let start = std::time::Instant::now();
        let mut out = Vec::with_capacity(points.len());
        for (seq, point) in points.iter().enumerate() {
            let register = Self::register_address(point)?;
            match self.read_holding_register(register).await {
                Ok(raw) => {
                    let scaled = raw as f64 * point.scaling.factor + point.scaling.offset;
                    let value = match point.data_type {
                        DataType::F32 | DataType::F64 => PointValue::F64(scaled),
                        _ => PointValue::U64(scaled.round() as u64),
                    };
                    out.push(TimestampedValue {
                        point_id: point.id.clone(),
                        value,
                        quality: Quality::Good,
                        sequence: seq as u64,
                        captured_at_ms: Utc::now().timestamp_millis(),
                        changed: false, // changed-flag computed by the worker against its last-emitted map
                    });
                    self.stats.record_operation(start.elapsed().as_secs_f64() * 1000.0, OperationOutcome::Success);
                },
                Err(e) => {
                    self.last_error = Some(e.clone());
                    self.stats.record_operation(start.elapsed().as_secs_f64() * 1000.0, OperationOutcome::Failure);
                    return Err(e);
                },
            }
        }
        Ok(out)
    }

    async fn write_value(&mut self, point: &DataPoint, value: PointValue) -> DriverResult<()> {
        if !point.writable {
            return Err(DriverError::new(DriverErrorKind::Data, format!("point {} is not writable", point.id)));
        }
        let register = Self::register_address(point)?;
        let raw = match value {
            PointValue::U64(v) => u16::try_from(v).map_err(|_| DriverError::new(DriverErrorKind::Data, "value does not fit u16 register"))?,
            PointValue::I64(v) => u16::try_from(v).map_err(|_| DriverError::new(DriverErrorKind::Data, "value does not fit u16 register"))?,
            PointValue::F64(v) => ((v - point.scaling.offset) / point.scaling.factor).round() as u16,
            _ => return Err(DriverError::new(DriverErrorKind::Data, "unsupported value type for modbus register write")),
        };
        let result = self.write_holding_register(register, raw).await;
        match &result {
            Ok(()) => self.stats.record_operation(0.0, OperationOutcome::Success),
            Err(e) => {
                self.last_error = Some(e.clone());
                self.stats.record_operation(0.0, OperationOutcome::Failure);
            },
        }
        result
    }

    fn protocol_type(&self) -> ProtocolTag {
        ProtocolTag::ModbusTcp
    }

    fn status(&self) -> DriverStatus {
        self.status
    }

    fn last_error(&self) -> Option<DriverError> {
        self.last_error.clone()
    }

    fn statistics(&self) -> DriverStatistics {
        self.stats.clone()
    }
}
