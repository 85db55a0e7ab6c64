//! `ModbusTcpWorker` (spec §4.E): a `BaseDeviceWorker` bound to one
//! `ModbusTcpDriver` instance. The concrete worker contributes nothing beyond
//! driver selection and construction — all lifecycle behavior lives in
//! `BaseDeviceWorker`, matching the "thin concrete subclass" shape of spec §4.E.

use std::sync::Arc;

use crate::driver::ModbusTcpDriver;
use crate::error::{Result, WorkerError};
use crate::model::{DataPoint, DeviceInfo};
use crate::pipeline::Pipeline;

use super::{BaseDeviceWorker, DeviceWorker};

/// Builds a `ModbusTcpWorker`: a `ModbusTcpDriver` over `device.endpoint`, bound
/// into a `BaseDeviceWorker`.
pub fn build_modbus_tcp_worker(
    device: DeviceInfo,
    points: Vec<DataPoint>,
    pipeline: Arc<dyn Pipeline>,
) -> Result<Arc<dyn DeviceWorker>> {
    let driver = ModbusTcpDriver::new(&device.endpoint, device.timeout_ms)
        .map_err(|e| WorkerError::Configuration(e.to_string()))?;
    let worker = BaseDeviceWorker::spawn(device, points, Box::new(driver), pipeline)?;
    Ok(worker as Arc<dyn DeviceWorker>)
}
