//! External interface repositories (spec §6): how the factory and manager
//! load configuration and persist current values without this crate owning
//! a database. Shaped after the teacher's storage trait + in-memory test
//! double pattern (`core/storage`), but scoped to the four repositories the
//! spec names instead of the teacher's full persistence layer.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Result, WorkerError};
use crate::model::{DataPoint, DeviceInfo, ReconnectionSettings, TimestampedValue};

#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn get(&self, device_id: &str) -> Result<DeviceInfo>;
    async fn list_active(&self) -> Result<Vec<DeviceInfo>>;
}

#[async_trait]
pub trait DataPointRepository: Send + Sync {
    async fn list_for_device(&self, device_id: &str) -> Result<Vec<DataPoint>>;
}

#[async_trait]
pub trait CurrentValueRepository: Send + Sync {
    /// Used by `WorkerFactory` to hydrate a worker's last-known values before its
    /// first poll, so the worker's deadband comparison has a baseline.
    async fn last_known(&self, device_id: &str) -> Result<Vec<TimestampedValue>>;
    async fn record(&self, device_id: &str, values: &[TimestampedValue]) -> Result<()>;
}

#[async_trait]
pub trait DeviceSettingsRepository: Send + Sync {
    async fn reconnection_settings(&self, device_id: &str) -> Result<ReconnectionSettings>;
}

/// In-memory fakes for tests and the demo binary; not meant to survive process restarts.
#[derive(Default)]
pub struct InMemoryDeviceRepository {
    devices: Mutex<HashMap<String, DeviceInfo>>,
}

impl InMemoryDeviceRepository {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        let map = devices.into_iter().map(|d| (d.device_id.clone(), d)).collect();
        Self { devices: Mutex::new(map) }
    }
}

#[async_trait]
impl DeviceRepository for InMemoryDeviceRepository {
    async fn get(&self, device_id: &str) -> Result<DeviceInfo> {
        self.devices
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .ok_or_else(|| WorkerError::NotFound(device_id.to_string()))
    }

    async fn list_active(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.lock().unwrap().values().filter(|d| d.enabled).cloned().collect())
    }
}

#[derive(Default)]
pub struct InMemoryDataPointRepository {
    points: Mutex<HashMap<String, Vec<DataPoint>>>,
}

impl InMemoryDataPointRepository {
    pub fn new(points: Vec<DataPoint>) -> Self {
        let mut map: HashMap<String, Vec<DataPoint>> = HashMap::new();
        for p in points {
            map.entry(p.device_id.clone()).or_default().push(p);
        }
        Self { points: Mutex::new(map) }
    }
}

#[async_trait]
impl DataPointRepository for InMemoryDataPointRepository {
    async fn list_for_device(&self, device_id: &str) -> Result<Vec<DataPoint>> {
        Ok(self.points.lock().unwrap().get(device_id).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryCurrentValueRepository {
    values: Mutex<HashMap<String, Vec<TimestampedValue>>>,
}

#[async_trait]
impl CurrentValueRepository for InMemoryCurrentValueRepository {
    async fn last_known(&self, device_id: &str) -> Result<Vec<TimestampedValue>> {
        Ok(self.values.lock().unwrap().get(device_id).cloned().unwrap_or_default())
    }

    async fn record(&self, device_id: &str, values: &[TimestampedValue]) -> Result<()> {
        self.values.lock().unwrap().insert(device_id.to_string(), values.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDeviceSettingsRepository {
    settings: Mutex<HashMap<String, ReconnectionSettings>>,
}

#[async_trait]
impl DeviceSettingsRepository for InMemoryDeviceSettingsRepository {
    async fn reconnection_settings(&self, device_id: &str) -> Result<ReconnectionSettings> {
        Ok(self.settings.lock().unwrap().get(device_id).cloned().unwrap_or_default())
    }
}
