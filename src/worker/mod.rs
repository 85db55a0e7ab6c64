//! `BaseDeviceWorker` (spec §4.C): owns the device/point configuration, one
//! driver instance, the reconnect controller, and the poll loop that emits
//! samples to the pipeline.

mod modbus_tcp_worker;

pub use modbus_tcp_worker::build_modbus_tcp_worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
#[cfg(test)]
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{DriverError, ProtocolDriver};
use crate::error::{Result, WorkerError};
use crate::model::{DataPoint, DeviceInfo, DriverStatistics, PointValue, ReconnectionSettings, WorkerState};
use crate::pipeline::{EmissionBatch, Pipeline};
use crate::reconnect::{ReconnectController, ReconnectHooks, ReconnectState, ReconnectStateHandle};

/// Control-plane + status contract every concrete worker exposes to `WorkerManager`.
#[async_trait]
pub trait DeviceWorker: Send + Sync {
    fn device_id(&self) -> &str;

    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    async fn add_data_point(&self, point: DataPoint) -> Result<()>;
    async fn write_value(&self, point_id: &str, value: PointValue) -> Result<()>;
    async fn update_reconnection_settings(&self, settings: ReconnectionSettings) -> Result<()>;
    async fn force_reconnect(&self) -> Result<()>;
    async fn status_snapshot(&self) -> WorkerStatusSnapshot;
}

/// `GetStatusJson`'s payload: state, last error, reconnection stats, driver statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusSnapshot {
    pub device_id: String,
    pub state: WorkerState,
    pub connected: bool,
    pub last_error: Option<String>,
    pub driver_stats: DriverStatistics,
    pub last_sequence: u64,
    pub dropped_batches: u64,
}

/// Adapts the worker's owned driver into the controller's hooks contract
/// (spec §4.E: `EstablishProtocolConnection` is `driver.Initialize(); driver.Connect()` in order).
struct DriverHooks {
    driver: Arc<AsyncMutex<Box<dyn ProtocolDriver>>>,
    device_properties: HashMap<String, String>,
}

#[async_trait]
impl ReconnectHooks for DriverHooks {
    async fn connect(&self) -> std::result::Result<(), String> {
        let mut driver = self.driver.lock().await;
        driver.initialize(&self.device_properties).await.map_err(|e| e.to_string())?;
        driver.connect().await.map_err(|e| e.to_string())
    }

    async fn close(&self) -> std::result::Result<(), String> {
        self.driver.lock().await.disconnect().await.map_err(|e| e.to_string())
    }

    async fn check_connection(&self) -> std::result::Result<(), String> {
        if self.driver.lock().await.is_connected().await {
            Ok(())
        } else {
            Err("driver reports not connected".to_string())
        }
    }

    async fn send_keep_alive(&self) -> std::result::Result<(), String> {
        // The reference driver has no dedicated keep-alive primitive; a liveness
        // check against the connection is an adequate probe for this crate's scope.
        self.check_connection().await
    }
}

pub struct BaseDeviceWorker {
    device_id: String,
    device: AsyncRwLock<DeviceInfo>,
    points: AsyncRwLock<Vec<DataPoint>>,
    driver: Arc<AsyncMutex<Box<dyn ProtocolDriver>>>,
    reconnect_settings: AsyncRwLock<ReconnectionSettings>,
    worker_state: AsyncRwLock<WorkerState>,
    paused: AtomicBool,
    last_emitted: AsyncMutex<HashMap<String, PointValue>>,
    sequence: AtomicU64,
    pipeline: Arc<dyn Pipeline>,
    dropped_batches: AtomicU64,
    last_driver_error: AsyncMutex<Option<DriverError>>,
    reconnect_state_handle: AsyncMutex<Option<ReconnectStateHandle>>,
    reconnect_cancel: AsyncMutex<Option<CancellationToken>>,
    controller_task: AsyncMutex<Option<JoinHandle<()>>>,
    poll_cancel: AsyncMutex<Option<CancellationToken>>,
    poll_task: AsyncMutex<Option<JoinHandle<()>>>,
    self_ref: AsyncMutex<Option<Weak<BaseDeviceWorker>>>,
}

impl BaseDeviceWorker {
    /// Constructs the worker behind an `Arc`, as the poll loop needs to hold a
    /// strong reference to `self` across its own spawned task.
    pub fn spawn(
        device: DeviceInfo,
        points: Vec<DataPoint>,
        driver: Box<dyn ProtocolDriver>,
        pipeline: Arc<dyn Pipeline>,
    ) -> Result<Arc<Self>> {
        device.validate().map_err(WorkerError::Configuration)?;
        for p in &points {
            p.validate().map_err(WorkerError::Configuration)?;
        }
        let device_id = device.device_id.clone();

        let worker = Arc::new(Self {
            device_id,
            device: AsyncRwLock::new(device),
            points: AsyncRwLock::new(points),
            driver: Arc::new(AsyncMutex::new(driver)),
            reconnect_settings: AsyncRwLock::new(ReconnectionSettings::default()),
            worker_state: AsyncRwLock::new(WorkerState::Stopped),
            paused: AtomicBool::new(false),
            last_emitted: AsyncMutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            pipeline,
            dropped_batches: AtomicU64::new(0),
            last_driver_error: AsyncMutex::new(None),
            reconnect_state_handle: AsyncMutex::new(None),
            reconnect_cancel: AsyncMutex::new(None),
            controller_task: AsyncMutex::new(None),
            poll_cancel: AsyncMutex::new(None),
            poll_task: AsyncMutex::new(None),
            self_ref: AsyncMutex::new(None),
        });
        *worker.self_ref.try_lock().expect("uncontended at construction") = Some(Arc::downgrade(&worker));
        Ok(worker)
    }

    async fn poll_tick(&self) {
        let enabled_points = self.points.read().await.clone();
        if enabled_points.is_empty() {
            return;
        }

        let read_result = {
            let mut driver = self.driver.lock().await;
            driver.read_values(&enabled_points).await
        };

        match read_result {
            Ok(mut values) => {
                let mut last_emitted = self.last_emitted.lock().await;
                for (value, point) in values.iter_mut().zip(enabled_points.iter()) {
                    value.changed = match (value.value.numeric(), last_emitted.get(&point.id).and_then(|v| v.numeric())) {
                        (Some(new), Some(old)) => (new - old).abs() > point.deadband,
                        _ => last_emitted.get(&point.id) != Some(&value.value),
                    };
                    last_emitted.insert(point.id.clone(), value.value.clone());
                }
                drop(last_emitted);

                let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
                let batch = EmissionBatch { device_id: self.device_id.clone(), sequence, priority: 0, values };
                if self.pipeline.send(batch) {
                    self.dropped_batches.fetch_add(1, Ordering::Relaxed);
                    warn!(device_id = %self.device_id, "pipeline queue full, dropped oldest batch");
                }
            },
            Err(e) => {
                debug!(device_id = %self.device_id, error = %e, "poll read_values failed; reconnect controller will classify");
                *self.last_driver_error.lock().await = Some(e);
            },
        }
    }

    async fn poll_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let tick_ms = {
                let device = self.device.read().await;
                std::cmp::min(device.polling_interval_ms, 200).max(1)
            };
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(tick_ms)) => {},
                _ = cancel.cancelled() => return,
            }

            if self.paused.load(Ordering::SeqCst) {
                continue;
            }
            let Some(handle) = self.reconnect_state_handle.lock().await.clone() else { continue };
            if handle.get() != ReconnectState::Running {
                continue;
            }
            self.poll_tick().await;
        }
    }

    /// Builds a fresh `ReconnectController` bound to the current driver/settings
    /// and spawns its supervised loop, replacing whatever ran before.
    async fn spawn_reconnect_task(&self) -> Result<()> {
        let settings = self.reconnect_settings.read().await.clone();
        let mut controller = ReconnectController::new(settings);
        let state_handle = controller.state_handle();
        let cancel = controller.cancellation_handle();

        let device_properties = self.device.read().await.properties.clone();
        let hooks = Arc::new(DriverHooks { driver: self.driver.clone(), device_properties });

        let task = tokio::spawn(async move {
            controller.run(&*hooks).await;
        });

        *self.reconnect_state_handle.lock().await = Some(state_handle);
        *self.reconnect_cancel.lock().await = Some(cancel);
        *self.controller_task.lock().await = Some(task);
        Ok(())
    }

    /// Cancels the in-flight controller task (if any) and waits for it to reach `Stopped`.
    async fn stop_reconnect_task(&self) {
        if let Some(cancel) = self.reconnect_cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(task) = self.controller_task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[async_trait]
impl DeviceWorker for BaseDeviceWorker {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn start(&self) -> Result<()> {
        {
            let state = self.worker_state.read().await;
            if !matches!(*state, WorkerState::Stopped | WorkerState::Error) {
                return Err(WorkerError::AlreadyRunning(format!("worker is in state {:?}", *state)));
            }
        }
        *self.worker_state.write().await = WorkerState::Starting;
        self.spawn_reconnect_task().await?;

        let self_arc = self
            .self_ref
            .lock()
            .await
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| WorkerError::Internal("worker must be constructed via BaseDeviceWorker::spawn".into()))?;
        let cancel = CancellationToken::new();
        *self.poll_cancel.lock().await = Some(cancel.clone());
        *self.poll_task.lock().await = Some(tokio::spawn(BaseDeviceWorker::poll_loop(self_arc, cancel)));

        info!(device_id = %self.device_id, "device worker started");
        *self.worker_state.write().await = WorkerState::Running;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if matches!(*self.worker_state.read().await, WorkerState::Stopped) {
            return Ok(());
        }
        *self.worker_state.write().await = WorkerState::Stopping;

        if let Some(cancel) = self.poll_cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(task) = self.poll_task.lock().await.take() {
            let _ = task.await;
        }
        self.stop_reconnect_task().await;

        *self.worker_state.write().await = WorkerState::Stopped;
        info!(device_id = %self.device_id, "device worker stopped");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        let mut state = self.worker_state.write().await;
        if *state != WorkerState::Running {
            return Err(WorkerError::InvalidState(format!("cannot pause from {:?}", *state)));
        }
        self.paused.store(true, Ordering::SeqCst);
        *state = WorkerState::Paused;
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        let mut state = self.worker_state.write().await;
        if *state != WorkerState::Paused {
            return Err(WorkerError::InvalidState(format!("cannot resume from {:?}", *state)));
        }
        self.paused.store(false, Ordering::SeqCst);
        *state = WorkerState::Running;
        Ok(())
    }

    async fn add_data_point(&self, point: DataPoint) -> Result<()> {
        if *self.worker_state.read().await != WorkerState::Stopped {
            return Err(WorkerError::InvalidState("AddDataPoint is only allowed while STOPPED".into()));
        }
        point.validate().map_err(WorkerError::Configuration)?;
        let mut points = self.points.write().await;
        if points.iter().any(|p| p.id == point.id) {
            return Err(WorkerError::AlreadyExists(format!("data point {}", point.id)));
        }
        points.push(point);
        Ok(())
    }

    async fn write_value(&self, point_id: &str, value: PointValue) -> Result<()> {
        if *self.worker_state.read().await != WorkerState::Running {
            return Err(WorkerError::InvalidState("WriteValue requires RUNNING".into()));
        }
        let point = {
            let points = self.points.read().await;
            points
                .iter()
                .find(|p| p.id == point_id)
                .cloned()
                .ok_or_else(|| WorkerError::NotFound(format!("data point {point_id}")))?
        };
        if !point.writable {
            return Err(WorkerError::NotWritable(point_id.to_string()));
        }
        let mut driver = self.driver.lock().await;
        driver.write_value(&point, value).await.map_err(WorkerError::from)
    }

    async fn update_reconnection_settings(&self, settings: ReconnectionSettings) -> Result<()> {
        settings.validate().map_err(WorkerError::Configuration)?;
        *self.reconnect_settings.write().await = settings;
        Ok(())
    }

    async fn force_reconnect(&self) -> Result<()> {
        if *self.worker_state.read().await == WorkerState::Stopped {
            return Err(WorkerError::InvalidState("ForceReconnect requires a started worker".into()));
        }
        self.stop_reconnect_task().await;
        self.spawn_reconnect_task().await?;
        Ok(())
    }

    async fn status_snapshot(&self) -> WorkerStatusSnapshot {
        let state = *self.worker_state.read().await;
        let driver = self.driver.lock().await;
        let connected = driver.is_connected().await;
        let driver_stats = driver.statistics();
        drop(driver);
        let last_error = self.last_driver_error.lock().await.clone().map(|e| e.to_string());

        WorkerStatusSnapshot {
            device_id: self.device_id.clone(),
            state,
            connected,
            last_error,
            driver_stats,
            last_sequence: self.sequence.load(Ordering::SeqCst),
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverError, DriverErrorKind, DriverResult, DriverStatus};
    use crate::model::{DataType, ProtocolTag, Quality, Scaling, TimestampedValue};
    use crate::pipeline::InMemoryPipeline;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    #[derive(Debug)]
    struct FakeDriver {
        connected: StdAtomicBool,
        fail_connect: StdAtomicBool,
    }

    #[async_trait]
    impl ProtocolDriver for FakeDriver {
        async fn initialize(&mut self, _props: &HashMap<String, String>) -> DriverResult<()> {
            Ok(())
        }
        async fn connect(&mut self) -> DriverResult<()> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(DriverError::new(DriverErrorKind::Transient, "refused"));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn disconnect(&mut self) -> DriverResult<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        async fn read_values(&mut self, points: &[DataPoint]) -> DriverResult<Vec<TimestampedValue>> {
            Ok(points
                .iter()
                .enumerate()
                .map(|(i, p)| TimestampedValue {
                    point_id: p.id.clone(),
                    value: PointValue::U64(42),
                    quality: Quality::Good,
                    sequence: i as u64,
                    captured_at_ms: Utc::now().timestamp_millis(),
                    changed: false,
                })
                .collect())
        }
        async fn write_value(&mut self, _point: &DataPoint, _value: PointValue) -> DriverResult<()> {
            Ok(())
        }
        fn protocol_type(&self) -> ProtocolTag {
            ProtocolTag::Custom
        }
        fn status(&self) -> DriverStatus {
            DriverStatus::Running
        }
        fn last_error(&self) -> Option<DriverError> {
            None
        }
        fn statistics(&self) -> DriverStatistics {
            DriverStatistics::default()
        }
    }

    fn device() -> DeviceInfo {
        DeviceInfo {
            device_id: "d1".into(),
            device_key: 1,
            name: "test device".into(),
            protocol: ProtocolTag::Custom,
            endpoint: "fake://".into(),
            enabled: true,
            polling_interval_ms: 5,
            timeout_ms: 100,
            retry_count: 0,
            properties: HashMap::new(),
        }
    }

    fn point() -> DataPoint {
        DataPoint {
            id: "p1".into(),
            device_id: "d1".into(),
            name: "point".into(),
            address: "1".into(),
            data_type: DataType::U16,
            writable: true,
            scan_interval_override_ms: None,
            scaling: Scaling::default(),
            range_min: 0.0,
            range_max: 100.0,
            deadband: 0.0,
            unit: String::new(),
        }
    }

    #[tokio::test]
    async fn start_then_stop_reaches_running_then_stopped() {
        let driver = Box::new(FakeDriver { connected: StdAtomicBool::new(false), fail_connect: StdAtomicBool::new(false) });
        let pipeline = Arc::new(InMemoryPipeline::new(8));
        let worker = BaseDeviceWorker::spawn(device(), vec![point()], driver, pipeline).unwrap();

        worker.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(worker.status_snapshot().await.state, WorkerState::Running);
        assert!(worker.status_snapshot().await.connected);

        worker.stop().await.unwrap();
        assert_eq!(worker.status_snapshot().await.state, WorkerState::Stopped);
    }

    #[tokio::test]
    async fn pause_suspends_polling_without_stopping() {
        let driver = Box::new(FakeDriver { connected: StdAtomicBool::new(false), fail_connect: StdAtomicBool::new(false) });
        let pipeline = Arc::new(InMemoryPipeline::new(8));
        let worker = BaseDeviceWorker::spawn(device(), vec![point()], driver, pipeline.clone()).unwrap();

        worker.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        worker.pause().await.unwrap();
        pipeline.drain();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let after = pipeline.drain().len();
        assert_eq!(after, 0);
        assert_eq!(worker.status_snapshot().await.state, WorkerState::Paused);

        worker.resume().await.unwrap();
        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn write_value_rejected_when_point_not_writable() {
        let driver = Box::new(FakeDriver { connected: StdAtomicBool::new(false), fail_connect: StdAtomicBool::new(false) });
        let pipeline = Arc::new(InMemoryPipeline::new(8));
        let mut ro_point = point();
        ro_point.writable = false;
        let worker = BaseDeviceWorker::spawn(device(), vec![ro_point], driver, pipeline).unwrap();

        worker.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let result = worker.write_value("p1", PointValue::U64(1)).await;
        assert!(matches!(result, Err(WorkerError::NotWritable(_))));
        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn add_data_point_rejected_while_running() {
        let driver = Box::new(FakeDriver { connected: StdAtomicBool::new(false), fail_connect: StdAtomicBool::new(false) });
        let pipeline = Arc::new(InMemoryPipeline::new(8));
        let worker = BaseDeviceWorker::spawn(device(), vec![point()], driver, pipeline).unwrap();

        worker.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let result = worker.add_data_point(point()).await;
        assert!(matches!(result, Err(WorkerError::InvalidState(_))));
        worker.stop().await.unwrap();
    }
}
