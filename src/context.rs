//! `CollectorContext`: bundles the manager, factory, and repositories behind
//! one owned value instead of the teacher's process-wide `lazy_static!`
//! singletons (`PROTOCOL_FACTORY`, the channel registry) — the spec §9 open
//! question on global state is resolved here; see DESIGN.md.

use std::sync::Arc;

use crate::factory::WorkerFactory;
use crate::manager::WorkerManager;
use crate::model::ProtocolTag;
use crate::pipeline::Pipeline;
use crate::repository::{CurrentValueRepository, DataPointRepository, DeviceRepository, DeviceSettingsRepository};
use crate::worker::build_modbus_tcp_worker;

pub struct CollectorContext {
    pub manager: Arc<WorkerManager>,
    pub factory: Arc<WorkerFactory>,
    pub current_values: Arc<dyn CurrentValueRepository>,
}

impl CollectorContext {
    pub fn new(
        device_repo: Arc<dyn DeviceRepository>,
        point_repo: Arc<dyn DataPointRepository>,
        settings_repo: Arc<dyn DeviceSettingsRepository>,
        current_values: Arc<dyn CurrentValueRepository>,
        pipeline: Arc<dyn Pipeline>,
    ) -> Self {
        let mut factory = WorkerFactory::new(device_repo, point_repo, settings_repo, pipeline);
        factory.register_worker_creator(
            ProtocolTag::ModbusTcp,
            Box::new(|device, points, pipeline| build_modbus_tcp_worker(device, points, pipeline)),
        );
        let factory = Arc::new(factory);
        let manager = Arc::new(WorkerManager::new(factory.clone()));
        Self { manager, factory, current_values }
    }
}
