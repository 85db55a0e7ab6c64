//! Demo binary: loads a small YAML device/point list, starts the collector,
//! and waits for a shutdown signal. Mirrors the teacher's `bin`/service entry
//! point shape (tracing init, then construct, then `wait_for_shutdown`), but
//! with no REST/Redis/database surface — those are outside this crate's scope.

use std::fs;
use std::sync::Arc;

use clap::Parser;
use devworker::model::{DataPoint, DeviceInfo};
use devworker::pipeline::{InMemoryPipeline, Pipeline};
use devworker::repository::{
    InMemoryCurrentValueRepository, InMemoryDataPointRepository, InMemoryDeviceRepository, InMemoryDeviceSettingsRepository,
};
use devworker::{shutdown_workers, wait_for_shutdown, CollectorContext};
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "devworker-demo")]
struct Cli {
    /// Path to a YAML file listing devices and their data points.
    #[arg(long, env = "DEVWORKER_CONFIG")]
    config: String,

    /// Emission pipeline depth before drop-oldest back-pressure kicks in.
    #[arg(long, default_value_t = 1024)]
    pipeline_capacity: usize,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    devices: Vec<DeviceInfo>,
    #[serde(default)]
    points: Vec<DataPoint>,
}

fn init_tracing() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).json().init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let raw = fs::read_to_string(&cli.config)?;
    let config: FileConfig = serde_yaml::from_str(&raw)?;
    tracing::info!(devices = config.devices.len(), points = config.points.len(), "loaded configuration");

    let device_repo = Arc::new(InMemoryDeviceRepository::new(config.devices));
    let point_repo = Arc::new(InMemoryDataPointRepository::new(config.points));
    let settings_repo = Arc::new(InMemoryDeviceSettingsRepository::default());
    let current_values = Arc::new(InMemoryCurrentValueRepository::default());
    let pipeline: Arc<dyn Pipeline> = Arc::new(InMemoryPipeline::new(cli.pipeline_capacity));

    let ctx = CollectorContext::new(device_repo, point_repo, settings_repo, current_values, pipeline);
    ctx.manager.start_all_active_workers().await?;
    tracing::info!(stats = ?ctx.factory.stats(), "workers started");

    wait_for_shutdown().await;
    tracing::info!("shutting down");
    shutdown_workers(&ctx.manager).await;
    Ok(())
}
