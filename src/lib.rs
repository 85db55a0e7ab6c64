//! Device-worker runtime: per-device protocol drivers, transport bases, a
//! supervised reconnect controller, and the worker/factory/manager layer that
//! ties them together into a small industrial data-acquisition collector.

pub mod context;
pub mod driver;
pub mod error;
pub mod factory;
pub mod manager;
pub mod model;
pub mod pipeline;
pub mod reconnect;
pub mod repository;
pub mod transport;
pub mod worker;

pub use context::CollectorContext;
pub use error::{Result, WorkerError};
pub use factory::WorkerFactory;
pub use manager::WorkerManager;

/// Waits for a shutdown signal: SIGTERM or Ctrl-C on unix, Ctrl-C elsewhere.
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl-C"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received Ctrl-C");
    }
}

/// Stops every registered worker, logging (not propagating) per-worker failures
/// so one stuck device never blocks the rest of shutdown.
pub async fn shutdown_workers(manager: &WorkerManager) {
    for (device_id, result) in manager.stop_all_workers().await {
        if let Err(e) = result {
            tracing::warn!(device_id, error = %e, "worker failed to stop cleanly during shutdown");
        }
    }
}
