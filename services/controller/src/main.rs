//! Controller binary: wires the object store, the agent client, and the
//! reconciliation loop, then runs until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use faultline_controller::client::{AgentApi, HttpAgent};
use faultline_controller::config::ControllerConfig;
use faultline_controller::controller::Controller;
use faultline_store::{Collection, ExperimentTask, PhysicalMachine};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ControllerConfig::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        workers = config.workers,
        resync_secs = config.resync_interval.as_secs(),
        "Starting faultline controller"
    );

    let machines: Collection<PhysicalMachine> = Collection::new();
    let tasks: Collection<ExperimentTask> = Collection::new();
    let agent: Arc<dyn AgentApi> = Arc::new(HttpAgent::new(&config)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = Controller::new(config, machines, tasks, agent);
    let handle = tokio::spawn(controller.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = handle => {
            info!("Controller exited");
        }
    }

    let _ = shutdown_tx.send(true);
    info!("Waiting for workers to stop");
    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Shutdown complete");
    Ok(())
}
