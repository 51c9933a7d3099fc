//! Sinker - ProwJob and pod garbage collector
//!
//! Deletes completed ProwJobs once they age out and removes their pods from
//! every build cluster.

use anyhow::{Context, Result};
use prow_lib::{
    api,
    config::ConfigAgent,
    controller_loop::{shutdown_signal, ControllerLoop},
    health::{components, HealthRegistry},
    observability::ControllerLogger,
    sinker::Sinker,
    store::{connect_clusters, KubePodStore, KubeProwJobStore, PodStore, PodStores},
    DEFAULT_CLUSTER,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const SINKER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let options = config::SinkerOptions::load()?;
    info!(config_path = %options.config_path.display(), dry_run = options.dry_run, "Starting sinker");

    // Invalid config is fatal at startup only; later reloads keep the last good one
    let agent = Arc::new(
        ConfigAgent::load(options.config_path.clone()).context("Failed to load prow config")?,
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::SINKER).await;
    health_registry.register(components::CONFIG).await;
    let _config_watch = agent.watch(health_registry.clone())?;

    let clients = connect_clusters(options.kubeconfig.as_deref()).await?;
    let default_client = clients
        .get(DEFAULT_CLUSTER)
        .cloned()
        .context("No client for the default cluster")?;
    info!(clusters = ?clients.keys().collect::<Vec<_>>(), "Connected to clusters");

    let pods: PodStores = clients
        .into_iter()
        .map(|(name, client)| (name, Arc::new(KubePodStore::new(client)) as PodStore))
        .collect();
    let sinker = Arc::new(
        Sinker::new(
            Arc::new(KubeProwJobStore::new(default_client)),
            pods,
            agent.clone(),
        )
        .with_dry_run(options.dry_run),
    );

    let logger = ControllerLogger::new(components::SINKER);
    logger.log_startup(SINKER_VERSION, options.dry_run);

    let controller = ControllerLoop::new(sinker).with_health(health_registry.clone());

    if options.run_once {
        let result = controller.run_once().await;
        logger.log_shutdown("single pass complete");
        return result;
    }

    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    let api_handle = tokio::spawn(api::serve(options.api_port, app_state));
    health_registry.set_ready(true).await;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let loop_handle = tokio::spawn(controller.run(shutdown_rx));

    let reason = shutdown_signal().await;
    logger.log_shutdown(reason);
    health_registry.set_ready(false).await;

    // Let an in-flight pass finish
    let _ = shutdown_tx.send(());
    if let Err(e) = loop_handle.await {
        error!(error = %e, "Controller loop task failed");
    }
    api_handle.abort();

    Ok(())
}
