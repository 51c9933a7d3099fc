//! Horologium - periodic job scheduler
//!
//! Starts a new ProwJob for every configured periodic whose interval or
//! cron schedule says it is due.

use anyhow::{Context, Result};
use prow_lib::{
    api,
    config::ConfigAgent,
    controller_loop::{shutdown_signal, ControllerLoop},
    health::{components, HealthRegistry},
    horologium::{CronScheduler, Horologium},
    observability::ControllerLogger,
    store::{connect_clusters, KubeProwJobStore},
    DEFAULT_CLUSTER,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const HOROLOGIUM_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let options = config::HorologiumOptions::load()?;
    info!(
        config_path = %options.config_path.display(),
        tick_interval_secs = options.tick_interval_secs,
        "Starting horologium"
    );

    let agent = Arc::new(
        ConfigAgent::load(options.config_path.clone()).context("Failed to load prow config")?,
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::HOROLOGIUM).await;
    health_registry.register(components::CONFIG).await;
    let _config_watch = agent.watch(health_registry.clone())?;

    let clients = connect_clusters(options.kubeconfig.as_deref()).await?;
    let client = clients
        .get(DEFAULT_CLUSTER)
        .cloned()
        .context("No client for the default cluster")?;

    let cron = Arc::new(CronScheduler::new());
    let horologium = Arc::new(
        Horologium::new(
            Arc::new(KubeProwJobStore::new(client)),
            agent.clone(),
            cron.clone(),
        )
        .with_tick_interval(options.tick_interval()),
    );

    let logger = ControllerLogger::new(components::HOROLOGIUM);
    logger.log_startup(HOROLOGIUM_VERSION, false);

    let controller = ControllerLoop::new(horologium).with_health(health_registry.clone());

    if options.run_once {
        let result = controller.run_once().await;
        logger.log_shutdown("single pass complete");
        return result;
    }

    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    let api_handle = tokio::spawn(api::serve(options.api_port, app_state));
    health_registry.set_ready(true).await;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let cron_handle = tokio::spawn(cron.run(shutdown_tx.subscribe()));
    let loop_handle = tokio::spawn(controller.run(shutdown_rx));

    let reason = shutdown_signal().await;
    logger.log_shutdown(reason);
    health_registry.set_ready(false).await;

    let _ = shutdown_tx.send(());
    for (task, handle) in [("controller loop", loop_handle), ("cron scheduler", cron_handle)] {
        if let Err(e) = handle.await {
            error!(task, error = %e, "Task failed");
        }
    }
    api_handle.abort();

    Ok(())
}
