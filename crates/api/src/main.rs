use std::sync::Arc;

use anyhow::Context;

use enrichq_api::{app, config::AppConfig};
use enrichq_infra::{QueueWorker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    enrichq_observability::init();

    let config = AppConfig::from_env()?;
    let services = Arc::new(app::services::build_services(&config).await?);

    let worker = config.worker_mode.then(|| {
        tracing::info!("worker mode enabled");
        QueueWorker::new(Arc::clone(&services.controller), WorkerConfig::default()).spawn()
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app::build_app(services))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(worker) = worker {
        let exit = worker.shutdown().await;
        tracing::info!(?exit, "worker stopped");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
