use anyhow::{Context, Result};
use reelsafe_storage::api::{start_api_server, AppState};
use reelsafe_storage::{
    Config, Database, S3Uploader, SystemClock, TokioScheduler, UploadQueue, VideoStore,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Reelsafe Storage Service"
    );

    init_metrics(config.service.metrics_port)?;

    let db = Database::connect(&config.storage.database_url)
        .await
        .context("Failed to open metadata database")?;

    let store = Arc::new(VideoStore::new(db, config.storage.clone()));
    let backend = store
        .initialize()
        .await
        .context("Failed to initialize video store")?;

    let uploader = Arc::new(S3Uploader::new(&config.s3).await);

    let queue = Arc::new(UploadQueue::new(
        store.clone(),
        uploader,
        Arc::new(SystemClock),
        Arc::new(TokioScheduler),
        &config.queue,
        config.retention.policy,
    ));
    let initial = queue.start_processing().await;

    info!(
        backend = %backend,
        attempted = initial.attempted,
        "Upload queue running"
    );

    let shutdown = CancellationToken::new();

    let api_state = AppState {
        store: store.clone(),
        queue: queue.clone(),
    };
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) =
            start_api_server(api_state, &api_config, api_shutdown.cancelled_owned()).await
        {
            error!(error = %e, "API server error");
        }
    });

    info!("Storage service started successfully");

    shutdown_signal().await;

    info!("Shutting down storage service");

    // Let an in-flight tick finish before the API goes away
    queue.stop_processing().await;
    shutdown.cancel();
    if let Err(e) = api_handle.await {
        warn!(error = %e, "API server task did not shut down cleanly");
    }

    info!("Storage service stopped");

    Ok(())
}

fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
