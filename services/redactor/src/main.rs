use anyhow::{Context, Result};
use redactor::api::{start_api_server, AppState};
use redactor::config::{Config, StorageBackend};
use redactor::grants::{GrantIssuer, GrantVerifier, SigningKey, SystemClock};
use redactor::job_client::RedactionJobClient;
use redactor::pipeline::{PipelineSettings, RedactionPipeline};
use redactor::storage::memory::MemoryStore;
use redactor::storage::s3::S3Store;
use redactor::storage::{ObjectStore, ObjectStoreGateway};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Redactor Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let store: Arc<dyn ObjectStore> = match config.storage.backend {
        StorageBackend::S3 => Arc::new(
            S3Store::new(&config.storage.s3)
                .await
                .context("Failed to initialize S3 store")?,
        ),
        StorageBackend::Memory => {
            warn!("Using in-memory storage; documents are lost on restart");
            Arc::new(MemoryStore::with_page_size(config.storage.list_page_size))
        }
    };
    let gateway = Arc::new(ObjectStoreGateway::new(store));

    let signing_key = match config.grants.account_key.as_deref() {
        Some(key) => Some(Arc::new(
            SigningKey::from_base64(&config.grants.account_name, key)
                .context("Invalid grants.account_key")?,
        )),
        None => {
            warn!("No grants.account_key configured; access grants cannot be issued");
            None
        }
    };

    let grants = Arc::new(GrantIssuer::new(
        gateway.clone(),
        signing_key.clone(),
        &config.grants.public_base_url,
        Arc::new(SystemClock),
    ));
    let verifier = signing_key.map(|key| Arc::new(GrantVerifier::new(key, Arc::new(SystemClock))));

    let jobs = Arc::new(
        RedactionJobClient::new(&config.language).context("Failed to initialize job client")?,
    );

    let pipeline = Arc::new(RedactionPipeline::new(
        gateway.clone(),
        grants,
        jobs,
        PipelineSettings::from_config(&config),
    ));

    let shutdown = CancellationToken::new();

    // Create API state
    let api_state = AppState {
        gateway,
        pipeline,
        verifier,
        shutdown: shutdown.clone(),
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let server_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, server_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Redactor service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down redactor service");

    // Stop in-flight polling and drain connections
    shutdown.cancel();
    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }

    info!("Redactor service stopped");

    Ok(())
}

/// Initialize tracing/logging
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
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
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
