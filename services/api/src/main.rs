mod api;
mod config;
mod mailer;
mod media;
mod otp;
mod products;
mod users;
mod verify;

use anyhow::{Context, Result};
use api::{start_api_server, AppState};
use config::Config;
use mailer::SmtpMailer;
use media::FileStore;
use otp::OtpDispatcher;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use users::UserStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Atelier API Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let user_store = Arc::new(
        UserStore::new(&config.database)
            .await
            .context("Failed to initialize user store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        user_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let file_store = Arc::new(
        FileStore::new(&config.uploads.root_dir)
            .await
            .context("Failed to initialize file store")?,
    );

    let mailer = Arc::new(SmtpMailer::new(&config.smtp).context("Failed to initialize mailer")?);

    let otp_dispatcher = OtpDispatcher::start(mailer, config.otp.capacity);

    // Create API state
    let api_state = AppState {
        users: user_store,
        files: file_store,
        otp: otp_dispatcher,
        expose_otp: config.otp.expose_in_response,
        bcrypt_cost: config.auth.bcrypt_cost,
    };

    // Spawn API server task
    let http_config = config.http.clone();
    let public_dir = config.uploads.public_dir.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &http_config, &public_dir).await {
            error!(error = %e, "API server error");
        }
    });

    info!("API service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down API service");

    // Abort tasks
    api_handle.abort();

    info!("API service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

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
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
