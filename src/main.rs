//! PartKeeper -- multipart upload session coordinator.
//!
//! SIGTERM/SIGINT stop accepting connections and wait for in-flight
//! requests (bounded by `server.shutdown_timeout`) before exiting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use partkeeper::config::{Config, LoggingConfig};
use partkeeper::coordinator::UploadCoordinator;
use partkeeper::gateway::aws::{AwsGatewaySettings, AwsUploadGateway};
use partkeeper::gateway::backend::UploadGateway;
use partkeeper::gateway::memory::MemoryUploadGateway;
use partkeeper::staging::Stager;

/// Command-line arguments for the PartKeeper server.
#[derive(Parser, Debug)]
#[command(
    name = "partkeeper",
    version,
    about = "Multipart upload session coordinator for S3-compatible stores"
)]
struct Cli {
    /// Path to the YAML configuration file.  Without one, configuration
    /// comes from defaults and `PARTKEEPER_*` variables.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_gateway(config: &Config) -> anyhow::Result<Arc<dyn UploadGateway>> {
    match config.s3.backend.as_str() {
        "memory" => {
            warn!("Using the in-memory gateway; uploads are lost on restart");
            Ok(Arc::new(MemoryUploadGateway::new()))
        }
        _ => {
            let gateway = AwsUploadGateway::new(AwsGatewaySettings {
                endpoint_url: config.s3.endpoint_url.clone(),
                region: config.s3.region.clone(),
                access_key: config.s3.access_key.clone(),
                secret_key: config.s3.secret_key.clone(),
                use_path_style: config.s3.use_path_style,
            })
            .await?;
            Ok(Arc::new(gateway))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = partkeeper::config::resolve_config(cli.config.as_deref())?;

    init_tracing(&config.logging);
    match &cli.config {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("No configuration file given; using defaults and environment"),
    }

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        partkeeper::metrics::init_metrics();
        partkeeper::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let sessions = partkeeper::session::connect(&config.sessions.uri)?;
    info!("Session store initialized at {}", config.sessions.uri);

    let gateway = build_gateway(&config).await?;

    let coordinator = UploadCoordinator::new(sessions, gateway, config.s3.bucket.clone())
        .with_strict(config.upload.strict)
        .with_operation_timeout(config.upload.operation_timeout())
        .with_compensate_orphans(config.upload.compensate_orphans);
    let stager = Stager::new(
        config.staging.dir.clone(),
        config.staging.chunk_size,
        config.server.max_part_size,
    );
    info!(
        bucket = %config.s3.bucket,
        strict = config.upload.strict,
        "Upload coordinator ready"
    );

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(partkeeper::AppState {
        config,
        coordinator,
        stager,
    });

    let app = partkeeper::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("PartKeeper listening on {}", bind_addr);

    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = signal_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = signal_tx.send(());

    match tokio::time::timeout(shutdown_timeout, server).await {
        Ok(joined) => joined??,
        Err(_) => warn!(
            "In-flight requests did not finish within {:?}; exiting",
            shutdown_timeout
        ),
    }

    info!("PartKeeper shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
