//! umig-import - UMIG data import service
//!
//! Serves JSON/CSV imports, batch history, rollback and progress over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use umig_common::config::{load_toml_config, prepare_root_folder, resolve_root_folder};
use umig_common::events::EventBus;

use umig_import::{AppState, ImportService};

/// Command-line arguments for umig-import
#[derive(Parser, Debug)]
#[command(name = "umig-import")]
#[command(about = "UMIG data import service")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides [server] port)
    #[arg(short, long, env = "UMIG_PORT")]
    port: Option<u16>,

    /// Folder holding the database
    #[arg(short, long, env = "UMIG_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let toml_config = load_toml_config(args.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| toml_config.logging.level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting umig-import v{}", env!("CARGO_PKG_VERSION"));

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), "UMIG_ROOT_FOLDER", &toml_config);
    let db_path = prepare_root_folder(&root_folder).context("Failed to initialize root folder")?;
    info!("Database: {}", db_path.display());

    let db_pool = umig_import::db::init_database_pool(&db_path)
        .await
        .context("Failed to open database")?;

    let params = umig_import::config::resolve_import_parameters(&db_pool, &toml_config)
        .await
        .context("Failed to resolve import parameters")?;
    info!(
        max_concurrent_imports = params.max_concurrent_imports,
        queue_capacity = params.queue_capacity,
        chunk_size = params.chunk_size,
        "Import parameters resolved"
    );

    let event_bus = EventBus::new(256);
    let service = ImportService::new(db_pool.clone(), params, event_bus).context("Failed to build import service")?;

    let recovered = service
        .recover_interrupted()
        .await
        .context("Failed to recover interrupted batches")?;
    if !recovered.is_empty() {
        warn!("{} batches from a previous run were marked FAILED", recovered.len());
    }

    let app = umig_import::build_router(AppState::new(db_pool, service.clone()));

    let port = args.port.unwrap_or(toml_config.server.port);
    let host: std::net::IpAddr = toml_config
        .server
        .host
        .parse()
        .with_context(|| format!("Invalid [server] host '{}'", toml_config.server.host))?;
    let addr = SocketAddr::new(host, port);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    service.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
