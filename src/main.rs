mod config;
mod dataset;
mod error;
mod evaluation;
mod providers;
mod routes;
mod server;
mod state;

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use config::{AppConfig, CliArgs};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "visionbench=info,tower_http=info".into()),
        )
        .init();

    let args = CliArgs::parse();
    info!("Starting visionbench v{}", env!("CARGO_PKG_VERSION"));
    info!("Data dir: {:?}", args.data_dir);

    if !args.data_dir.exists() {
        error!("Data directory does not exist: {:?}", args.data_dir);
        std::process::exit(1);
    }

    let config = AppConfig::from_args(args);
    let port = config.port;
    info!("Database: {:?}", config.db_path);

    let state = Arc::new(AppState::new(config)?);
    let app = server::build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install ctrl-c handler: {e}");
        return;
    }
    info!("Shutdown signal received");
}
