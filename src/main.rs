//! scanrelay API server - main application entry point.
//!
//! # Startup Flow
//!
//! 1. Load configuration (defaults, environment, `.env`, optional JSON file)
//! 2. Open the storage backend and run migrations
//! 3. Start the connection manager and its health loop
//! 4. Register command handlers from the configured programs
//! 5. Serve HTTP until Ctrl-C, then drain and close the pool

use scanrelay::{
    config::{ConfigLoader, ServerOverrides},
    server::{self, AppState},
    storage,
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads RUST_LOG (defaults to "info" level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ConfigLoader::from_env().load_server(ServerOverrides::default())?;
    tracing::info!(
        profile = ?config.profile,
        database = %config.redacted_database_uri(),
        "Configuration loaded"
    );

    let backend = storage::connect_backend(&config.database_uri).await?;
    tracing::info!(backend = backend.name(), "Storage backend ready");

    let handlers = server::handlers_from_config(&config);
    let state = AppState::build(&config, backend, handlers)?;

    let listener = TcpListener::bind(&config.bind_addr).await?;
    server::serve(listener, state, shutdown_signal()).await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
