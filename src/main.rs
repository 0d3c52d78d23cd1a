//! linedrop server binary
//!
//! Features:
//! - Fixed cap on concurrent sessions, excess connections told `SERVER FULL`
//! - Commands: help, status, list, get <file>, <filename>, ping, who, uptime, about, exit
//! - File streaming with size and SHA-256 header
//! - Configuration via CLI arguments or TOML file

use linedrop::config::Config;
use linedrop::server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        max_sessions = config.max_sessions,
        repo = %config.repo_root.display(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting linedrop server"
    );

    let server = Server::new(config);
    let listener = server.bind()?;

    server
        .run_until(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Shut down gracefully");
    Ok(())
}
