//! fanout-server: TCP broadcast relay server.
//!
//! Every payload received from one client is relayed to all connected
//! clients. Configuration via CLI arguments or TOML file.

use tcp_fanout::server::resolve_ipv4;
use tcp_fanout::{Server, ServerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = ServerConfig::load()?;

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
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        idle_timeout = ?config.idle_timeout,
        "Starting fanout server"
    );

    let addr = resolve_ipv4(&config.host, config.port).await?;
    let server = Server::new(&config)?;

    let runner = server.clone();
    let accept_loop = tokio::spawn(async move { runner.start(addr).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    server.shutdown();

    if let Err(e) = accept_loop.await? {
        error!(error = %e, "Server stopped with error");
        return Err(e.into());
    }

    let stats = server.stats();
    info!(
        accepted = stats.accepted,
        total_bytes_read = stats.total_bytes_read,
        "Server stopped"
    );
    Ok(())
}
