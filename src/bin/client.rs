//! fanout-client: interactive client for the broadcast relay.
//!
//! Each non-empty input line is sent to the server; `exit` quits without
//! notifying the server. Relayed payloads are printed as they arrive.

use tcp_fanout::{Client, ClientConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = ClientConfig::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(server = %config.connect, "Starting fanout client");

    let client = Client::connect(&config, |payload: &[u8]| {
        println!("Msg : {}", String::from_utf8_lossy(payload));
    })
    .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        if line == "exit" {
            break;
        }
        if let Err(e) = client.send(&line).await {
            warn!(error = %e, "Send failed");
        }
    }

    Ok(())
}
