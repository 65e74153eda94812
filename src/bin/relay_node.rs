//! # Relay Node Binary
//!
//! Runs one relay node over newline-delimited JSON on TCP.

use anyhow::Context;
use clap::Parser;
use push_relay::bridge::BridgeRegistry;
use push_relay::logging::init_structured_logging;
use push_relay::{RelayConfig, RelayNode};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "relay-node")]
#[command(about = "Run a push relay node")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (overrides RELAY_CONFIG_PATH)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Seconds to wait for sessions to drain on shutdown
    #[arg(long, default_value_t = 10)]
    grace_seconds: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_structured_logging();

    let config = RelayConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if cli.check {
        println!("{}", serde_json::to_string_pretty(&config)?);
        info!("Configuration is valid");
        return Ok(());
    }

    let listen_address = config.node.listen_address.clone();
    let node = RelayNode::from_config(config, BridgeRegistry::new())
        .await
        .context("starting relay node")?;
    node.start_background();

    let listener = TcpListener::bind(&listen_address)
        .await
        .with_context(|| format!("binding {listen_address}"))?;
    info!(node_id = %node.node_id(), address = %listen_address, "Relay node listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Connection accepted");
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(%peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let (read, write) = stream.into_split();
                    drop(node.accept(BufReader::new(read), write));
                }
                Err(e) => error!(error = %e, "Accept failed"),
            },
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    let remaining = node.shutdown(Duration::from_secs(cli.grace_seconds)).await;
    if remaining > 0 {
        warn!(remaining, "Exiting with sessions still draining");
    }
    Ok(())
}
