//! DHT node binary.
//!
//! Reads its configuration from the environment (see
//! [`NodeConfig::from_env`](kademlia_dht::NodeConfig::from_env)), starts the UDP
//! listener, joins the network through the bootstrap node and then reports its
//! routing table size periodically until interrupted.
//!
//! # Usage
//!
//! ```bash
//! IS_BOOTSTRAP=true NODE_PORT=4000 cargo run
//! NODE_PORT=4001 BOOTSTRAP_NODE_HOSTNAME=localhost BOOTSTRAP_NODE_PORT=4000 cargo run
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kademlia_dht::{KademliaNode, NodeConfig, TracingSink};

/// How often the node reports its state.
const TELEMETRY_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = NodeConfig::from_env()
        .await
        .context("reading node configuration")?;
    let node = KademliaNode::bind(config, Arc::new(TracingSink))
        .await
        .context("starting the UDP listener")?;

    info!(id = %node.id(), addr = %node.address(), "DHT node started");
    let listener = node.start();

    if let Err(err) = node.join().await {
        warn!("could not join the network, staying isolated: {err}");
    }

    // Spawn a background task to periodically print telemetry.
    let telemetry_node = node.clone();
    tokio::spawn(async move {
        let mut interval = time::interval(TELEMETRY_INTERVAL);
        loop {
            interval.tick().await;
            let snapshot = telemetry_node.snapshot().await;
            info!(
                contacts = snapshot.contacts.len(),
                stored_keys = snapshot.stored_keys,
                "telemetry"
            );
        }
    });

    tokio::select! {
        res = listener => {
            res.context("listener task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    Ok(())
}
