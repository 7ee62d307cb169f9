//! Mesh Ledger Node
//!
//! Joins a peer mesh over WebSocket, optionally registers with a relay
//! tracker, takes part in leader election and serves the JSON-RPC API.
//! State is persisted per network and survives restarts.

use anyhow::Result;
use clap::Parser;
use mesh_ledger::SnapshotStore;
use mesh_sync::{HttpRpcServer, MeshNode, RelayHandle, SystemClock, WsTransport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{NodeConfig, Overrides};

const STATUS_LOG_SECS: u64 = 60;

/// Mesh ledger node
#[derive(Parser, Debug)]
#[command(name = "mesh-node")]
#[command(about = "Peer-to-peer ledger with leader election and order matching", long_about = None)]
struct Args {
    /// JSON config file, flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node identifier (generated when omitted)
    #[arg(long)]
    node_id: Option<String>,

    /// Network to join
    #[arg(long)]
    network: Option<String>,

    /// Peer WebSocket bind address
    #[arg(long)]
    listen: Option<String>,

    /// Peer address to dial, repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Relay tracker URL
    #[arg(long)]
    relay_url: Option<String>,

    /// HTTP RPC bind address
    #[arg(long)]
    rpc_addr: Option<String>,

    /// Data directory for persistent state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Save state every N seconds (0 = only on shutdown)
    #[arg(long)]
    save_interval_secs: Option<u64>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            node_id: self.node_id.clone(),
            network: self.network.clone(),
            listen: self.listen.clone(),
            peers: self.peers.clone(),
            relay_url: self.relay_url.clone(),
            rpc_addr: self.rpc_addr.clone(),
            data_dir: self.data_dir.clone(),
            log_level: self.log_level.clone(),
            save_interval_secs: self.save_interval_secs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let base = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    let config = base.merge(args.overrides());

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    run(config).await
}

async fn run(config: NodeConfig) -> Result<()> {
    let mesh_config = config.mesh_config();

    tracing::info!("Starting mesh node {}", mesh_config.node_id);
    tracing::info!("  Network: {}", mesh_config.network_id);
    tracing::info!("  HTTP RPC: {}", config.rpc_addr);
    tracing::info!("  Relay: {}", config.relay.url.as_deref().unwrap_or("none"));
    tracing::info!("  Data directory: {:?}", config.data_dir);
    tracing::info!("  Save interval: {}s", config.save_interval_secs);

    // Create data directory if it doesn't exist
    std::fs::create_dir_all(&config.data_dir)?;
    let store = SnapshotStore::open(&config.data_dir)?;

    // Peer transport
    let (transport, transport_rx) = WsTransport::new(mesh_config.node_id.clone(), mesh_config.network_id.clone());
    if let Some(listen) = &config.listen {
        let addr = transport.listen(listen).await?;
        tracing::info!("Accepting peers on {}", addr);
    }
    for peer in &config.peers {
        transport.dial(peer);
    }

    // Relay tracker
    let (relay_tx, relay_rx) = mpsc::unbounded_channel();
    let relay = RelayHandle::spawn(config.relay.clone(), mesh_config.network_id.clone(), relay_tx);

    let mut node = MeshNode::new(mesh_config, Arc::new(transport), relay, Arc::new(SystemClock)).with_store(store);
    match node.load_snapshot() {
        Ok(true) => tracing::info!(
            "Loaded state from disk: height {}, {} pending",
            node.ledger().height(),
            node.ledger().pending_count()
        ),
        Ok(false) => tracing::info!("No existing state found, starting fresh"),
        Err(e) => tracing::error!("Failed to load state, starting fresh: {}", e),
    }

    let (handle, node_task) = node.spawn(transport_rx, relay_rx);

    // Start HTTP RPC server
    let rpc_handle = handle.clone();
    let rpc_addr = config.rpc_addr.clone();
    let http_server = tokio::spawn(async move {
        let server = HttpRpcServer::new(rpc_handle);
        if let Err(e) = server.run(&rpc_addr).await {
            tracing::error!("HTTP RPC server error: {}", e);
        }
    });

    // Log node stats periodically
    let stats_handle = handle.clone();
    let stats_logger = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(STATUS_LOG_SECS));
        interval.tick().await;
        loop {
            interval.tick().await;
            let Ok(status) = stats_handle.status().await else {
                break;
            };
            tracing::info!(
                "Height {}: {} peers, {:?}, leader {}, {} resting orders",
                status.ledger.height,
                status.peers.len(),
                status.connection,
                status.leadership.current_leader.as_deref().unwrap_or("none"),
                status.resting_orders
            );
        }
    });

    tracing::info!("Mesh node running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");

    // The node task saves its final snapshot before exiting
    if let Err(e) = handle.shutdown().await {
        tracing::warn!("Node task already stopped: {}", e);
    }
    if let Err(e) = node_task.await {
        tracing::error!("Node task failed: {}", e);
    }

    http_server.abort();
    stats_logger.abort();

    tracing::info!("Mesh node stopped");

    Ok(())
}
