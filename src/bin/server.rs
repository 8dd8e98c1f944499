use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use raftkv::{KvStore, NodeConfig, RaftNode};

/// One node of a raftkv cluster.
#[derive(Parser, Debug)]
#[command(name = "raftkv-server")]
struct Args {
    /// Unique node id within the cluster
    #[arg(long)]
    id: String,

    /// host:port to bind the Raft listener on
    #[arg(long)]
    listen: String,

    /// Peer in the form id=host:port; repeat once per peer
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Directory for log, snapshot and metadata files
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut peers = HashMap::new();
    for peer in &args.peers {
        let (id, addr) = peer
            .split_once('=')
            .with_context(|| format!("peer '{peer}' must be id=host:port"))?;
        peers.insert(id.to_string(), addr.to_string());
    }

    info!("starting node {} on {}", args.id, args.listen);
    info!("peers: {:?}", peers);

    let config = NodeConfig::new(args.id, args.listen, peers, args.data_dir);
    let node = RaftNode::new(config)?;
    Arc::clone(&node).start().await?;
    let store = KvStore::new(Arc::clone(&node));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(5)) => {
                let status = store.status().await;
                info!(
                    "status: role={:?} term={} leader={:?} commit={} applied={} log={} peers={}",
                    status.role,
                    status.term,
                    status.leader_id,
                    status.commit_index,
                    status.last_applied,
                    status.log_size,
                    status.connected_peers
                );
            }
        }
    }

    info!("shutting down");
    node.shutdown().await;
    Ok(())
}
