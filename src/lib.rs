//! raftkv: a replicated in-memory key-value store.
//!
//! A fixed cluster of nodes elects a leader, replicates a totally ordered
//! log of PUT/DELETE commands, and applies them to an in-memory map. Writes
//! go to the leader and resolve once committed on a majority; reads are
//! served locally by any node and may be stale.

use std::collections::HashMap;
use std::path::PathBuf;

pub mod error;
pub mod kv;
pub mod log_store;
pub mod message;
pub mod meta;
pub mod raft;
pub mod snapshot;
pub mod store;
pub mod transport;

pub use crate::error::StoreError;
pub use crate::kv::ApplyOutcome;
pub use crate::message::{EntryKind, LogEntry, Message};
pub use crate::raft::{RaftNode, Role, Status};
pub use crate::store::KvStore;

/// Static configuration for one node of the cluster.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    /// host:port the node's Raft listener binds to.
    pub listen_addr: String,
    /// Every other node in the cluster: peer id -> host:port.
    pub peers: HashMap<String, String>,
    /// Root directory; this node's files live under `node-<id>/`.
    pub data_dir: PathBuf,
    pub election_timeout_min: u64, // milliseconds
    pub election_timeout_max: u64, // milliseconds
    pub heartbeat_interval: u64,   // milliseconds
}

impl NodeConfig {
    pub fn new(
        node_id: String,
        listen_addr: String,
        peers: HashMap<String, String>,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            node_id,
            listen_addr,
            peers,
            data_dir,
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
        }
    }

    /// Directory holding this node's log, snapshot and metadata files.
    pub fn node_dir(&self) -> PathBuf {
        self.data_dir.join(format!("node-{}", self.node_id))
    }
}
