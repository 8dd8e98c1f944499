//! Client-facing surface of the store.
//!
//! Mutations route through the consensus core and resolve once the entry is
//! committed and applied; reads come straight from the local state machine
//! and may be stale on followers. Callers retrying a failed mutation must
//! reuse the same `(client_id, sequence)` pair so the command applies at
//! most once.

use std::sync::Arc;

use crate::error::StoreError;
use crate::kv::ApplyOutcome;
use crate::message::EntryKind;
use crate::raft::{RaftNode, Status};

#[derive(Clone)]
pub struct KvStore {
    node: Arc<RaftNode>,
}

impl KvStore {
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }

    /// Store `value` under `key`. Resolves to the stored value once the
    /// write is committed; fails with `NotLeader` on any other node.
    pub async fn put(
        &self,
        key: &str,
        value: &str,
        client_id: &str,
        sequence: u64,
    ) -> Result<String, StoreError> {
        let outcome = self
            .node
            .propose(
                EntryKind::Put,
                key.to_string(),
                Some(value.to_string()),
                client_id.to_string(),
                sequence,
            )
            .await?;
        match outcome {
            ApplyOutcome::Value(value) => Ok(value),
            _ => Err(StoreError::Shutdown),
        }
    }

    /// Remove `key`. Resolves to whether the key existed.
    pub async fn delete(
        &self,
        key: &str,
        client_id: &str,
        sequence: u64,
    ) -> Result<bool, StoreError> {
        let outcome = self
            .node
            .propose(
                EntryKind::Delete,
                key.to_string(),
                None,
                client_id.to_string(),
                sequence,
            )
            .await?;
        match outcome {
            ApplyOutcome::Removed(removed) => Ok(removed),
            _ => Err(StoreError::Shutdown),
        }
    }

    /// Local read; served without consulting the leader and therefore
    /// possibly stale.
    pub fn get(&self, key: &str) -> Option<String> {
        self.node.kv().get(key)
    }

    pub async fn status(&self) -> Status {
        self.node.status().await
    }
}
