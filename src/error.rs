//! Errors surfaced to clients of the store.
//!
//! Everything else (stale terms, lost connections, decode failures) is
//! handled internally through role transitions and retries; a persistence
//! failure stops the node instead of propagating here.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The operation was sent to a node that is not the leader. Retry on the
    /// hinted leader, reusing the same client id and sequence number.
    #[error("not the leader (known leader: {})", .leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    /// The node is shutting down; the operation may or may not have been
    /// committed.
    #[error("node is shutting down")]
    Shutdown,
}
