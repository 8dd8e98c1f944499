//! Wire message types and the length-delimited frame codec.
//!
//! Every peer RPC travels as a 4-byte big-endian length prefix followed by
//! that many bytes of UTF-8 JSON. A single tagged [`Message`] enum carries
//! all variants; unknown JSON fields are ignored, unknown `type` values fail
//! to decode and the caller drops the frame.

use std::collections::HashMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Anything larger is treated as a decode
/// failure rather than an allocation request.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// What a log entry does to the state machine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Put,
    Delete,
    /// Appended by a new leader to make prior-term entries committable.
    /// Never surfaced to clients.
    NoOp,
}

/// A single replicated log entry. Also the on-disk log line format:
/// one JSON object per line in `raft.log`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// 1-based, contiguous position in the log.
    pub index: u64,
    /// Term of the leader that created the entry.
    pub term: u64,
    pub kind: EntryKind,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl LogEntry {
    pub fn put(
        index: u64,
        term: u64,
        key: String,
        value: String,
        client_id: String,
        sequence: u64,
    ) -> Self {
        Self {
            index,
            term,
            kind: EntryKind::Put,
            key,
            value: Some(value),
            client_id: Some(client_id),
            sequence: Some(sequence),
        }
    }

    pub fn delete(index: u64, term: u64, key: String, client_id: String, sequence: u64) -> Self {
        Self {
            index,
            term,
            kind: EntryKind::Delete,
            key,
            value: None,
            client_id: Some(client_id),
            sequence: Some(sequence),
        }
    }

    pub fn no_op(index: u64, term: u64) -> Self {
        Self {
            index,
            term,
            kind: EntryKind::NoOp,
            key: String::new(),
            value: None,
            client_id: None,
            sequence: None,
        }
    }
}

// --- PEER RPC MESSAGES ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Message {
    /// Identifying handshake, sent once by the initiator of a connection.
    Hello { node_id: String },
    RequestVote {
        term: u64,
        candidate_id: String,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteResponse {
        term: u64,
        vote_granted: bool,
        voter_id: String,
    },
    AppendEntries {
        term: u64,
        leader_id: String,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesResponse {
        term: u64,
        success: bool,
        /// On success: index of the last entry now present on the follower.
        /// On failure: the follower's last log index, a rewind hint for the
        /// leader's `next_index`.
        match_index: u64,
        follower_id: String,
    },
    InstallSnapshot {
        term: u64,
        leader_id: String,
        last_included_index: u64,
        last_included_term: u64,
        data: HashMap<String, String>,
        sequences: HashMap<String, u64>,
    },
    InstallSnapshotResponse {
        term: u64,
        follower_id: String,
    },
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        bail!("outbound frame of {} bytes exceeds limit", payload.len());
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame without decoding it. An error here means
/// the connection itself is unusable.
pub async fn read_raw_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        bail!("inbound frame length {} exceeds limit", len);
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Decode a frame payload. A failure here is a bad frame, not a bad
/// connection: callers drop the frame and keep reading.
pub fn decode(payload: &[u8]) -> Result<Message> {
    Ok(serde_json::from_slice(payload)?)
}

/// Read one length-prefixed JSON frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let payload = read_raw_frame(reader).await?;
    decode(&payload)
}
