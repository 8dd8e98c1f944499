//! The consensus core: roles, timers, elections, replication, commitment.
//!
//! One `RaftNode` per process. All consensus state lives behind a single
//! mutex; the transport delivers inbound frames through a queue consumed by
//! one task, so handlers never re-enter consensus locks. Client proposals
//! register a oneshot completion keyed by log index, resolved by the applier
//! once the entry commits and applies, or failed with `NotLeader` on
//! step-down.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::time::sleep;

use crate::error::StoreError;
use crate::kv::{ApplyOutcome, KvStateMachine};
use crate::log_store::LogStore;
use crate::message::{EntryKind, LogEntry, Message};
use crate::meta::{MetaStore, NodeMeta};
use crate::snapshot::{Snapshot, SnapshotStore, SNAPSHOT_THRESHOLD};
use crate::transport::PeerTransport;
use crate::NodeConfig;

/// Cap on entries carried by a single AppendEntries RPC.
const MAX_ENTRIES_PER_RPC: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Point-in-time view of a node, for operators and tests.
#[derive(Debug, Clone)]
pub struct Status {
    pub node_id: String,
    pub role: Role,
    pub term: u64,
    pub leader_id: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub log_size: usize,
    pub connected_peers: usize,
}

struct RaftState {
    current_term: u64,
    voted_for: Option<String>,
    role: Role,
    leader_id: Option<String>,
    last_heartbeat: Instant,
    votes_received: HashSet<String>,
    log: LogStore,

    // --- Leader-only volatile state ---
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,

    /// Completions for proposals awaiting apply, keyed by log index.
    pending: HashMap<u64, oneshot::Sender<Result<ApplyOutcome, StoreError>>>,
    shutting_down: bool,
}

pub struct RaftNode {
    config: NodeConfig,
    state: Mutex<RaftState>,
    kv: KvStateMachine,
    transport: Arc<PeerTransport>,
    meta: MetaStore,
    snapshots: SnapshotStore,
    apply_notify: Notify,
    shutdown_tx: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
    inbound_rx: std::sync::Mutex<Option<mpsc::Receiver<(String, Message)>>>,
}

impl RaftNode {
    /// Recover persistent state from the node's data directory and wire up
    /// the transport. Nothing runs until [`start`](Self::start).
    pub fn new(config: NodeConfig) -> Result<Arc<Self>> {
        let dir = config.node_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let meta_store = MetaStore::open(&dir);
        let meta = meta_store.load()?;

        let snapshots = SnapshotStore::new(&dir);
        let kv = KvStateMachine::new();
        let (snapshot_index, snapshot_term) = match snapshots.load()? {
            Some(snapshot) => {
                let boundary = (snapshot.last_included_index, snapshot.last_included_term);
                kv.restore(snapshot.data, snapshot.sequences);
                boundary
            }
            None => (0, 0),
        };

        let log = LogStore::open(&dir, snapshot_index, snapshot_term)?;
        info!(
            "[{}] recovered: term={} votedFor={:?} snapshot@{} log=[{}..={}]",
            config.node_id,
            meta.current_term,
            meta.voted_for,
            snapshot_index,
            log.first_index(),
            log.last_index()
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let transport = PeerTransport::new(
            config.node_id.clone(),
            config.listen_addr.clone(),
            config.peers.clone(),
            inbound_tx,
            shutdown.clone(),
        );

        Ok(Arc::new(Self {
            state: Mutex::new(RaftState {
                current_term: meta.current_term,
                voted_for: meta.voted_for,
                role: Role::Follower,
                leader_id: None,
                last_heartbeat: Instant::now(),
                votes_received: HashSet::new(),
                log,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                pending: HashMap::new(),
                shutting_down: false,
            }),
            config,
            kv,
            transport,
            meta: meta_store,
            snapshots,
            apply_notify: Notify::new(),
            shutdown_tx,
            shutdown,
            inbound_rx: std::sync::Mutex::new(Some(inbound_rx)),
        }))
    }

    /// Bind the transport and spawn the long-lived tasks: inbound dispatch,
    /// election timer, heartbeat tick, and the applier.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let inbound_rx = self
            .inbound_rx
            .lock()
            .expect("inbound receiver lock poisoned")
            .take()
            .context("node already started")?;

        Arc::clone(&self.transport).start().await?;

        let node = Arc::clone(&self);
        tokio::spawn(async move { node.run_inbound(inbound_rx).await });
        let node = Arc::clone(&self);
        tokio::spawn(async move { node.run_election_timer().await });
        let node = Arc::clone(&self);
        tokio::spawn(async move { node.run_heartbeats().await });
        let node = Arc::clone(&self);
        tokio::spawn(async move { node.run_applier().await });
        Ok(())
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// The local state machine; reads served from here may be stale.
    pub fn kv(&self) -> &KvStateMachine {
        &self.kv
    }

    /// Sever or restore this node's links to every peer, as if the network
    /// partitioned it away. Consensus state and timers are untouched; the
    /// node simply stops hearing from (and reaching) the rest of the
    /// cluster until healed.
    pub async fn set_partitioned(&self, partitioned: bool) {
        self.transport.set_partitioned(partitioned).await;
    }

    pub async fn status(&self) -> Status {
        let (role, term, leader_id, commit_index, last_applied, log_size) = {
            let state = self.state.lock().await;
            (
                state.role,
                state.current_term,
                state.leader_id.clone(),
                state.log.commit_index(),
                state.log.last_applied(),
                state.log.size(),
            )
        };
        Status {
            node_id: self.config.node_id.clone(),
            role,
            term,
            leader_id,
            commit_index,
            last_applied,
            log_size,
            connected_peers: self.transport.connected_peers().await,
        }
    }

    /// Stop participating: fail pending client futures, persist term/vote,
    /// and signal every task and socket to wind down.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock().await;
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            for (_, tx) in state.pending.drain() {
                let _ = tx.send(Err(StoreError::Shutdown));
            }
            if let Err(e) = self.persist_meta(&state) {
                error!(
                    "[{}] failed to persist meta during shutdown: {}",
                    self.config.node_id, e
                );
            }
        }
        let _ = self.shutdown_tx.send(true);
        info!("[{}] shut down", self.config.node_id);
    }

    // --- Client proposals ---

    /// Append a client command to the leader's log and wait for the applier
    /// to resolve it. Fails fast with `NotLeader` elsewhere.
    pub(crate) async fn propose(
        &self,
        kind: EntryKind,
        key: String,
        value: Option<String>,
        client_id: String,
        sequence: u64,
    ) -> Result<ApplyOutcome, StoreError> {
        let rx = {
            let mut state = self.state.lock().await;
            if state.shutting_down {
                return Err(StoreError::Shutdown);
            }
            if state.role != Role::Leader {
                return Err(StoreError::NotLeader {
                    leader: state.leader_id.clone(),
                });
            }
            let entry = LogEntry {
                index: state.log.last_index() + 1,
                term: state.current_term,
                kind,
                key,
                value,
                client_id: Some(client_id),
                sequence: Some(sequence),
            };
            let index = entry.index;
            if let Err(e) = state.log.append(entry) {
                error!(
                    "[{}] failed to persist proposal at {}: {}",
                    self.config.node_id, index, e
                );
                drop(state);
                self.shutdown().await;
                return Err(StoreError::Shutdown);
            }
            let (tx, rx) = oneshot::channel();
            state.pending.insert(index, tx);
            // A single-node cluster commits as soon as the entry is durable.
            self.advance_leader_commit(&mut state);
            rx
        };

        // Replicate right away instead of waiting out the heartbeat tick.
        self.replicate_to_all().await;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Shutdown),
        }
    }

    // --- Long-lived tasks ---

    async fn run_inbound(self: Arc<Self>, mut rx: mpsc::Receiver<(String, Message)>) {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return;
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                inbound = rx.recv() => match inbound {
                    Some((from, message)) => {
                        if let Err(e) = self.handle_message(from, message).await {
                            // A failed write of term, vote or log means we can
                            // no longer acknowledge anything: stop instead.
                            error!("[{}] halting consensus: {}", self.config.node_id, e);
                            self.shutdown().await;
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    async fn run_election_timer(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return;
        }
        loop {
            let timeout = self.random_election_timeout();
            tokio::select! {
                _ = sleep(timeout) => {}
                _ = shutdown.changed() => break,
            }
            let due = {
                let state = self.state.lock().await;
                state.role != Role::Leader && state.last_heartbeat.elapsed() >= timeout
            };
            if due {
                if let Err(e) = self.start_election().await {
                    error!("[{}] halting consensus: {}", self.config.node_id, e);
                    self.shutdown().await;
                    break;
                }
            }
        }
    }

    async fn run_heartbeats(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return;
        }
        let interval = Duration::from_millis(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
            self.replicate_to_all().await;
        }
    }

    /// Drain committed entries into the state machine in index order and
    /// resolve the client futures registered for them.
    async fn run_applier(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return;
        }
        loop {
            tokio::select! {
                _ = self.apply_notify.notified() => {}
                _ = shutdown.changed() => break,
            }
            loop {
                // Only this task ever advances last_applied, so reading it
                // here and writing it after the batch is safe.
                let (applied, entries, mut completions) = {
                    let mut state = self.state.lock().await;
                    let applied = state.log.last_applied();
                    let commit = state.log.commit_index();
                    if applied >= commit {
                        break;
                    }
                    let entries: Vec<LogEntry> = state
                        .log
                        .entries_from(applied + 1)
                        .iter()
                        .take((commit - applied) as usize)
                        .cloned()
                        .collect();
                    if entries.is_empty() {
                        // The gap was compacted away by a snapshot install.
                        break;
                    }
                    let mut completions = HashMap::new();
                    for entry in &entries {
                        if let Some(tx) = state.pending.remove(&entry.index) {
                            completions.insert(entry.index, tx);
                        }
                    }
                    (applied, entries, completions)
                };
                for entry in &entries {
                    let outcome = self.kv.apply(entry);
                    if let Some(tx) = completions.remove(&entry.index) {
                        let _ = tx.send(Ok(outcome));
                    }
                }
                {
                    let mut state = self.state.lock().await;
                    state
                        .log
                        .set_last_applied(applied + entries.len() as u64);
                }
                if let Err(e) = self.maybe_snapshot().await {
                    error!("[{}] snapshot failed: {}", self.config.node_id, e);
                }
            }
        }
    }

    // --- Elections ---

    fn random_election_timeout(&self) -> Duration {
        let timeout_ms = rand::thread_rng()
            .gen_range(self.config.election_timeout_min..=self.config.election_timeout_max);
        Duration::from_millis(timeout_ms)
    }

    fn majority(&self) -> usize {
        (self.config.peers.len() + 1) / 2 + 1
    }

    async fn start_election(&self) -> Result<()> {
        let request = {
            let mut state = self.state.lock().await;
            if state.role == Role::Leader || state.shutting_down {
                return Ok(());
            }
            state.role = Role::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.config.node_id.clone());
            state.leader_id = None;
            state.votes_received.clear();
            state.votes_received.insert(self.config.node_id.clone());
            state.last_heartbeat = Instant::now();
            // Term and self-vote must be durable before soliciting votes.
            self.persist_meta(&state)?;
            info!(
                "[{}] starting election for term {}",
                self.config.node_id, state.current_term
            );
            if state.votes_received.len() >= self.majority() {
                // Single-node cluster: won already.
                self.become_leader(&mut state)?;
                None
            } else {
                Some(Message::RequestVote {
                    term: state.current_term,
                    candidate_id: self.config.node_id.clone(),
                    last_log_index: state.log.last_index(),
                    last_log_term: state.log.last_term(),
                })
            }
        };
        match request {
            Some(message) => self.transport.broadcast(message).await,
            None => self.replicate_to_all().await,
        }
        Ok(())
    }

    fn become_leader(&self, state: &mut RaftState) -> Result<()> {
        info!(
            "[{}] became leader for term {} ({} votes)",
            self.config.node_id,
            state.current_term,
            state.votes_received.len()
        );
        state.role = Role::Leader;
        state.leader_id = Some(self.config.node_id.clone());
        let next = state.log.last_index() + 1;
        state.next_index.clear();
        state.match_index.clear();
        for peer in self.config.peers.keys() {
            state.next_index.insert(peer.clone(), next);
            state.match_index.insert(peer.clone(), 0);
        }
        // First entry of the new term; earlier-term entries become
        // committable once it replicates, since only current-term entries
        // commit by counting.
        let entry = LogEntry::no_op(next, state.current_term);
        state.log.append(entry)?;
        self.advance_leader_commit(state);
        Ok(())
    }

    // --- Inbound message handling ---

    async fn handle_message(&self, from: String, message: Message) -> Result<()> {
        match message {
            Message::Hello { .. } => Ok(()),
            Message::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                self.on_request_vote(term, candidate_id, last_log_index, last_log_term)
                    .await
            }
            Message::RequestVoteResponse {
                term,
                vote_granted,
                voter_id,
            } => self.on_vote_response(term, vote_granted, voter_id).await,
            Message::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                self.on_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                )
                .await
            }
            Message::AppendEntriesResponse {
                term,
                success,
                match_index,
                follower_id: _,
            } => self.on_append_response(from, term, success, match_index).await,
            Message::InstallSnapshot {
                term,
                leader_id,
                last_included_index,
                last_included_term,
                data,
                sequences,
            } => {
                self.on_install_snapshot(
                    term,
                    leader_id,
                    last_included_index,
                    last_included_term,
                    data,
                    sequences,
                )
                .await
            }
            Message::InstallSnapshotResponse {
                term,
                follower_id: _,
            } => self.on_snapshot_response(from, term).await,
        }
    }

    async fn on_request_vote(
        &self,
        term: u64,
        candidate_id: String,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Result<()> {
        let reply = {
            let mut state = self.state.lock().await;
            self.observe_term(&mut state, term)?;
            let mut vote_granted = false;
            if term == state.current_term
                && (state.voted_for.is_none()
                    || state.voted_for.as_deref() == Some(candidate_id.as_str()))
            {
                let up_to_date = last_log_term > state.log.last_term()
                    || (last_log_term == state.log.last_term()
                        && last_log_index >= state.log.last_index());
                if up_to_date {
                    state.voted_for = Some(candidate_id.clone());
                    state.last_heartbeat = Instant::now();
                    // The vote must be durable before the reply leaves.
                    self.persist_meta(&state)?;
                    vote_granted = true;
                    info!(
                        "[{}] granted vote to {} for term {}",
                        self.config.node_id, candidate_id, term
                    );
                } else {
                    debug!(
                        "[{}] denied vote to {}: candidate log ({}, {}) behind ours ({}, {})",
                        self.config.node_id,
                        candidate_id,
                        last_log_term,
                        last_log_index,
                        state.log.last_term(),
                        state.log.last_index()
                    );
                }
            }
            Message::RequestVoteResponse {
                term: state.current_term,
                vote_granted,
                voter_id: self.config.node_id.clone(),
            }
        };
        self.transport.send(&candidate_id, reply).await;
        Ok(())
    }

    async fn on_vote_response(
        &self,
        term: u64,
        vote_granted: bool,
        voter_id: String,
    ) -> Result<()> {
        let became_leader = {
            let mut state = self.state.lock().await;
            self.observe_term(&mut state, term)?;
            if state.role != Role::Candidate || term != state.current_term || !vote_granted {
                return Ok(());
            }
            state.votes_received.insert(voter_id);
            if state.votes_received.len() >= self.majority() {
                self.become_leader(&mut state)?;
                true
            } else {
                false
            }
        };
        if became_leader {
            self.replicate_to_all().await;
        }
        Ok(())
    }

    async fn on_append_entries(
        &self,
        term: u64,
        leader_id: String,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> Result<()> {
        let reply = {
            let mut state = self.state.lock().await;
            self.observe_term(&mut state, term)?;
            if term < state.current_term {
                Message::AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                    match_index: state.log.last_index(),
                    follower_id: self.config.node_id.clone(),
                }
            } else {
                if state.role != Role::Follower {
                    self.step_down(&mut state);
                }
                state.leader_id = Some(leader_id.clone());
                state.last_heartbeat = Instant::now();

                let entry_count = entries.len() as u64;
                if state.log.append_all(prev_log_index, prev_log_term, entries)? {
                    let match_index = prev_log_index + entry_count;
                    // Commit only what we have verified matches the leader.
                    if state.log.advance_commit(leader_commit.min(match_index)) {
                        self.apply_notify.notify_one();
                    }
                    Message::AppendEntriesResponse {
                        term: state.current_term,
                        success: true,
                        match_index,
                        follower_id: self.config.node_id.clone(),
                    }
                } else {
                    debug!(
                        "[{}] append mismatch at prev index {} (term {}), our last is {}",
                        self.config.node_id,
                        prev_log_index,
                        prev_log_term,
                        state.log.last_index()
                    );
                    Message::AppendEntriesResponse {
                        term: state.current_term,
                        success: false,
                        // Rewind hint: the leader can jump straight here.
                        match_index: state.log.last_index(),
                        follower_id: self.config.node_id.clone(),
                    }
                }
            }
        };
        self.transport.send(&leader_id, reply).await;
        Ok(())
    }

    async fn on_append_response(
        &self,
        from: String,
        term: u64,
        success: bool,
        match_index: u64,
    ) -> Result<()> {
        let followup = {
            let mut state = self.state.lock().await;
            self.observe_term(&mut state, term)?;
            if state.role != Role::Leader || term != state.current_term {
                return Ok(());
            }
            if success {
                let known = state.match_index.get(&from).copied().unwrap_or(0);
                if match_index > known {
                    state.match_index.insert(from.clone(), match_index);
                }
                let next = state.next_index.get(&from).copied().unwrap_or(1);
                if match_index + 1 > next {
                    state.next_index.insert(from.clone(), match_index + 1);
                }
                self.advance_leader_commit(&mut state);
                // Keep a catching-up follower moving without waiting for the
                // next heartbeat tick.
                let next = state.next_index.get(&from).copied().unwrap_or(1);
                if state.log.last_index() >= next {
                    self.build_replication(&state, &from)
                } else {
                    None
                }
            } else {
                let next = state.next_index.get(&from).copied().unwrap_or(1);
                let rewound = next
                    .saturating_sub(1)
                    .min(match_index.saturating_add(1))
                    .max(1);
                debug!(
                    "[{}] rewinding next_index[{}] {} -> {}",
                    self.config.node_id, from, next, rewound
                );
                state.next_index.insert(from.clone(), rewound);
                self.build_replication(&state, &from)
            }
        };
        if let Some(message) = followup {
            self.transport.send(&from, message).await;
        }
        Ok(())
    }

    async fn on_install_snapshot(
        &self,
        term: u64,
        leader_id: String,
        last_included_index: u64,
        last_included_term: u64,
        data: HashMap<String, String>,
        sequences: HashMap<String, u64>,
    ) -> Result<()> {
        let reply = {
            let mut state = self.state.lock().await;
            self.observe_term(&mut state, term)?;
            if term == state.current_term {
                if state.role != Role::Follower {
                    self.step_down(&mut state);
                }
                state.leader_id = Some(leader_id.clone());
                state.last_heartbeat = Instant::now();

                if last_included_index > state.log.last_applied() {
                    info!(
                        "[{}] installing snapshot at index {} (term {})",
                        self.config.node_id, last_included_index, last_included_term
                    );
                    let snapshot = Snapshot {
                        last_included_index,
                        last_included_term,
                        data,
                        sequences,
                    };
                    // Durable before we replace the state it supersedes.
                    self.snapshots.save(&snapshot)?;
                    self.kv.restore(snapshot.data, snapshot.sequences);
                    state
                        .log
                        .reset_to_snapshot(last_included_index, last_included_term)?;
                } else {
                    debug!(
                        "[{}] ignoring snapshot at {} behind applied {}",
                        self.config.node_id,
                        last_included_index,
                        state.log.last_applied()
                    );
                }
            }
            Message::InstallSnapshotResponse {
                term: state.current_term,
                follower_id: self.config.node_id.clone(),
            }
        };
        self.transport.send(&leader_id, reply).await;
        Ok(())
    }

    async fn on_snapshot_response(&self, from: String, term: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        self.observe_term(&mut state, term)?;
        if state.role != Role::Leader || term != state.current_term {
            return Ok(());
        }
        // The follower now holds everything up to our compaction boundary;
        // AppendEntries resumes right after it.
        let boundary = state.log.snapshot_index();
        let known = state.match_index.get(&from).copied().unwrap_or(0);
        if boundary > known {
            state.match_index.insert(from.clone(), boundary);
        }
        let next = state.next_index.get(&from).copied().unwrap_or(1);
        if boundary + 1 > next {
            state.next_index.insert(from.clone(), boundary + 1);
        }
        Ok(())
    }

    // --- Shared transitions ---

    /// Adopt a higher term: persist it with the vote cleared, then fall back
    /// to follower.
    fn observe_term(&self, state: &mut RaftState, term: u64) -> Result<()> {
        if term > state.current_term {
            info!(
                "[{}] observed term {} above {}, stepping down",
                self.config.node_id, term, state.current_term
            );
            state.current_term = term;
            state.voted_for = None;
            state.leader_id = None;
            self.step_down(state);
            self.persist_meta(state)?;
        }
        Ok(())
    }

    /// Fall back to follower. Outstanding proposals can no longer be resolved
    /// by this node, so their futures fail with `NotLeader`.
    fn step_down(&self, state: &mut RaftState) {
        if state.role != Role::Follower {
            info!(
                "[{}] becoming follower in term {}",
                self.config.node_id, state.current_term
            );
        }
        state.role = Role::Follower;
        state.votes_received.clear();
        state.last_heartbeat = Instant::now();
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(StoreError::NotLeader {
                leader: state.leader_id.clone(),
            }));
        }
    }

    fn persist_meta(&self, state: &RaftState) -> Result<()> {
        self.meta.save(&NodeMeta {
            current_term: state.current_term,
            voted_for: state.voted_for.clone(),
        })
    }

    // --- Replication (leader) ---

    /// What the leader should send `peer` right now: the next slice of log
    /// entries, or a snapshot when the peer is behind our compaction
    /// boundary. A heartbeat is the empty-entries case of the same message.
    fn build_replication(&self, state: &RaftState, peer: &str) -> Option<Message> {
        let next = state
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(state.log.last_index() + 1);
        if next < state.log.first_index() {
            let snapshot = match self.snapshots.load() {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => return None,
                Err(e) => {
                    warn!(
                        "[{}] could not load snapshot for {}: {}",
                        self.config.node_id, peer, e
                    );
                    return None;
                }
            };
            return Some(Message::InstallSnapshot {
                term: state.current_term,
                leader_id: self.config.node_id.clone(),
                last_included_index: snapshot.last_included_index,
                last_included_term: snapshot.last_included_term,
                data: snapshot.data,
                sequences: snapshot.sequences,
            });
        }
        let prev_log_index = next - 1;
        let prev_log_term = state.log.term_at(prev_log_index).unwrap_or(0);
        let entries: Vec<LogEntry> = state
            .log
            .entries_from(next)
            .iter()
            .take(MAX_ENTRIES_PER_RPC)
            .cloned()
            .collect();
        Some(Message::AppendEntries {
            term: state.current_term,
            leader_id: self.config.node_id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: state.log.commit_index(),
        })
    }

    async fn replicate_to_all(&self) {
        let outbox = {
            let state = self.state.lock().await;
            if state.role != Role::Leader {
                return;
            }
            let mut outbox = Vec::with_capacity(self.config.peers.len());
            for peer in self.config.peers.keys() {
                if let Some(message) = self.build_replication(&state, peer) {
                    outbox.push((peer.clone(), message));
                }
            }
            outbox
        };
        for (peer, message) in outbox {
            self.transport.send(&peer, message).await;
        }
    }

    /// Leader commitment rule: the highest index replicated on a majority
    /// whose entry carries the current term becomes the commit index.
    fn advance_leader_commit(&self, state: &mut RaftState) {
        let majority = self.majority();
        let mut target = state.log.commit_index();
        for index in (state.log.commit_index() + 1)..=state.log.last_index() {
            let replicas = 1 + self
                .config
                .peers
                .keys()
                .filter(|peer| state.match_index.get(*peer).copied().unwrap_or(0) >= index)
                .count();
            // Entries from earlier terms never commit by counting replicas;
            // they commit transitively under a current-term entry.
            if replicas >= majority && state.log.term_at(index) == Some(state.current_term) {
                target = index;
            }
        }
        if state.log.advance_commit(target) {
            debug!(
                "[{}] commit index advanced to {}",
                self.config.node_id,
                state.log.commit_index()
            );
            self.apply_notify.notify_one();
        }
    }

    /// Capture a snapshot and compact the log once enough applied entries
    /// accumulate.
    async fn maybe_snapshot(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let applied = state.log.last_applied();
        if applied.saturating_sub(state.log.snapshot_index()) < SNAPSHOT_THRESHOLD {
            return Ok(());
        }
        let Some(term) = state.log.term_at(applied) else {
            return Ok(());
        };
        let (data, sequences) = self.kv.image();
        let snapshot = Snapshot {
            last_included_index: applied,
            last_included_term: term,
            data,
            sequences,
        };
        self.snapshots.save(&snapshot)?;
        state.log.delete_up_to(applied)?;
        info!(
            "[{}] snapshot at index {} (term {}), log compacted to {} entries",
            self.config.node_id,
            applied,
            term,
            state.log.size()
        );
        Ok(())
    }
}
