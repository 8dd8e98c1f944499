//! Peer-to-peer transport: one persistent TCP link per configured peer.
//!
//! Each node binds a listener on its Raft port and dials every configured
//! peer. The initiator of a connection sends a HELLO frame identifying
//! itself; the accepting side adopts the socket for that peer. When both
//! sides dial each other, the link initiated by the lower node id wins and
//! the other is closed, so exactly one link survives per pair.
//!
//! Inbound frames are never handled on the connection task: they are pushed
//! onto a single queue the consensus core drains, which keeps readers
//! non-blocking and consensus locks out of the transport. Sends are
//! fire-and-forget; a frame for a disconnected peer is dropped and the
//! consensus timers take care of retrying.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::sleep;

use crate::message::{decode, read_frame, read_raw_frame, write_frame, Message};

/// Initial reconnect delay; doubles up to [`RECONNECT_MAX`] and never gives up.
const RECONNECT_MIN: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(2);

/// Outbound frames queued per link before sends start getting dropped.
const OUTBOUND_QUEUE: usize = 256;

struct Link {
    tx: mpsc::Sender<Message>,
    /// Node id of the side that dialed this connection; the tie-break key.
    initiator: String,
    generation: u64,
}

pub struct PeerTransport {
    node_id: String,
    listen_addr: String,
    peers: HashMap<String, String>,
    links: Mutex<HashMap<String, Link>>,
    inbound: mpsc::Sender<(String, Message)>,
    generation: AtomicU64,
    /// While set, the node can neither send nor receive: links are severed
    /// and new ones are refused until the partition lifts.
    partitioned: AtomicBool,
    shutdown: watch::Receiver<bool>,
}

impl PeerTransport {
    pub fn new(
        node_id: String,
        listen_addr: String,
        peers: HashMap<String, String>,
        inbound: mpsc::Sender<(String, Message)>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            listen_addr,
            peers,
            links: Mutex::new(HashMap::new()),
            inbound,
            generation: AtomicU64::new(0),
            partitioned: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Bind the listener and spawn the acceptor plus one connector per peer.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let listener = bind_reusable(&self.listen_addr)
            .with_context(|| format!("failed to bind raft listener on {}", self.listen_addr))?;
        info!("[{}] raft listener on {}", self.node_id, self.listen_addr);

        let transport = Arc::clone(&self);
        tokio::spawn(async move {
            transport.run_acceptor(listener).await;
        });

        for (peer_id, addr) in self.peers.clone() {
            let transport = Arc::clone(&self);
            tokio::spawn(async move {
                transport.run_connector(peer_id, addr).await;
            });
        }
        Ok(())
    }

    /// Sever every live link and refuse new ones until the partition lifts;
    /// connectors keep retrying through the normal backoff path and
    /// re-establish links once it does.
    pub async fn set_partitioned(&self, partitioned: bool) {
        self.partitioned.store(partitioned, Ordering::SeqCst);
        if partitioned {
            let mut links = self.links.lock().await;
            let dropped = links.len();
            links.clear();
            info!("[{}] partitioned: dropped {} links", self.node_id, dropped);
        } else {
            info!("[{}] partition healed", self.node_id);
        }
    }

    fn is_partitioned(&self) -> bool {
        self.partitioned.load(Ordering::SeqCst)
    }

    /// Enqueue a frame for one peer. Returns false when no live link exists
    /// or the link's queue is full; the frame is dropped either way.
    pub async fn send(&self, peer_id: &str, message: Message) -> bool {
        if self.is_partitioned() {
            return false;
        }
        let links = self.links.lock().await;
        match links.get(peer_id) {
            Some(link) => link.tx.try_send(message).is_ok(),
            None => false,
        }
    }

    /// Best-effort send to every connected peer.
    pub async fn broadcast(&self, message: Message) {
        if self.is_partitioned() {
            return;
        }
        let links = self.links.lock().await;
        for (peer_id, link) in links.iter() {
            if link.tx.try_send(message.clone()).is_err() {
                debug!("[{}] dropping frame for {}", self.node_id, peer_id);
            }
        }
    }

    pub async fn connected_peers(&self) -> usize {
        self.links.lock().await.len()
    }

    async fn run_acceptor(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return;
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let transport = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = transport.adopt_incoming(stream, addr).await {
                                debug!("[{}] inbound link from {} failed: {}",
                                       transport.node_id, addr, e);
                            }
                        });
                    }
                    Err(e) => error!("[{}] accept failed: {}", self.node_id, e),
                },
            }
        }
    }

    /// Read the peer's HELLO and, if it names a configured peer, run the
    /// link. The dialing side is the initiator.
    async fn adopt_incoming(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        if self.is_partitioned() {
            bail!("partitioned, refusing connection from {}", addr);
        }
        let peer_id = match read_frame(&mut stream).await? {
            Message::Hello { node_id } => node_id,
            other => bail!("expected HELLO from {}, got {:?}", addr, other),
        };
        if !self.peers.contains_key(&peer_id) {
            bail!("unknown peer {} connected from {}", peer_id, addr);
        }
        let initiator = peer_id.clone();
        self.run_link(peer_id, stream, initiator).await;
        Ok(())
    }

    /// Dial one peer forever, with exponential backoff between attempts.
    async fn run_connector(self: Arc<Self>, peer_id: String, addr: String) {
        let mut shutdown = self.shutdown.clone();
        let mut backoff = RECONNECT_MIN;
        loop {
            if *shutdown.borrow() {
                break;
            }
            // A link may already exist via the peer's own dial; don't race it.
            if self.is_partitioned() || self.links.lock().await.contains_key(&peer_id) {
                tokio::select! {
                    _ = sleep(RECONNECT_MAX) => {}
                    _ = shutdown.changed() => break,
                }
                backoff = RECONNECT_MIN;
                continue;
            }

            match TcpStream::connect(&addr).await {
                Ok(mut stream) => {
                    backoff = RECONNECT_MIN;
                    let hello = Message::Hello {
                        node_id: self.node_id.clone(),
                    };
                    if let Err(e) = write_frame(&mut stream, &hello).await {
                        debug!("[{}] hello to {} failed: {}", self.node_id, peer_id, e);
                    } else {
                        self.run_link(peer_id.clone(), stream, self.node_id.clone())
                            .await;
                        debug!("[{}] link to {} dropped", self.node_id, peer_id);
                    }
                }
                Err(e) => {
                    debug!(
                        "[{}] connect to {} ({}) failed: {}",
                        self.node_id, peer_id, addr, e
                    );
                }
            }

            tokio::select! {
                _ = sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    /// Register the link (subject to the tie-break), then pump frames until
    /// either direction fails. Runs on the caller's task.
    async fn run_link(&self, peer_id: String, stream: TcpStream, initiator: String) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        {
            let mut links = self.links.lock().await;
            if self.is_partitioned() {
                return;
            }
            if let Some(existing) = links.get(&peer_id) {
                if existing.initiator < initiator {
                    // The surviving link is the one dialed by the lower node
                    // id; this socket loses the tie-break.
                    debug!(
                        "[{}] dropping duplicate link to {} (kept initiator {})",
                        self.node_id, peer_id, existing.initiator
                    );
                    return;
                }
            }
            links.insert(
                peer_id.clone(),
                Link {
                    tx,
                    initiator: initiator.clone(),
                    generation,
                },
            );
        }
        info!(
            "[{}] link with {} established (initiated by {})",
            self.node_id, peer_id, initiator
        );

        let (mut read_half, write_half) = stream.into_split();
        let writer = tokio::spawn(write_loop(write_half, rx));

        let mut shutdown = self.shutdown.clone();
        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                frame = read_raw_frame(&mut read_half) => {
                    let payload = match frame {
                        Ok(payload) => payload,
                        Err(e) => {
                            debug!("[{}] read from {} failed: {}", self.node_id, peer_id, e);
                            break;
                        }
                    };
                    // A frame we cannot decode is dropped; the link stays up.
                    match decode(&payload) {
                        Ok(Message::Hello { .. }) => {}
                        Ok(message) => {
                            if self.is_partitioned() {
                                continue; // severed; frames no longer get through
                            }
                            if self.inbound.send((peer_id.clone(), message)).await.is_err() {
                                break; // consensus core is gone
                            }
                        }
                        Err(e) => {
                            warn!("[{}] dropping bad frame from {}: {}", self.node_id, peer_id, e);
                        }
                    }
                },
            }
        }

        // Remove our entry unless a replacement link already took the slot.
        {
            let mut links = self.links.lock().await;
            if links
                .get(&peer_id)
                .map(|l| l.generation == generation)
                .unwrap_or(false)
            {
                links.remove(&peer_id);
                info!("[{}] link with {} closed", self.node_id, peer_id);
            }
        }
        writer.abort();
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = write_frame(&mut write_half, &message).await {
            warn!("peer write failed: {}", e);
            break;
        }
    }
}

/// Bind with SO_REUSEADDR so a restarted node can re-take its port while old
/// sockets linger in TIME_WAIT.
fn bind_reusable(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr.parse()?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    TcpListener::from_std(socket.into()).context("failed to adopt listener socket")
}
