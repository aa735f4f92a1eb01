//! WebSocket swarm: peer connections and block replication transport.
//!
//! ```text
//! listen(port) ──► accept loop ──┐
//! connect(url) ──────────────────┼──► one pump per connection
//!                                │      reader: frames → feeds/engine
//!                                │      writer: outbound mpsc → socket
//!                                ▼
//!                     ┌─────────────────────┐
//!                     │ per-feed bookkeeping │
//!                     │  outstanding: asked  │
//!                     │  wants: asked of us  │
//!                     └─────────────────────┘
//! ```
//!
//! The swarm owns retry semantics: a block request issued while no peer
//! has the feed open is parked in `outstanding` and flushed to every peer
//! that opens the feed later. Symmetrically, a peer's request for a block
//! we lack parks in `wants` and is served the moment the block lands.
//! This is why the loader's cursors can be strictly monotone — asking is
//! done exactly once, waiting is the transport's business.
//!
//! Frame routing is mechanical: `Have`/`Data` mutate the feed (whose
//! events drive the loader), `Extension` frames go up to the orchestrator
//! untouched. The swarm never looks inside payloads.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::keys::DiscoveryKey;
use crate::protocol::{PeerId, WireMessage};
use crate::registry::FeedRegistry;

/// Connection-level events reported into the engine mailbox.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connected { peer: PeerId, addr: String },
    Disconnected { peer: PeerId },
    /// A named-extension frame arrived for a feed channel
    Extension {
        peer: PeerId,
        discovery_key: DiscoveryKey,
        name: String,
        payload: Vec<u8>,
    },
}

/// Swarm errors.
#[derive(Debug)]
pub enum SwarmError {
    Io(String),
    Transport(String),
}

impl fmt::Display for SwarmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwarmError::Io(e) => write!(f, "swarm i/o error: {e}"),
            SwarmError::Transport(e) => write!(f, "swarm transport error: {e}"),
        }
    }
}

impl std::error::Error for SwarmError {}

struct PeerHandle {
    tx: mpsc::UnboundedSender<WireMessage>,
}

struct SwarmInner {
    registry: Arc<FeedRegistry>,
    events: mpsc::UnboundedSender<PeerEvent>,
    peers: RwLock<HashMap<PeerId, PeerHandle>>,
    /// Discovery keys we advertise on every connection
    interests: RwLock<HashSet<DiscoveryKey>>,
    /// Which feeds each remote peer has opened towards us
    remote_open: RwLock<HashMap<PeerId, HashSet<DiscoveryKey>>>,
    /// Our unfulfilled block requests, per feed
    outstanding: RwLock<HashMap<DiscoveryKey, BTreeSet<u64>>>,
    /// Peers' unfulfilled block requests to us, per feed and index
    wants: RwLock<HashMap<DiscoveryKey, HashMap<u64, HashSet<PeerId>>>>,
}

/// Peer discovery and replication transport.
#[derive(Clone)]
pub struct Swarm {
    inner: Arc<SwarmInner>,
}

impl Swarm {
    pub fn new(registry: Arc<FeedRegistry>, events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Swarm {
            inner: Arc::new(SwarmInner {
                registry,
                events,
                peers: RwLock::new(HashMap::new()),
                interests: RwLock::new(HashSet::new()),
                remote_open: RwLock::new(HashMap::new()),
                outstanding: RwLock::new(HashMap::new()),
                wants: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Bind a listener and accept peers forever. Returns the bound
    /// address (bind to port 0 to let the OS pick).
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr, SwarmError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SwarmError::Io(e.to_string()))?;
        let local = listener
            .local_addr()
            .map_err(|e| SwarmError::Io(e.to_string()))?;
        log::info!("swarm listening on {local}");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        log::debug!("new tcp connection from {peer_addr}");
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            match tokio_tungstenite::accept_async(stream).await {
                                Ok(ws) => {
                                    run_peer(inner, ws, peer_addr.to_string()).await;
                                }
                                Err(e) => {
                                    log::warn!("websocket handshake failed from {peer_addr}: {e}");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        // Keep listening; accept errors are transient
                        log::error!("swarm accept error: {e}");
                    }
                }
            }
        });
        Ok(local)
    }

    /// Dial a peer at `ws://host:port`.
    pub async fn connect(&self, url: &str) -> Result<PeerId, SwarmError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SwarmError::Transport(e.to_string()))?;
        let inner = self.inner.clone();
        let url = url.to_string();

        // run_peer registers the handle before pumping, but we want the id
        // back; generate it here and hand it down
        let peer = Uuid::new_v4();
        tokio::spawn(async move {
            run_peer_with_id(inner, ws, url, peer).await;
        });
        Ok(peer)
    }

    /// Advertise interest in a feed on every live connection.
    pub fn join(&self, discovery_key: DiscoveryKey) {
        let newly = self.inner.interests.write().insert(discovery_key);
        if newly {
            self.broadcast(WireMessage::Open { discovery_key });
        }
    }

    /// Withdraw interest and drop per-feed transfer state.
    pub fn leave(&self, discovery_key: DiscoveryKey) {
        self.inner.interests.write().remove(&discovery_key);
        self.inner.outstanding.write().remove(&discovery_key);
        self.inner.wants.write().remove(&discovery_key);
    }

    /// Request blocks `[start, end)` of a feed. Requests go to every live
    /// peer — whoever lacks the feed ignores them — and are parked in
    /// `outstanding` so peers that open the feed later get them replayed.
    pub fn request_blocks(&self, discovery_key: DiscoveryKey, start: u64, end: u64) {
        {
            let mut outstanding = self.inner.outstanding.write();
            let set = outstanding.entry(discovery_key).or_default();
            set.extend(start..end);
        }
        let peers: Vec<PeerId> = self.inner.peers.read().keys().copied().collect();
        for peer in peers {
            self.send_to(
                peer,
                (start..end).map(|index| WireMessage::Request {
                    discovery_key,
                    index,
                }),
            );
        }
    }

    /// Announce a feed's new length to every peer replicating it.
    pub fn announce(&self, discovery_key: DiscoveryKey, length: u64) {
        for peer in self.peers_with_open(discovery_key) {
            self.send_to(
                peer,
                [WireMessage::Have {
                    discovery_key,
                    length,
                }],
            );
        }
    }

    /// Blocks became available locally: serve every parked want that can
    /// now be satisfied.
    pub fn flush_wants(&self, discovery_key: DiscoveryKey) {
        let Some(feed) = self.inner.registry.get_by_discovery(discovery_key) else {
            return;
        };
        let servable: Vec<(u64, HashSet<PeerId>)> = {
            let mut wants = self.inner.wants.write();
            match wants.get_mut(&discovery_key) {
                Some(by_index) => {
                    let ready: Vec<u64> = by_index
                        .keys()
                        .copied()
                        .filter(|index| feed.has(*index))
                        .collect();
                    ready
                        .into_iter()
                        .filter_map(|index| by_index.remove(&index).map(|t| (index, t)))
                        .collect()
                }
                None => Vec::new(),
            }
        };
        for (index, takers) in servable {
            let Some(block) = feed.get(index) else {
                continue;
            };
            for peer in takers {
                self.send_to(
                    peer,
                    [WireMessage::Data {
                        discovery_key,
                        index,
                        block: block.clone(),
                    }],
                );
            }
        }
    }

    /// Send an extension frame to one peer.
    pub fn send_extension(
        &self,
        peer: PeerId,
        discovery_key: DiscoveryKey,
        name: &str,
        payload: Vec<u8>,
    ) {
        self.send_to(
            peer,
            [WireMessage::Extension {
                discovery_key,
                name: name.to_string(),
                payload,
            }],
        );
    }

    /// Send an extension frame to every peer replicating a feed.
    pub fn broadcast_extension(&self, discovery_key: DiscoveryKey, name: &str, payload: Vec<u8>) {
        for peer in self.peers_with_open(discovery_key) {
            self.send_extension(peer, discovery_key, name, payload.clone());
        }
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    fn broadcast(&self, message: WireMessage) {
        let peers: Vec<PeerId> = self.inner.peers.read().keys().copied().collect();
        for peer in peers {
            self.send_to(peer, [message.clone()]);
        }
    }

    fn peers_with_open(&self, discovery_key: DiscoveryKey) -> Vec<PeerId> {
        self.inner
            .remote_open
            .read()
            .iter()
            .filter(|(_, open)| open.contains(&discovery_key))
            .map(|(peer, _)| *peer)
            .collect()
    }

    fn send_to(&self, peer: PeerId, messages: impl IntoIterator<Item = WireMessage>) {
        let peers = self.inner.peers.read();
        if let Some(handle) = peers.get(&peer) {
            for message in messages {
                let _ = handle.tx.send(message);
            }
        }
    }
}

impl fmt::Debug for Swarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Swarm")
            .field("peers", &self.inner.peers.read().len())
            .field("interests", &self.inner.interests.read().len())
            .finish()
    }
}

async fn run_peer<S>(inner: Arc<SwarmInner>, ws: WebSocketStream<S>, addr: String)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    run_peer_with_id(inner, ws, addr, Uuid::new_v4()).await;
}

/// One connection pump: register the peer, advertise interests, route
/// frames until the socket closes, then unwind everything the peer held.
async fn run_peer_with_id<S>(
    inner: Arc<SwarmInner>,
    ws: WebSocketStream<S>,
    addr: String,
    peer: PeerId,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();

    inner.peers.write().insert(peer, PeerHandle { tx: tx.clone() });
    let _ = inner.events.send(PeerEvent::Connected {
        peer,
        addr: addr.clone(),
    });
    log::info!("peer {peer} connected ({addr})");

    // Writer task: outbound channel → socket
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let bytes = match message.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("dropping unencodable frame: {e}");
                    continue;
                }
            };
            if sink.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
    });

    // Advertise every joined feed to the new peer
    {
        let interests = inner.interests.read();
        for discovery_key in interests.iter() {
            let _ = tx.send(WireMessage::Open {
                discovery_key: *discovery_key,
            });
        }
    }

    // Reader: route frames until the socket closes
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                match WireMessage::decode(&bytes) {
                    Ok(message) => handle_frame(&inner, peer, &tx, message),
                    Err(e) => log::warn!("undecodable frame from {peer}: {e}"),
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    // Unwind: detach from feeds, drop parked state, report
    let opened = inner.remote_open.write().remove(&peer).unwrap_or_default();
    for discovery_key in &opened {
        if let Some(feed) = inner.registry.get_by_discovery(*discovery_key) {
            feed.remove_peer(peer);
        }
    }
    {
        let mut wants = inner.wants.write();
        for by_index in wants.values_mut() {
            for takers in by_index.values_mut() {
                takers.remove(&peer);
            }
        }
    }
    inner.peers.write().remove(&peer);
    let _ = inner.events.send(PeerEvent::Disconnected { peer });
    writer.abort();
    log::info!("peer {peer} disconnected ({addr})");
}

/// Route one inbound frame. `Have`/`Data` feed the registry (whose events
/// wake the loader); `Open`/`Request` update transfer bookkeeping;
/// `Extension` goes up to the orchestrator.
fn handle_frame(
    inner: &Arc<SwarmInner>,
    peer: PeerId,
    tx: &mpsc::UnboundedSender<WireMessage>,
    message: WireMessage,
) {
    let discovery_key = message.discovery_key();
    match message {
        WireMessage::Open { .. } => {
            if !inner.interests.read().contains(&discovery_key) {
                return; // not replicating this feed
            }
            let Some(feed) = inner.registry.get_by_discovery(discovery_key) else {
                return;
            };
            inner
                .remote_open
                .write()
                .entry(peer)
                .or_default()
                .insert(discovery_key);

            // Tell the peer how much we hold, then flush any requests that
            // were parked waiting for a taker
            let length = feed.len();
            if length > 0 {
                let _ = tx.send(WireMessage::Have {
                    discovery_key,
                    length,
                });
            }
            let parked: Vec<u64> = inner
                .outstanding
                .read()
                .get(&discovery_key)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            for index in parked {
                let _ = tx.send(WireMessage::Request {
                    discovery_key,
                    index,
                });
            }
            feed.add_peer(peer);
        }
        WireMessage::Have { length, .. } => {
            if let Some(feed) = inner.registry.get_by_discovery(discovery_key) {
                feed.set_remote_len(length);
            }
        }
        WireMessage::Request { index, .. } => {
            let Some(feed) = inner.registry.get_by_discovery(discovery_key) else {
                return;
            };
            match feed.get(index) {
                Some(block) => {
                    let _ = tx.send(WireMessage::Data {
                        discovery_key,
                        index,
                        block,
                    });
                }
                None => {
                    // Park the want; served when the block lands
                    inner
                        .wants
                        .write()
                        .entry(discovery_key)
                        .or_default()
                        .entry(index)
                        .or_default()
                        .insert(peer);
                }
            }
        }
        WireMessage::Data { index, block, .. } => {
            if let Some(outstanding) = inner.outstanding.write().get_mut(&discovery_key) {
                outstanding.remove(&index);
            }
            if let Some(feed) = inner.registry.get_by_discovery(discovery_key) {
                feed.insert(index, block);
            }
        }
        WireMessage::Extension { name, payload, .. } => {
            let _ = inner.events.send(PeerEvent::Extension {
                peer,
                discovery_key,
                name,
                payload,
            });
        }
    }
}
