//! Feed handles: one append-only block log per writer.
//!
//! A feed is the unit of replication. The local process appends to the
//! feeds it owns a keypair for; every other feed is a sparse mirror that
//! fills up as peers deliver blocks, in whatever order they arrive.
//!
//! ```text
//! writable feed:  [meta][c1][c2][c3]          len = append count
//! remote feed:    [meta][c1][    ][c3]...     len = announced by peers
//!                              ▲
//!                              └─ hole: requested, not yet delivered
//! ```
//!
//! Feeds do not talk to the network themselves. Every state transition is
//! reported into the engine mailbox as a [`FeedEvent`]; the causal loader
//! reacts to those events and the swarm moves the bytes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::keys::{ActorId, DiscoveryKey, Keypair};
use crate::protocol::PeerId;

/// State transitions reported into the engine mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// The feed finished its initial handshake (archive blocks loaded)
    Ready { actor: ActorId },
    /// A replicated block arrived
    Download { actor: ActorId, index: u64 },
    /// The local process appended blocks
    Append { actor: ActorId, new_len: u64 },
    /// A peer announced this feed's length
    RemoteLength { actor: ActorId, len: u64 },
    /// A peer attached to this feed
    PeerAdd { actor: ActorId, peer: PeerId },
    /// A peer detached from this feed
    PeerRemove { actor: ActorId, peer: PeerId },
}

/// Feed errors.
#[derive(Debug, Clone)]
pub enum FeedError {
    /// Append on a feed this process has no signing key for
    NotWritable(ActorId),
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedError::NotWritable(actor) => write!(f, "feed {actor} is not writable"),
        }
    }
}

impl std::error::Error for FeedError {}

#[derive(Debug, Default)]
struct FeedInner {
    blocks: BTreeMap<u64, Vec<u8>>,
    len: u64,
    peers: BTreeSet<PeerId>,
    ready: bool,
}

/// Handle to one append-only block log.
pub struct Feed {
    actor: ActorId,
    keypair: Option<Keypair>,
    inner: RwLock<FeedInner>,
    events: mpsc::UnboundedSender<FeedEvent>,
}

impl Feed {
    /// A feed this process writes: freshly created or restored from the
    /// archive with its signing key.
    pub fn writable(keypair: Keypair, events: mpsc::UnboundedSender<FeedEvent>) -> Arc<Self> {
        Arc::new(Feed {
            actor: keypair.actor_id(),
            keypair: Some(keypair),
            inner: RwLock::new(FeedInner::default()),
            events,
        })
    }

    /// A mirror of someone else's feed, filled by replication.
    pub fn remote(actor: ActorId, events: mpsc::UnboundedSender<FeedEvent>) -> Arc<Self> {
        Arc::new(Feed {
            actor,
            keypair: None,
            inner: RwLock::new(FeedInner::default()),
            events,
        })
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        self.actor.discovery_key()
    }

    pub fn is_writable(&self) -> bool {
        self.keypair.is_some()
    }

    /// The signing keypair, for archival of writable feeds.
    pub fn keypair(&self) -> Option<&Keypair> {
        self.keypair.as_ref()
    }

    /// Number of blocks this feed is known to hold (not all of them are
    /// necessarily present locally on a remote feed).
    pub fn len(&self) -> u64 {
        self.inner.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_ready(&self) -> bool {
        self.inner.read().ready
    }

    /// Append blocks to a writable feed. Returns the new length.
    pub fn append(&self, blocks: &[Vec<u8>]) -> Result<u64, FeedError> {
        if self.keypair.is_none() {
            return Err(FeedError::NotWritable(self.actor));
        }
        let new_len = {
            let mut inner = self.inner.write();
            for block in blocks {
                let index = inner.len;
                inner.blocks.insert(index, block.clone());
                inner.len += 1;
            }
            inner.len
        };
        self.emit(FeedEvent::Append {
            actor: self.actor,
            new_len,
        });
        Ok(new_len)
    }

    /// Read a block if it is present locally.
    pub fn get(&self, index: u64) -> Option<Vec<u8>> {
        self.inner.read().blocks.get(&index).cloned()
    }

    pub fn has(&self, index: u64) -> bool {
        self.inner.read().blocks.contains_key(&index)
    }

    /// Store a replicated block. First write wins; a duplicate delivery is
    /// ignored. Returns whether the block was new.
    pub fn insert(&self, index: u64, block: Vec<u8>) -> bool {
        let inserted = {
            let mut inner = self.inner.write();
            if inner.blocks.contains_key(&index) {
                false
            } else {
                inner.blocks.insert(index, block);
                if index + 1 > inner.len {
                    inner.len = index + 1;
                }
                true
            }
        };
        if inserted {
            self.emit(FeedEvent::Download {
                actor: self.actor,
                index,
            });
        }
        inserted
    }

    /// Restore a block from the archive without emitting events.
    pub fn restore(&self, index: u64, block: Vec<u8>) {
        let mut inner = self.inner.write();
        if index + 1 > inner.len {
            inner.len = index + 1;
        }
        inner.blocks.entry(index).or_insert(block);
    }

    /// Record a peer's announcement of this feed's length.
    pub fn set_remote_len(&self, len: u64) {
        let grew = {
            let mut inner = self.inner.write();
            if len > inner.len {
                inner.len = len;
                true
            } else {
                false
            }
        };
        if grew {
            self.emit(FeedEvent::RemoteLength {
                actor: self.actor,
                len,
            });
        }
    }

    /// Mark the initial handshake complete. Emits `Ready` exactly once.
    pub fn mark_ready(&self) {
        let first = {
            let mut inner = self.inner.write();
            if inner.ready {
                false
            } else {
                inner.ready = true;
                true
            }
        };
        if first {
            self.emit(FeedEvent::Ready { actor: self.actor });
        }
    }

    pub fn add_peer(&self, peer: PeerId) {
        let added = self.inner.write().peers.insert(peer);
        if added {
            self.emit(FeedEvent::PeerAdd {
                actor: self.actor,
                peer,
            });
        }
    }

    pub fn remove_peer(&self, peer: PeerId) {
        let removed = self.inner.write().peers.remove(&peer);
        if removed {
            self.emit(FeedEvent::PeerRemove {
                actor: self.actor,
                peer,
            });
        }
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.read().peers.iter().copied().collect()
    }

    /// Indices present locally, for archival.
    pub fn present_blocks(&self) -> Vec<(u64, Vec<u8>)> {
        self.inner
            .read()
            .blocks
            .iter()
            .map(|(i, b)| (*i, b.clone()))
            .collect()
    }

    fn emit(&self, event: FeedEvent) {
        // The receiver only disappears when the repo shuts down; events
        // after that point have nobody left to care.
        let _ = self.events.send(event);
    }
}

impl fmt::Debug for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feed")
            .field("actor", &self.actor)
            .field("writable", &self.is_writable())
            .field("len", &self.len())
            .finish()
    }
}
