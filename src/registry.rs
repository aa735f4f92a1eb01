//! Feed registry: the owning table of live feeds.
//!
//! Everything else refers to feeds by actor id (or discovery key on the
//! wire) and resolves through this table at use time — there is no graph
//! of owning pointers. The registry also fronts the archive: feeds are
//! recreated from disk on startup, and newly created or opened feeds are
//! recorded durably before they are handed out.
//!
//! Evicting a feed removes it from the live table only; its blocks stay
//! on disk. Opening an unknown actor id is not an error — it produces an
//! empty feed that replication will fill.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::feed::{Feed, FeedError, FeedEvent};
use crate::keys::{ActorId, DiscoveryKey, Keypair};
use crate::storage::{ArchiveError, FeedArchive, FeedRecord};

/// Registry errors.
#[derive(Debug, Clone)]
pub enum RegistryError {
    /// Archive read/write failed
    Archive(String),
    /// Append on a non-writable feed
    Feed(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Archive(e) => write!(f, "registry archive error: {e}"),
            RegistryError::Feed(e) => write!(f, "registry feed error: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<ArchiveError> for RegistryError {
    fn from(e: ArchiveError) -> Self {
        RegistryError::Archive(e.to_string())
    }
}

impl From<FeedError> for RegistryError {
    fn from(e: FeedError) -> Self {
        RegistryError::Feed(e.to_string())
    }
}

/// The set of live feeds, keyed by actor id and discovery key.
pub struct FeedRegistry {
    feeds: RwLock<HashMap<ActorId, Arc<Feed>>>,
    by_discovery: RwLock<HashMap<DiscoveryKey, ActorId>>,
    archive: Option<FeedArchive>,
    events: mpsc::UnboundedSender<FeedEvent>,
}

impl FeedRegistry {
    pub fn new(archive: Option<FeedArchive>, events: mpsc::UnboundedSender<FeedEvent>) -> Self {
        FeedRegistry {
            feeds: RwLock::new(HashMap::new()),
            by_discovery: RwLock::new(HashMap::new()),
            archive,
            events,
        }
    }

    /// Recreate every archived feed. Called once at startup, before the
    /// engine starts consuming events.
    pub fn restore_all(&self) -> Result<Vec<Arc<Feed>>, RegistryError> {
        let records = match &self.archive {
            Some(archive) => archive.list_feeds()?,
            None => return Ok(Vec::new()),
        };

        let mut restored = Vec::new();
        for record in records {
            let feed = match record.secret_key {
                Some(secret) => Feed::writable(
                    Keypair::from_secret_bytes(&secret),
                    self.events.clone(),
                ),
                None => Feed::remote(record.actor, self.events.clone()),
            };
            if let Some(archive) = &self.archive {
                for (index, block) in archive.blocks_for(record.actor)? {
                    feed.restore(index, block);
                }
            }
            if record.length > feed.len() {
                // Blocks we knew about but never received; replication
                // will fill them back in
                feed.set_remote_len(record.length);
            }
            self.insert(feed.clone());
            feed.mark_ready();
            log::debug!("restored feed {} (len {})", feed.actor(), feed.len());
            restored.push(feed);
        }
        Ok(restored)
    }

    /// Create a fresh writable feed with a new keypair.
    pub fn create_writable(&self) -> Result<Arc<Feed>, RegistryError> {
        let keypair = Keypair::generate();
        let feed = Feed::writable(keypair.clone(), self.events.clone());
        if let Some(archive) = &self.archive {
            archive.put_feed(&FeedRecord {
                actor: keypair.actor_id(),
                secret_key: Some(keypair.secret_bytes()),
                length: 0,
            })?;
        }
        self.insert(feed.clone());
        feed.mark_ready();
        Ok(feed)
    }

    /// Return the live feed for `actor`, opening one if needed.
    ///
    /// A supplied key with no local history yields an empty feed that
    /// replication will fill — never an error. If the archive holds the
    /// signing key (our own feed from an earlier run), the feed comes back
    /// writable.
    pub fn create_or_open(&self, actor: ActorId) -> Result<Arc<Feed>, RegistryError> {
        if let Some(feed) = self.get(actor) {
            return Ok(feed);
        }

        let archived = match &self.archive {
            Some(archive) => archive.get_feed(actor)?,
            None => None,
        };
        let feed = match archived.as_ref().and_then(|r| r.secret_key) {
            Some(secret) => Feed::writable(Keypair::from_secret_bytes(&secret), self.events.clone()),
            None => Feed::remote(actor, self.events.clone()),
        };

        if let Some(archive) = &self.archive {
            for (index, block) in archive.blocks_for(actor)? {
                feed.restore(index, block);
            }
            if archived.is_none() {
                archive.put_feed(&FeedRecord {
                    actor,
                    secret_key: None,
                    length: 0,
                })?;
            }
        }

        self.insert(feed.clone());
        feed.mark_ready();
        Ok(feed)
    }

    pub fn get(&self, actor: ActorId) -> Option<Arc<Feed>> {
        self.feeds.read().get(&actor).cloned()
    }

    pub fn get_by_discovery(&self, discovery_key: DiscoveryKey) -> Option<Arc<Feed>> {
        let actor = self.by_discovery.read().get(&discovery_key).copied()?;
        self.get(actor)
    }

    pub fn contains(&self, actor: ActorId) -> bool {
        self.feeds.read().contains_key(&actor)
    }

    pub fn all(&self) -> Vec<Arc<Feed>> {
        self.feeds.read().values().cloned().collect()
    }

    /// Evict a feed from the live table. Blocks stay on disk; the caller
    /// is responsible for the swarm leave.
    pub fn remove(&self, actor: ActorId) -> Option<Arc<Feed>> {
        let feed = self.feeds.write().remove(&actor)?;
        self.by_discovery.write().remove(&feed.discovery_key());
        Some(feed)
    }

    /// Persist one block and the feed's current length.
    pub fn persist_block(
        &self,
        actor: ActorId,
        index: u64,
        block: &[u8],
    ) -> Result<(), RegistryError> {
        let Some(archive) = &self.archive else {
            return Ok(());
        };
        archive.put_block(actor, index, block)?;
        if let Some(feed) = self.get(actor) {
            let secret = feed.keypair().map(|k| k.secret_bytes());
            archive.put_feed(&FeedRecord {
                actor,
                secret_key: secret,
                length: feed.len(),
            })?;
        }
        Ok(())
    }

    fn insert(&self, feed: Arc<Feed>) {
        self.by_discovery
            .write()
            .insert(feed.discovery_key(), feed.actor());
        self.feeds.write().insert(feed.actor(), feed);
    }
}

impl fmt::Debug for FeedRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedRegistry")
            .field("feeds", &self.feeds.read().len())
            .field("archived", &self.archive.is_some())
            .finish()
    }
}
