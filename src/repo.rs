//! The repo: public face of the replication engine.
//!
//! ```text
//! create/open/change/merge/fork/delete          take_event_rx()
//!        │                                            ▲
//!        ▼                                            │
//! ┌─────────────┐   actions   ┌──────────────┐   RepoEvent
//! │    Repo     │ ──────────► │ engine task   │ ───────────►
//! │  (handle)   │             │ (one mailbox) │
//! └──────┬──────┘             └──────┬───────┘
//!        │                          │ feed + peer events
//!        ▼                          ▼
//!   CausalLoader ◄──── FeedRegistry ◄──── Swarm
//! ```
//!
//! Every index mutation happens behind one lock, and every lifecycle
//! notification funnels through the engine task's single mailbox, so
//! event ordering is explicit: `Ready` precedes everything, a document's
//! `DocumentReady` precedes its first `DocumentUpdated`.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::crdt::{ChangeError, Document, Transaction};
use crate::feed::{Feed, FeedError, FeedEvent};
use crate::keys::{ActorId, DocId, KeyError};
use crate::loader::{CausalLoader, LoaderAction};
use crate::metadata::{FeedMetadata, MetadataError};
use crate::protocol::{
    decode_extension, ExtensionMessage, ExtensionPayload, PeerId, EXTENSION_NAME,
};
use crate::registry::{FeedRegistry, RegistryError};
use crate::storage::{ArchiveConfig, ArchiveError, FeedArchive};
use crate::swarm::{PeerEvent, Swarm, SwarmError};

/// Repo configuration.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// Where to keep the feed archive (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Capacity of the public event channel
    pub event_capacity: usize,
    /// Hold cached documents as persistent snapshots (clone-on-change)
    /// instead of mutating them in place. Observable behavior is
    /// identical; snapshots trade memory for cheap reads under load.
    pub persistent_docs: bool,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            event_capacity: 256,
            persistent_docs: false,
        }
    }
}

impl RepoConfig {
    /// In-memory config for testing.
    pub fn for_testing() -> Self {
        Self::default()
    }
}

/// Lifecycle events observable by callers.
#[derive(Debug, Clone)]
pub enum RepoEvent {
    /// The archive has been enumerated; the repo is open for operations
    Ready,
    /// One feed finished its initial handshake
    FeedReady { actor: ActorId },
    /// A document reached the no-missing-deps state for the first time
    DocumentReady { doc_id: DocId, doc: Document },
    /// A previously-ready document has new state
    DocumentUpdated { doc_id: DocId, doc: Document },
    /// A peer attached to a document's root feed
    PeerJoined { actor: ActorId, peer: PeerId },
    /// A peer detached from a feed
    PeerLeft { actor: ActorId, peer: PeerId },
    /// An extension message of unknown type, for user handlers
    PeerMessage {
        actor: ActorId,
        peer: PeerId,
        message: Value,
    },
    /// A frame on an extension channel this engine does not speak
    PeerExtension {
        actor: ActorId,
        name: String,
        payload: Vec<u8>,
        peer: PeerId,
    },
}

/// Repo errors.
#[derive(Debug)]
pub enum RepoError {
    /// A public operation was called before the initial enumeration
    NotReady,
    /// The referenced document has no cached state here
    NotOpened(DocId),
    /// Metadata validation failed
    Metadata(MetadataError),
    /// Registry or archive failure
    Registry(RegistryError),
    /// Change encode/decode failure
    Codec(ChangeError),
    /// Feed append failure
    Transport(String),
    /// Swarm failure
    Swarm(SwarmError),
    /// Malformed actor id in user-supplied metadata
    Key(KeyError),
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoError::NotReady => write!(f, "repo is not ready yet"),
            RepoError::NotOpened(doc) => write!(f, "document {doc} is not opened"),
            RepoError::Metadata(e) => write!(f, "{e}"),
            RepoError::Registry(e) => write!(f, "{e}"),
            RepoError::Codec(e) => write!(f, "{e}"),
            RepoError::Transport(e) => write!(f, "transport error: {e}"),
            RepoError::Swarm(e) => write!(f, "{e}"),
            RepoError::Key(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RepoError {}

impl From<MetadataError> for RepoError {
    fn from(e: MetadataError) -> Self {
        RepoError::Metadata(e)
    }
}

impl From<RegistryError> for RepoError {
    fn from(e: RegistryError) -> Self {
        RepoError::Registry(e)
    }
}

impl From<ChangeError> for RepoError {
    fn from(e: ChangeError) -> Self {
        RepoError::Codec(e)
    }
}

impl From<FeedError> for RepoError {
    fn from(e: FeedError) -> Self {
        RepoError::Transport(e.to_string())
    }
}

impl From<SwarmError> for RepoError {
    fn from(e: SwarmError) -> Self {
        RepoError::Swarm(e)
    }
}

impl From<ArchiveError> for RepoError {
    fn from(e: ArchiveError) -> Self {
        RepoError::Registry(RegistryError::from(e))
    }
}

impl From<KeyError> for RepoError {
    fn from(e: KeyError) -> Self {
        RepoError::Key(e)
    }
}

struct RepoShared {
    config: RepoConfig,
    state: Mutex<CausalLoader>,
    registry: Arc<FeedRegistry>,
    swarm: Swarm,
    events: mpsc::Sender<RepoEvent>,
    ready: AtomicBool,
    shutdown: tokio::sync::Notify,
}

/// A peer-to-peer document repository.
///
/// Construct inside a tokio runtime: the engine task that drives
/// replication is spawned at creation.
pub struct Repo {
    shared: Arc<RepoShared>,
    event_rx: Option<mpsc::Receiver<RepoEvent>>,
}

impl Repo {
    /// Open a repo with the given configuration.
    pub fn new(config: RepoConfig) -> Result<Self, RepoError> {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);

        let archive = match &config.storage_path {
            Some(path) => Some(FeedArchive::open(ArchiveConfig {
                path: path.clone(),
                ..ArchiveConfig::default()
            })?),
            None => None,
        };
        let registry = Arc::new(FeedRegistry::new(archive, feed_tx));
        let swarm = Swarm::new(registry.clone(), peer_tx);

        let shared = Arc::new(RepoShared {
            config,
            state: Mutex::new(CausalLoader::new(registry.clone())),
            registry,
            swarm,
            events: event_tx,
            ready: AtomicBool::new(false),
            shutdown: tokio::sync::Notify::new(),
        });

        tokio::spawn(engine(shared.clone(), feed_rx, peer_rx));
        Ok(Repo {
            shared,
            event_rx: Some(event_rx),
        })
    }

    /// In-memory repo with defaults.
    pub fn in_memory() -> Result<Self, RepoError> {
        Self::new(RepoConfig::default())
    }

    /// Stop the engine task. Feed state already on disk stays there; a
    /// repo reopened on the same storage path resumes from it.
    pub fn close(&self) {
        self.shared.shutdown.notify_one();
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RepoEvent>> {
        self.event_rx.take()
    }

    /// Whether the initial enumeration has completed.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    /// Whether a document has reached the no-missing-deps state.
    pub fn is_document_ready(&self, doc_id: DocId) -> bool {
        self.shared.state.lock().is_doc_ready(doc_id)
    }

    /// The loaded metadata record for a feed, if any.
    pub fn metadata(&self, actor: ActorId) -> Option<FeedMetadata> {
        self.shared.state.lock().metadata.get(actor).cloned()
    }

    /// Bind a swarm listener. Returns the bound address.
    pub async fn listen(&self, addr: &str) -> Result<std::net::SocketAddr, RepoError> {
        Ok(self.shared.swarm.listen(addr).await?)
    }

    /// Dial a peer at `ws://host:port`.
    pub async fn connect(&self, url: &str) -> Result<(), RepoError> {
        self.shared.swarm.connect(url).await?;
        Ok(())
    }

    /// Create a new document. The metadata map's fields are stored in
    /// block 0 alongside the defaults; explicit `docId`/`groupId`/
    /// `parentId` entries override them.
    pub async fn create(&self, metadata: Map<String, Value>) -> Result<DocId, RepoError> {
        let feed = self.shared.registry.create_writable()?;
        let actor = feed.actor();

        let mut meta = FeedMetadata::root(actor);
        for (key, value) in metadata {
            match key.as_str() {
                "docId" => meta.doc_id = parse_id(&value)?.into(),
                "groupId" => meta.group_id = parse_id(&value)?,
                "parentId" => meta.parent_id = Some(parse_id(&value)?.into()),
                "hypermerge" => {} // version is not overridable
                _ => {
                    meta.extra.insert(key, value);
                }
            }
        }
        let doc_id = meta.doc_id;
        let group_id = meta.group_id;

        let block = self.append_metadata(&feed, &meta)?;
        self.shared.registry.persist_block(actor, 0, &block)?;

        {
            let mut state = self.shared.state.lock();
            state.metadata.set(actor, meta);
            state.tracker.max(doc_id, actor, 1);
            state.insert_doc(doc_id, Document::new(actor));
        }

        self.shared.swarm.join(actor.discovery_key());
        self.announce_group(group_id);
        log::info!("created document {doc_id}");
        Ok(doc_id)
    }

    /// Ensure a feed handle exists for a document (possibly empty, to be
    /// filled by replication) and return the cached document if already
    /// built.
    pub async fn open(&self, doc_id: DocId) -> Result<Option<Document>, RepoError> {
        self.ensure_ready()?;
        let actor = doc_id.actor();
        if !self.shared.registry.contains(actor) {
            self.shared.registry.create_or_open(actor)?;
            self.shared.swarm.join(actor.discovery_key());
        }
        Ok(self.shared.state.lock().doc(doc_id).cloned())
    }

    /// The cached document for an id.
    pub fn find(&self, doc_id: DocId) -> Result<Document, RepoError> {
        self.ensure_ready()?;
        self.shared
            .state
            .lock()
            .doc(doc_id)
            .cloned()
            .ok_or(RepoError::NotOpened(doc_id))
    }

    /// Run a change closure against a document, append the resulting
    /// change to our feed, and return the new document state.
    pub async fn change<F>(
        &self,
        doc_id: DocId,
        message: Option<&str>,
        f: F,
    ) -> Result<Document, RepoError>
    where
        F: FnOnce(&mut Transaction<'_>),
    {
        self.ensure_ready()?;
        let (doc, change, block, was_ready, announce) = {
            let mut state = self.shared.state.lock();
            if state.doc(doc_id).is_none() {
                return Err(RepoError::NotOpened(doc_id));
            }
            let (feed, announce) = self.writer_feed(&mut state, doc_id)?;
            let actor = feed.actor();

            // Both document variants behave identically; the persistent
            // one swaps a fresh snapshot in instead of mutating
            let change = if self.shared.config.persistent_docs {
                let current = state.doc(doc_id).ok_or(RepoError::NotOpened(doc_id))?;
                let mut next = current.clone();
                next.set_actor(actor);
                let change = next.change(message, f);
                state.docs.insert(doc_id, next);
                change
            } else {
                let doc = state
                    .docs
                    .get_mut(&doc_id)
                    .ok_or(RepoError::NotOpened(doc_id))?;
                doc.set_actor(actor);
                doc.change(message, f)
            };

            let block = change.encode()?;
            let new_len = feed.append(std::slice::from_ref(&block))?;
            state.tracker.max(doc_id, actor, new_len);

            let doc = state.doc(doc_id).cloned().ok_or(RepoError::NotOpened(doc_id))?;
            (doc, change, block, state.is_doc_ready(doc_id), announce)
        };

        self.shared
            .registry
            .persist_block(change.actor, change.seq, &block)?;
        if let Some(group) = announce {
            self.announce_group(group);
        }
        if was_ready {
            let _ = self
                .shared
                .events
                .send(RepoEvent::DocumentUpdated {
                    doc_id,
                    doc: doc.clone(),
                })
                .await;
        }
        Ok(doc)
    }

    /// Fold `source` into `dest` and seal the merge with an empty change
    /// authored by our writer, so the merged causality replicates.
    pub async fn merge(&self, dest: DocId, source: DocId) -> Result<Document, RepoError> {
        self.ensure_ready()?;
        {
            let mut state = self.shared.state.lock();
            let source_doc = state
                .doc(source)
                .cloned()
                .ok_or(RepoError::NotOpened(source))?;
            if self.shared.config.persistent_docs {
                let current = state.doc(dest).ok_or(RepoError::NotOpened(dest))?;
                let mut next = current.clone();
                next.merge(&source_doc);
                state.docs.insert(dest, next);
            } else {
                state
                    .docs
                    .get_mut(&dest)
                    .ok_or(RepoError::NotOpened(dest))?
                    .merge(&source_doc);
            }
        }
        // The empty change extends causality over everything just folded
        self.change(dest, Some("merge"), |_| {}).await
    }

    /// Fork a document: a fresh keypair, metadata inheriting the parent's
    /// group, and a seed change whose vector clock dominates the parent's
    /// tip.
    pub async fn fork(&self, parent: DocId) -> Result<DocId, RepoError> {
        self.ensure_ready()?;
        let (parent_doc, group_id) = {
            let state = self.shared.state.lock();
            let doc = state.doc(parent).cloned().ok_or(RepoError::NotOpened(parent))?;
            let group = state
                .metadata
                .get(parent.actor())
                .map(|m| m.group_id)
                .ok_or(RepoError::Metadata(MetadataError::NotFound(parent.actor())))?;
            (doc, group)
        };

        let feed = self.shared.registry.create_writable()?;
        let actor = feed.actor();
        let doc_id = DocId(actor);
        let meta = FeedMetadata::fork(actor, parent, group_id);

        let mut doc = parent_doc.fork_as(actor);
        let seed = doc.change(Some("fork"), |_| {});

        // Metadata and seed land in one append so no observer ever sees
        // a fork feed with metadata but no seed
        let meta_block = meta.encode()?;
        let seed_block = seed.encode()?;
        if feed.len() > 0 {
            return Err(RepoError::Metadata(MetadataError::NonEmpty(actor)));
        }
        let new_len = feed.append(&[meta_block.clone(), seed_block.clone()])?;

        self.shared.registry.persist_block(actor, 0, &meta_block)?;
        self.shared
            .registry
            .persist_block(actor, seed.seq, &seed_block)?;

        {
            let mut state = self.shared.state.lock();
            state.metadata.set(actor, meta);
            state.tracker.max(doc_id, actor, new_len);
            state.insert_doc(doc_id, doc);
        }

        self.shared.swarm.join(actor.discovery_key());
        self.announce_group(group_id);
        log::info!("forked {parent} as {doc_id}");
        Ok(doc_id)
    }

    /// Archive-remove a document: evict its feeds from the registry and
    /// its state from the cache, and leave the swarm. Blocks stay on disk.
    pub async fn delete(&self, doc_id: DocId) -> Result<(), RepoError> {
        self.ensure_ready()?;
        let actors = {
            let mut state = self.shared.state.lock();
            if state.doc(doc_id).is_none() {
                return Err(RepoError::NotOpened(doc_id));
            }
            let actors = state.metadata.actors_for_doc(doc_id);
            state.evict_doc(doc_id);
            actors
        };
        for actor in actors {
            if let Some(feed) = self.shared.registry.remove(actor) {
                self.shared.swarm.leave(feed.discovery_key());
            }
        }
        log::info!("deleted document {doc_id}");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), RepoError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(RepoError::NotReady)
        }
    }

    /// The writable feed this process authors a document's changes into.
    ///
    /// A document opened from someone else's root has no local writer
    /// until the first change; then a fresh feed is allocated, bound to
    /// the document by its metadata, and shared with the group. Returns
    /// the group to announce when a feed was created.
    fn writer_feed(
        &self,
        state: &mut CausalLoader,
        doc_id: DocId,
    ) -> Result<(Arc<Feed>, Option<ActorId>), RepoError> {
        for actor in state.metadata.actors_for_doc(doc_id) {
            if let Some(feed) = self.shared.registry.get(actor) {
                if feed.is_writable() {
                    return Ok((feed, None));
                }
            }
        }

        let group_id = state
            .metadata
            .get(doc_id.actor())
            .map(|m| m.group_id)
            .ok_or(RepoError::Metadata(MetadataError::NotFound(doc_id.actor())))?;

        let feed = self.shared.registry.create_writable()?;
        let actor = feed.actor();
        let meta = FeedMetadata::writer(doc_id, group_id);
        let block = meta.encode()?;
        feed.append(std::slice::from_ref(&block))?;
        self.shared.registry.persist_block(actor, 0, &block)?;
        state.metadata.set(actor, meta);
        state.tracker.max(doc_id, actor, 1);
        self.shared.swarm.join(feed.discovery_key());
        log::info!("allocated writer feed {actor} for document {doc_id}");
        Ok((feed, Some(group_id)))
    }

    /// Write block 0. The feed must be empty: metadata is written exactly
    /// once, before any change block.
    fn append_metadata(&self, feed: &Feed, meta: &FeedMetadata) -> Result<Vec<u8>, RepoError> {
        if feed.len() > 0 {
            return Err(RepoError::Metadata(MetadataError::NonEmpty(feed.actor())));
        }
        let block = meta.encode()?;
        feed.append(std::slice::from_ref(&block))?;
        Ok(block)
    }

    /// Send the group's current membership to every peer replicating any
    /// of its feeds.
    fn announce_group(&self, group_id: ActorId) {
        let members: Vec<ActorId> = {
            let state = self.shared.state.lock();
            state.metadata.group_members(group_id).into_iter().collect()
        };
        if members.is_empty() {
            return;
        }
        let payload = match (ExtensionMessage::FeedsShared {
            keys: members.clone(),
        })
        .encode()
        {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("failed to encode FEEDS_SHARED: {e}");
                return;
            }
        };
        for member in members {
            if let Some(feed) = self.shared.registry.get(member) {
                self.shared.swarm.broadcast_extension(
                    feed.discovery_key(),
                    EXTENSION_NAME,
                    payload.clone(),
                );
            }
        }
    }
}

impl fmt::Debug for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repo")
            .field("ready", &self.is_ready())
            .field("registry", &self.shared.registry)
            .finish()
    }
}

fn parse_id(value: &Value) -> Result<ActorId, RepoError> {
    let s = value
        .as_str()
        .ok_or_else(|| RepoError::Key(KeyError::InvalidHex(value.to_string())))?;
    Ok(ActorId::from_hex(s)?)
}

/// The engine task: enumerate the archive, then drive the loader from the
/// feed and peer mailboxes until the repo is dropped.
async fn engine(
    shared: Arc<RepoShared>,
    mut feed_rx: mpsc::UnboundedReceiver<FeedEvent>,
    mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
) {
    match shared.registry.restore_all() {
        Ok(feeds) => {
            for feed in &feeds {
                shared.swarm.join(feed.discovery_key());
            }
            if !feeds.is_empty() {
                log::info!("restored {} feeds from archive", feeds.len());
            }
        }
        Err(e) => log::error!("archive enumeration failed: {e}"),
    }
    shared.ready.store(true, Ordering::SeqCst);
    let _ = shared.events.send(RepoEvent::Ready).await;

    loop {
        tokio::select! {
            event = feed_rx.recv() => match event {
                Some(event) => handle_feed_event(&shared, event).await,
                None => break,
            },
            event = peer_rx.recv() => match event {
                Some(event) => handle_peer_event(&shared, event).await,
                None => break,
            },
            _ = shared.shutdown.notified() => break,
        }
    }
    log::debug!("engine task stopped");
}

async fn handle_feed_event(shared: &Arc<RepoShared>, event: FeedEvent) {
    match event {
        FeedEvent::Ready { actor } => {
            let actions = shared.state.lock().on_feed_ready(actor);
            let _ = shared.events.send(RepoEvent::FeedReady { actor }).await;
            dispatch(shared, actions).await;
        }
        FeedEvent::Download { actor, index } => {
            if let Some(feed) = shared.registry.get(actor) {
                if let Some(block) = feed.get(index) {
                    if let Err(e) = shared.registry.persist_block(actor, index, &block) {
                        log::error!("failed to persist block {index} of {actor}: {e}");
                    }
                }
                shared.swarm.flush_wants(feed.discovery_key());
            }
            let actions = shared.state.lock().on_download(actor, index);
            dispatch(shared, actions).await;
        }
        FeedEvent::Append { actor, new_len } => {
            if let Some(feed) = shared.registry.get(actor) {
                shared.swarm.announce(feed.discovery_key(), new_len);
                shared.swarm.flush_wants(feed.discovery_key());
            }
            let actions = shared.state.lock().on_append(actor);
            dispatch(shared, actions).await;
        }
        FeedEvent::RemoteLength { actor, .. } => {
            let actions = shared.state.lock().on_remote_length(actor);
            dispatch(shared, actions).await;
        }
        FeedEvent::PeerAdd { actor, peer } => {
            // A peer attached to a doc root: share the group's feeds
            let share = {
                let state = shared.state.lock();
                state.metadata.get(actor).and_then(|meta| {
                    meta.is_root_of(actor)
                        .then(|| state.metadata.group_members(meta.group_id))
                })
            };
            if let Some(members) = share {
                match (ExtensionMessage::FeedsShared {
                    keys: members.into_iter().collect(),
                })
                .encode()
                {
                    Ok(payload) => shared.swarm.send_extension(
                        peer,
                        actor.discovery_key(),
                        EXTENSION_NAME,
                        payload,
                    ),
                    Err(e) => log::error!("failed to encode FEEDS_SHARED: {e}"),
                }
                let _ = shared
                    .events
                    .send(RepoEvent::PeerJoined { actor, peer })
                    .await;
            }
        }
        FeedEvent::PeerRemove { actor, peer } => {
            let _ = shared.events.send(RepoEvent::PeerLeft { actor, peer }).await;
        }
    }
}

async fn handle_peer_event(shared: &Arc<RepoShared>, event: PeerEvent) {
    match event {
        PeerEvent::Connected { peer, addr } => {
            log::debug!("peer {peer} connected from {addr}");
        }
        PeerEvent::Disconnected { peer } => {
            log::debug!("peer {peer} disconnected");
        }
        PeerEvent::Extension {
            peer,
            discovery_key,
            name,
            payload,
        } => {
            let Some(feed) = shared.registry.get_by_discovery(discovery_key) else {
                return;
            };
            let actor = feed.actor();

            if name != EXTENSION_NAME {
                let _ = shared
                    .events
                    .send(RepoEvent::PeerExtension {
                        actor,
                        name,
                        payload,
                        peer,
                    })
                    .await;
                return;
            }

            match decode_extension(&payload) {
                Ok(ExtensionPayload::Known(ExtensionMessage::FeedsShared { keys })) => {
                    let mut introduced = Vec::new();
                    for key in keys {
                        if shared.registry.contains(key) {
                            continue;
                        }
                        match shared.registry.create_or_open(key) {
                            Ok(feed) => {
                                shared.swarm.join(feed.discovery_key());
                                introduced.push(key);
                            }
                            Err(e) => log::error!("failed to open shared feed {key}: {e}"),
                        }
                    }
                    if !introduced.is_empty() {
                        log::debug!("peer {peer} shared {} new feeds", introduced.len());
                        let actions = shared.state.lock().on_feeds_introduced(&introduced);
                        dispatch(shared, actions).await;
                    }
                }
                Ok(ExtensionPayload::Unknown(message)) => {
                    let _ = shared
                        .events
                        .send(RepoEvent::PeerMessage {
                            actor,
                            peer,
                            message,
                        })
                        .await;
                }
                Err(e) => {
                    log::warn!("bad extension payload from {peer}: {e}");
                }
            }
        }
    }
}

/// Dispatch loader actions: requests go to the swarm, lifecycle events to
/// the caller, in the order the loader produced them.
async fn dispatch(shared: &Arc<RepoShared>, actions: Vec<LoaderAction>) {
    for action in actions {
        match action {
            LoaderAction::Request { actor, start, end } => {
                shared
                    .swarm
                    .request_blocks(actor.discovery_key(), start, end);
            }
            LoaderAction::RequestMetadata { actor } => {
                shared.swarm.request_blocks(actor.discovery_key(), 0, 1);
            }
            LoaderAction::DocReady(doc_id) => {
                let doc = shared.state.lock().doc(doc_id).cloned();
                if let Some(doc) = doc {
                    log::info!("document {doc_id} ready");
                    let _ = shared
                        .events
                        .send(RepoEvent::DocumentReady { doc_id, doc })
                        .await;
                }
            }
            LoaderAction::DocUpdated(doc_id) => {
                let doc = shared.state.lock().doc(doc_id).cloned();
                if let Some(doc) = doc {
                    let _ = shared
                        .events
                        .send(RepoEvent::DocumentUpdated { doc_id, doc })
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keypair;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    async fn ready_repo() -> (Repo, mpsc::Receiver<RepoEvent>) {
        let mut repo = Repo::in_memory().unwrap();
        let mut rx = repo.take_event_rx().unwrap();
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(RepoEvent::Ready) = rx.recv().await {
                    break;
                }
            }
        })
        .await
        .expect("repo never became ready");
        (repo, rx)
    }

    async fn wait_doc_ready(rx: &mut mpsc::Receiver<RepoEvent>, doc_id: DocId) -> Document {
        timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await.expect("event channel closed") {
                    RepoEvent::DocumentReady { doc_id: d, doc } if d == doc_id => return doc,
                    _ => {}
                }
            }
        })
        .await
        .expect("document never became ready")
    }

    #[test]
    fn test_config_defaults() {
        let config = RepoConfig::default();
        assert!(config.storage_path.is_none());
        assert_eq!(config.event_capacity, 256);
        assert!(!config.persistent_docs);
    }

    #[tokio::test]
    async fn test_create_emits_document_ready() {
        let (repo, mut rx) = ready_repo().await;
        let doc_id = repo.create(Map::new()).await.unwrap();

        let doc = wait_doc_ready(&mut rx, doc_id).await;
        assert!(doc.state().is_empty());
        assert!(repo.is_document_ready(doc_id));

        let meta = repo.metadata(doc_id.actor()).unwrap();
        assert_eq!(meta.doc_id, doc_id);
        assert_eq!(meta.group_id, doc_id.actor());
    }

    #[tokio::test]
    async fn test_create_keeps_user_metadata() {
        let (repo, mut rx) = ready_repo().await;
        let mut user = Map::new();
        user.insert("title".into(), json!("notes"));
        let doc_id = repo.create(user).await.unwrap();
        wait_doc_ready(&mut rx, doc_id).await;

        let meta = repo.metadata(doc_id.actor()).unwrap();
        assert_eq!(meta.extra["title"], json!("notes"));
    }

    #[tokio::test]
    async fn test_change_updates_after_ready() {
        let (repo, mut rx) = ready_repo().await;
        let doc_id = repo.create(Map::new()).await.unwrap();
        wait_doc_ready(&mut rx, doc_id).await;

        let doc = repo
            .change(doc_id, Some("set"), |t| t.set("k", "v"))
            .await
            .unwrap();
        assert_eq!(doc.get("k"), Some(&json!("v")));

        // The local change surfaces as an update event
        let updated = timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await.expect("event channel closed") {
                    RepoEvent::DocumentUpdated { doc_id: d, doc } if d == doc_id => return doc,
                    _ => {}
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(updated.get("k"), Some(&json!("v")));
    }

    #[tokio::test]
    async fn test_find_unknown_not_opened() {
        let (repo, _rx) = ready_repo().await;
        let unknown = DocId(Keypair::generate().actor_id());
        assert!(matches!(repo.find(unknown), Err(RepoError::NotOpened(_))));
    }

    #[tokio::test]
    async fn test_fork_shares_group_not_changes() {
        let (repo, mut rx) = ready_repo().await;
        let parent = repo.create(Map::new()).await.unwrap();
        wait_doc_ready(&mut rx, parent).await;
        repo.change(parent, None, |t| {
            t.set("a", "1");
            t.set("b", "2");
        })
        .await
        .unwrap();

        let fork = repo.fork(parent).await.unwrap();
        assert_ne!(fork, parent);

        // The fork inherits the parent's group and names it as parent
        let meta = repo.metadata(fork.actor()).unwrap();
        assert_eq!(meta.group_id, parent.actor());
        assert_eq!(meta.parent_id, Some(parent));

        // All parent state is present on the fork
        let doc = repo.find(fork).unwrap();
        assert_eq!(doc.get("a"), Some(&json!("1")));
        assert_eq!(doc.get("b"), Some(&json!("2")));

        // A later change on the parent does not leak into the fork
        repo.change(parent, None, |t| t.set("later", "x"))
            .await
            .unwrap();
        assert!(repo.find(fork).unwrap().get("later").is_none());

        // Until it is explicitly merged
        repo.merge(fork, parent).await.unwrap();
        assert_eq!(repo.find(fork).unwrap().get("later"), Some(&json!("x")));
    }

    #[tokio::test]
    async fn test_fork_becomes_ready() {
        let (repo, mut rx) = ready_repo().await;
        let parent = repo.create(Map::new()).await.unwrap();
        wait_doc_ready(&mut rx, parent).await;

        let fork = repo.fork(parent).await.unwrap();
        let doc = wait_doc_ready(&mut rx, fork).await;
        assert_eq!(doc.actor(), fork.actor());
    }

    #[tokio::test]
    async fn test_delete_evicts() {
        let (repo, mut rx) = ready_repo().await;
        let doc_id = repo.create(Map::new()).await.unwrap();
        wait_doc_ready(&mut rx, doc_id).await;

        repo.delete(doc_id).await.unwrap();
        assert!(matches!(repo.find(doc_id), Err(RepoError::NotOpened(_))));
        assert!(matches!(
            repo.delete(doc_id).await,
            Err(RepoError::NotOpened(_))
        ));
    }

    #[tokio::test]
    async fn test_persistent_docs_variant_behaves_identically() {
        let mut repo = Repo::new(RepoConfig {
            persistent_docs: true,
            ..RepoConfig::default()
        })
        .unwrap();
        let mut rx = repo.take_event_rx().unwrap();
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(RepoEvent::Ready) = rx.recv().await {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let doc_id = repo.create(Map::new()).await.unwrap();
        wait_doc_ready(&mut rx, doc_id).await;
        let doc = repo
            .change(doc_id, None, |t| t.set("k", "v"))
            .await
            .unwrap();
        assert_eq!(doc.get("k"), Some(&json!("v")));
        assert_eq!(repo.find(doc_id).unwrap().get("k"), Some(&json!("v")));
    }

    #[tokio::test]
    async fn test_metadata_written_once() {
        let (repo, mut rx) = ready_repo().await;
        let doc_id = repo.create(Map::new()).await.unwrap();
        wait_doc_ready(&mut rx, doc_id).await;

        let feed = repo.shared.registry.get(doc_id.actor()).unwrap();
        let meta = FeedMetadata::root(doc_id.actor());
        assert!(matches!(
            repo.append_metadata(&feed, &meta),
            Err(RepoError::Metadata(MetadataError::NonEmpty(_)))
        ));
    }
}
