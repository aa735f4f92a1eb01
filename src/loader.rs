//! Causal loader: the fixed-point routine that makes documents whole.
//!
//! A document is only usable once every transitive causal dependency of
//! its change graph has been materialized. Blocks arrive lazily, from
//! multiple feeds, in arbitrary order, so loading is event-driven:
//!
//! ```text
//!   feed ready ──┐
//!   download ────┤                    ┌─→ request blocks [first,last)
//!   have/length ─┼─→ load_missing ────┼─→ await unknown feeds
//!   feeds shared ┘        ▲           └─→ apply present blocks ──┐
//!                         └──────────── fixed point ←────────────┘
//! ```
//!
//! Every trigger re-enters [`CausalLoader::load_missing`]; the request
//! tracker's monotone cursors make re-entry idempotent, and termination
//! follows because each pass either strictly advances a cursor or finds
//! nothing new to ask for.
//!
//! The loader never touches the network. It returns [`LoaderAction`]s —
//! block requests to issue and lifecycle events to emit — and the
//! orchestrator dispatches them, which keeps event ordering explicit:
//! `DocReady` is produced exactly once per document, always ahead of the
//! first `DocUpdated`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::crdt::{Change, Document};
use crate::feed::Feed;
use crate::keys::{ActorId, DocId};
use crate::metadata::{FeedMetadata, MetadataStore};
use crate::registry::FeedRegistry;
use crate::tracker::RequestTracker;

/// Work the orchestrator must dispatch after a loader pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderAction {
    /// Ask peers for blocks `[start, end)` of an actor's feed
    Request {
        actor: ActorId,
        start: u64,
        end: u64,
    },
    /// Ask peers for block 0 of a feed whose metadata is unknown
    RequestMetadata { actor: ActorId },
    /// The document reached the no-missing-deps state for the first time
    DocReady(DocId),
    /// A previously-ready document has new state
    DocUpdated(DocId),
}

/// Progressive fetch state across all documents.
pub struct CausalLoader {
    registry: Arc<FeedRegistry>,
    pub(crate) metadata: MetadataStore,
    pub(crate) tracker: RequestTracker,
    pub(crate) docs: HashMap<DocId, Document>,
    /// Documents that have emitted DocReady
    ready: HashSet<DocId>,
    /// Documents each feed contributes to. Seeded from metadata, extended
    /// by missing-dep references (a fork pulls from its parent's feeds,
    /// whose metadata names the parent doc, not the fork).
    feed_docs: HashMap<ActorId, BTreeSet<DocId>>,
    /// Actors referenced by missing deps with no feed in the registry yet;
    /// resolved when FEEDS_SHARED or a fork introduces the feed
    awaited: HashMap<ActorId, BTreeSet<DocId>>,
    /// Feeds whose block 0 has already been asked for
    requested_meta: HashSet<ActorId>,
    /// Feeds whose block 0 failed to parse; never incorporated into a doc
    quarantined: HashSet<ActorId>,
}

impl CausalLoader {
    pub fn new(registry: Arc<FeedRegistry>) -> Self {
        CausalLoader {
            registry,
            metadata: MetadataStore::new(),
            tracker: RequestTracker::new(),
            docs: HashMap::new(),
            ready: HashSet::new(),
            feed_docs: HashMap::new(),
            awaited: HashMap::new(),
            requested_meta: HashSet::new(),
            quarantined: HashSet::new(),
        }
    }

    /// Cached document, if built.
    pub fn doc(&self, doc_id: DocId) -> Option<&Document> {
        self.docs.get(&doc_id)
    }

    pub fn is_doc_ready(&self, doc_id: DocId) -> bool {
        self.ready.contains(&doc_id)
    }

    /// Drop a document from the cache (delete path).
    pub fn evict_doc(&mut self, doc_id: DocId) {
        self.docs.remove(&doc_id);
        self.ready.remove(&doc_id);
        for docs in self.feed_docs.values_mut() {
            docs.remove(&doc_id);
        }
        for docs in self.awaited.values_mut() {
            docs.remove(&doc_id);
        }
    }

    /// A feed finished its initial handshake.
    pub fn on_feed_ready(&mut self, actor: ActorId) -> Vec<LoaderAction> {
        let mut actions = Vec::new();
        self.load_metadata(actor, &mut actions);
        if self.metadata.is_loaded(actor) {
            self.activate(actor, &mut actions);
        }
        // Documents blocked on this feed can make progress now even before
        // its metadata resolves — their cursors drive direct requests
        if let Some(waiting) = self.awaited.remove(&actor) {
            for doc_id in waiting {
                self.feed_docs.entry(actor).or_default().insert(doc_id);
                let applied = self.drain_missing(doc_id, &mut actions);
                self.finish(doc_id, applied, &mut actions);
            }
        }
        actions
    }

    /// The local process appended to one of its feeds. The changes were
    /// already applied by the caller; this pass re-assesses readiness
    /// (a freshly created document becomes ready here).
    pub fn on_append(&mut self, actor: ActorId) -> Vec<LoaderAction> {
        let mut actions = Vec::new();
        self.load_metadata(actor, &mut actions);
        if self.metadata.is_loaded(actor) {
            self.activate(actor, &mut actions);
        }
        actions
    }

    /// A peer announced a feed's length.
    pub fn on_remote_length(&mut self, actor: ActorId) -> Vec<LoaderAction> {
        let mut actions = Vec::new();
        if !self.metadata.is_loaded(actor) {
            self.load_metadata(actor, &mut actions);
        }
        if let Some(meta) = self.metadata.get(actor) {
            let doc_id = meta.doc_id;
            self.load_feed(doc_id, actor, &mut actions);
            let applied = self.drain_missing(doc_id, &mut actions);
            self.finish(doc_id, applied, &mut actions);
        }
        actions
    }

    /// A replicated block arrived.
    pub fn on_download(&mut self, actor: ActorId, index: u64) -> Vec<LoaderAction> {
        let mut actions = Vec::new();
        if self.quarantined.contains(&actor) {
            return actions;
        }

        if index == 0 {
            self.load_metadata(actor, &mut actions);
            if self.metadata.is_loaded(actor) {
                self.activate(actor, &mut actions);
            }
            return actions;
        }

        let Some(feed) = self.registry.get(actor) else {
            return actions;
        };
        let Some(block) = feed.get(index) else {
            return actions;
        };
        let Some(change) = decode_change(actor, index, &block) else {
            return actions;
        };

        // The block may serve several documents — a fork pulls through its
        // parent's feeds. The feed's own document takes every block; any
        // other document only folds in what its missing deps call for, so
        // post-fork parent changes never leak into the fork.
        let primary = self.metadata.doc_for(actor);
        let doc_ids: Vec<DocId> = self
            .feed_docs
            .get(&actor)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for doc_id in doc_ids {
            if !self.docs.contains_key(&doc_id) {
                continue;
            }
            let mut applied = 0;
            if primary == Some(doc_id) {
                applied += self.apply(doc_id, vec![change.clone()]);
            }
            applied += self.drain_missing(doc_id, &mut actions);
            self.finish(doc_id, applied, &mut actions);
        }
        actions
    }

    /// New actor feeds were introduced (FEEDS_SHARED or fork). The caller
    /// has already opened them in the registry; re-run every document that
    /// was stuck waiting.
    pub fn on_feeds_introduced(&mut self, actors: &[ActorId]) -> Vec<LoaderAction> {
        let mut actions = Vec::new();
        for actor in actors {
            self.load_metadata(*actor, &mut actions);
            if self.metadata.is_loaded(*actor) {
                self.activate(*actor, &mut actions);
            }
            if let Some(waiting) = self.awaited.remove(actor) {
                for doc_id in waiting {
                    self.feed_docs.entry(*actor).or_default().insert(doc_id);
                    let applied = self.drain_missing(doc_id, &mut actions);
                    self.finish(doc_id, applied, &mut actions);
                }
            }
        }
        actions
    }

    /// Bind a freshly created document (create/fork) into the loader.
    pub fn insert_doc(&mut self, doc_id: DocId, doc: Document) {
        self.feed_docs
            .entry(doc_id.actor())
            .or_default()
            .insert(doc_id);
        self.docs.insert(doc_id, doc);
    }

    /// Load and index block 0 if it is present. Corrupt metadata
    /// quarantines the feed; absence on a remote feed asks peers for it.
    fn load_metadata(&mut self, actor: ActorId, actions: &mut Vec<LoaderAction>) {
        if self.metadata.is_loaded(actor) || self.quarantined.contains(&actor) {
            return;
        }
        let Some(feed) = self.registry.get(actor) else {
            return;
        };
        match feed.get(0) {
            Some(block) => match FeedMetadata::decode(&block) {
                Ok(meta) => {
                    if !self.metadata.set(actor, meta) {
                        log::warn!("duplicate metadata for feed {actor} ignored");
                    }
                }
                Err(e) => {
                    log::error!("corrupt metadata on feed {actor}: {e}");
                    self.quarantined.insert(actor);
                }
            },
            None => {
                if !feed.is_writable() && self.requested_meta.insert(actor) {
                    actions.push(LoaderAction::RequestMetadata { actor });
                }
            }
        }
    }

    /// Metadata is loaded: bind the feed to its document, build the doc
    /// shell for roots, pull blocks, and re-assess.
    fn activate(&mut self, actor: ActorId, actions: &mut Vec<LoaderAction>) {
        let meta = match self.metadata.get(actor) {
            Some(meta) => meta.clone(),
            None => return,
        };
        let doc_id = meta.doc_id;
        self.feed_docs.entry(actor).or_default().insert(doc_id);

        if meta.is_root_of(actor) {
            self.docs
                .entry(doc_id)
                .or_insert_with(|| Document::new(actor));
        }

        let mut applied = self.apply_present(doc_id, actor);
        self.load_feed(doc_id, actor, actions);
        applied += self.drain_missing(doc_id, actions);
        self.finish(doc_id, applied, actions);
    }

    /// Pull one feed up to its known length for a document: apply what is
    /// present, request the rest. The cursor splits "already asked" from
    /// "still to ask".
    fn load_feed(&mut self, doc_id: DocId, actor: ActorId, actions: &mut Vec<LoaderAction>) {
        let Some(feed) = self.registry.get(actor) else {
            return;
        };
        let len = feed.len();
        if len <= 1 {
            return; // metadata only, nothing to pull
        }
        let first = self.tracker.max(doc_id, actor, len);
        self.request_range(&feed, first, len, actions);
    }

    /// One pass of the missing-dependency walk for a document.
    ///
    /// Present blocks in the needed range are read unconditionally —
    /// local reads are free and application is idempotent. Only network
    /// requests go through the cursor, which is what "requested at most
    /// once per (doc, actor, index)" means.
    fn load_missing(&mut self, doc_id: DocId, actions: &mut Vec<LoaderAction>) -> usize {
        let (missing, clock) = match self.docs.get(&doc_id) {
            Some(doc) => (doc.missing_deps(), doc.clock().clone()),
            None => return 0,
        };

        let mut applied = 0;
        for (actor, seq) in missing {
            let last = seq + 1;
            let Some(feed) = self.registry.get(actor) else {
                log::debug!("doc {doc_id} waiting for unknown feed {actor}");
                self.awaited.entry(actor).or_default().insert(doc_id);
                continue;
            };
            self.feed_docs.entry(actor).or_default().insert(doc_id);

            let have = clock.get(&actor).copied().unwrap_or(0);
            let mut present = Vec::new();
            for index in (have + 1)..last {
                if let Some(block) = feed.get(index) {
                    if let Some(change) = decode_change(actor, index, &block) {
                        present.push(change);
                    }
                }
            }
            let first = self.tracker.max(doc_id, actor, last);
            self.request_range(&feed, first, last, actions);
            applied += self.apply(doc_id, present);
        }
        applied
    }

    /// Run [`Self::load_missing`] to fixed point: newly applied changes
    /// may reveal dependencies on actors we had not heard of yet.
    fn drain_missing(&mut self, doc_id: DocId, actions: &mut Vec<LoaderAction>) -> usize {
        let mut total = 0;
        loop {
            let applied = self.load_missing(doc_id, actions);
            if applied == 0 {
                break;
            }
            total += applied;
        }
        total
    }

    /// Emit Request actions for the absent runs of `[start, end)`.
    fn request_range(
        &mut self,
        feed: &Feed,
        start: u64,
        end: u64,
        actions: &mut Vec<LoaderAction>,
    ) {
        let mut run_start = None;
        for index in start..end {
            if feed.has(index) {
                if let Some(s) = run_start.take() {
                    actions.push(LoaderAction::Request {
                        actor: feed.actor(),
                        start: s,
                        end: index,
                    });
                }
            } else if run_start.is_none() {
                run_start = Some(index);
            }
        }
        if let Some(s) = run_start {
            actions.push(LoaderAction::Request {
                actor: feed.actor(),
                start: s,
                end,
            });
        }
    }

    /// Apply decoded changes to a document. Read problems are swallowed —
    /// the next trigger retries.
    fn apply(&mut self, doc_id: DocId, changes: Vec<Change>) -> usize {
        match self.docs.get_mut(&doc_id) {
            Some(doc) => doc.apply_changes(changes),
            None => 0,
        }
    }

    /// Apply every change block a feed already holds locally.
    fn apply_present(&mut self, doc_id: DocId, actor: ActorId) -> usize {
        let Some(feed) = self.registry.get(actor) else {
            return 0;
        };
        let mut changes = Vec::new();
        for (index, block) in feed.present_blocks() {
            if index == 0 {
                continue;
            }
            if let Some(change) = decode_change(actor, index, &block) {
                changes.push(change);
            }
        }
        self.apply(doc_id, changes)
    }

    /// Post-trigger bookkeeping: first-time readiness, then update
    /// notifications. Ready always precedes the first update.
    fn finish(&mut self, doc_id: DocId, applied: usize, actions: &mut Vec<LoaderAction>) {
        if !self.ready.contains(&doc_id) {
            if self.is_complete(doc_id) {
                self.ready.insert(doc_id);
                actions.push(LoaderAction::DocReady(doc_id));
            }
        } else if applied > 0 {
            actions.push(LoaderAction::DocUpdated(doc_id));
        }
    }

    /// The readiness predicate: root feed fully applied, metadata loaded
    /// for every contributing actor, no missing causal dependencies.
    fn is_complete(&self, doc_id: DocId) -> bool {
        let root = doc_id.actor();
        let Some(root_feed) = self.registry.get(root) else {
            return false;
        };
        if !root_feed.is_ready() || !self.metadata.is_loaded(root) {
            return false;
        }
        for actor in self.metadata.actors_for_doc(doc_id) {
            if !self.metadata.is_loaded(actor) {
                return false;
            }
        }
        let Some(doc) = self.docs.get(&doc_id) else {
            return false;
        };
        let root_len = root_feed.len();
        let applied = doc.clock().get(&root).copied().unwrap_or(0);
        if root_len == 0 || applied + 1 < root_len {
            return false;
        }
        doc.missing_deps().is_empty()
    }
}

/// Decode a change block, validating that it sits where its author's
/// history says it should (block index == seq). Anything else is logged
/// and skipped; the feed itself is not trusted to be well-formed.
fn decode_change(actor: ActorId, index: u64, block: &[u8]) -> Option<Change> {
    match Change::decode(block) {
        Ok(change) => {
            if change.actor != actor || change.seq != index {
                log::warn!(
                    "feed {actor} block {index} claims actor {} seq {}; skipped",
                    change.actor,
                    change.seq
                );
                return None;
            }
            Some(change)
        }
        Err(e) => {
            log::warn!("feed {actor} block {index} failed to decode: {e}");
            None
        }
    }
}
