//! Feed metadata: block 0 of every feed, and the indices built from it.
//!
//! Every feed reserves block 0 for a JSON metadata record:
//!
//! ```text
//! {"hypermerge":1,"docId":<hex>,"groupId":<hex>,"parentId":<hex>?,...}
//! ```
//!
//! The record binds the feed's actor to exactly one document and one fork
//! group. It is written exactly once, before any change block, and never
//! mutated. [`MetadataStore`] caches loaded records and maintains the
//! doc → actors and group → actors indices the loader and the FEEDS_SHARED
//! handshake are driven by.
//!
//! First-writer-wins: a second record for the same actor is ignored (two
//! differing records for one actor would be byzantine — the first loaded
//! one stays, the rest are logged and dropped).

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::keys::{ActorId, DocId, GroupId};

/// The metadata format version this engine writes and accepts.
const METADATA_VERSION: u32 = 1;

/// The JSON record stored as block 0 of a feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedMetadata {
    /// Format version tag; always 1
    pub hypermerge: u32,
    /// The document this feed contributes to
    #[serde(rename = "docId")]
    pub doc_id: DocId,
    /// The fork group this document belongs to
    #[serde(rename = "groupId")]
    pub group_id: GroupId,
    /// Present only on forks: the document this one was forked from
    #[serde(rename = "parentId", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<DocId>,
    /// User-supplied fields from `create`, preserved round-trip
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FeedMetadata {
    /// Root-document record: the feed's own actor is the doc and group.
    pub fn root(actor: ActorId) -> Self {
        FeedMetadata {
            hypermerge: METADATA_VERSION,
            doc_id: DocId(actor),
            group_id: actor,
            parent_id: None,
            extra: Map::new(),
        }
    }

    /// Writer record: a feed contributing changes to a document rooted in
    /// some other actor's feed.
    pub fn writer(doc: DocId, group: GroupId) -> Self {
        FeedMetadata {
            hypermerge: METADATA_VERSION,
            doc_id: doc,
            group_id: group,
            parent_id: None,
            extra: Map::new(),
        }
    }

    /// Fork record: a fresh doc root that inherits the parent's group.
    pub fn fork(actor: ActorId, parent: DocId, group: GroupId) -> Self {
        FeedMetadata {
            hypermerge: METADATA_VERSION,
            doc_id: DocId(actor),
            group_id: group,
            parent_id: Some(parent),
            extra: Map::new(),
        }
    }

    /// Whether this record marks its feed as a document root.
    pub fn is_root_of(&self, actor: ActorId) -> bool {
        self.doc_id.actor() == actor
    }

    /// Serialize to the UTF-8 JSON block format.
    pub fn encode(&self) -> Result<Vec<u8>, MetadataError> {
        serde_json::to_vec(self).map_err(|e| MetadataError::Corrupt(e.to_string()))
    }

    /// Parse block 0. Fails on malformed JSON, missing required fields, or
    /// an unknown format version.
    pub fn decode(bytes: &[u8]) -> Result<Self, MetadataError> {
        let meta: FeedMetadata =
            serde_json::from_slice(bytes).map_err(|e| MetadataError::Corrupt(e.to_string()))?;
        if meta.hypermerge != METADATA_VERSION {
            return Err(MetadataError::Corrupt(format!(
                "unsupported metadata version {}",
                meta.hypermerge
            )));
        }
        Ok(meta)
    }
}

/// Metadata errors.
#[derive(Debug, Clone)]
pub enum MetadataError {
    /// The feed has no block 0 yet
    NotFound(ActorId),
    /// Tried to write metadata into a feed that already has blocks
    NonEmpty(ActorId),
    /// Block 0 did not parse or failed validation
    Corrupt(String),
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataError::NotFound(actor) => write!(f, "no metadata for feed {actor}"),
            MetadataError::NonEmpty(actor) => {
                write!(f, "feed {actor} already has blocks, metadata must be block 0")
            }
            MetadataError::Corrupt(e) => write!(f, "corrupt metadata: {e}"),
        }
    }
}

impl std::error::Error for MetadataError {}

/// In-memory metadata cache plus the derived doc and group indices.
#[derive(Debug, Default)]
pub struct MetadataStore {
    records: HashMap<ActorId, FeedMetadata>,
    doc_index: HashMap<DocId, BTreeSet<ActorId>>,
    group_index: HashMap<GroupId, BTreeSet<ActorId>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record metadata for an actor, first-writer-wins.
    ///
    /// Returns `true` if the record was stored, `false` if the actor was
    /// already bound (the new record is ignored). Indices are only touched
    /// after the guard passes, so a rejected record never corrupts them.
    pub fn set(&mut self, actor: ActorId, meta: FeedMetadata) -> bool {
        if self.records.contains_key(&actor) {
            return false;
        }
        self.doc_index.entry(meta.doc_id).or_default().insert(actor);
        self.group_index
            .entry(meta.group_id)
            .or_default()
            .insert(actor);
        self.records.insert(actor, meta);
        true
    }

    /// Cached record for an actor, if loaded.
    pub fn get(&self, actor: ActorId) -> Option<&FeedMetadata> {
        self.records.get(&actor)
    }

    pub fn is_loaded(&self, actor: ActorId) -> bool {
        self.records.contains_key(&actor)
    }

    /// The document an actor contributes to, if its metadata is loaded.
    pub fn doc_for(&self, actor: ActorId) -> Option<DocId> {
        self.records.get(&actor).map(|m| m.doc_id)
    }

    /// Every actor whose metadata declares this doc id.
    pub fn actors_for_doc(&self, doc: DocId) -> BTreeSet<ActorId> {
        self.doc_index.get(&doc).cloned().unwrap_or_default()
    }

    /// Every actor in a fork group, across all of its documents.
    pub fn group_members(&self, group: GroupId) -> BTreeSet<ActorId> {
        self.group_index.get(&group).cloned().unwrap_or_default()
    }

    /// Number of loaded records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
