//! # hypermerge — peer-to-peer CRDT document replication
//!
//! Multiple peers collaboratively edit structured documents with eventual
//! consistency, offline tolerance, and automatic conflict resolution.
//! Every writer owns one append-only feed of its own changes; a document
//! is the deterministic fold of the change blocks of every feed bound to
//! it, and peers exchange feeds over a swarm of duplex connections.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   create/change/merge/fork    ┌─────────────┐
//! │   caller    │ ◄───────────────────────────► │    Repo     │
//! └─────────────┘        RepoEvent stream       └──────┬──────┘
//!                                                      │
//!                  ┌───────────────┬───────────────────┤
//!                  ▼               ▼                   ▼
//!           ┌────────────┐  ┌────────────┐      ┌────────────┐
//!           │CausalLoader│  │FeedRegistry│      │   Swarm    │
//!           │ deps→blocks│  │ feeds+disk │      │ WebSocket  │
//!           └─────┬──────┘  └─────┬──────┘      └─────┬──────┘
//!                 ▼               ▼                   ▼
//!           ┌────────────┐  ┌────────────┐      ┌────────────┐
//!           │  Document  │  │   Feed     │◄────►│   peers    │
//!           │  (CRDT)    │  │ blocks 0..n│      │ Open/Data  │
//!           └────────────┘  └────────────┘      └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`keys`] — ed25519 actor identity, doc/group ids, discovery keys
//! - [`crdt`] — changes, causal delivery, conflict materialization
//! - [`feed`] — append-only block logs (block 0 is metadata)
//! - [`metadata`] — the block-0 record and the doc/group indices
//! - [`tracker`] — monotone block-request cursors
//! - [`registry`] — the owning table of live feeds, backed by the archive
//! - [`loader`] — the causal loader fixed point
//! - [`protocol`] — wire envelope and the `hypermerge` extension channel
//! - [`swarm`] — WebSocket peer connections and block transfer
//! - [`repo`] — the orchestrator and its event stream
//! - [`storage`] — RocksDB feed archive (LZ4 block compression)

pub mod crdt;
pub mod feed;
pub mod keys;
pub mod loader;
pub mod metadata;
pub mod protocol;
pub mod registry;
pub mod repo;
pub mod storage;
pub mod swarm;
pub mod tracker;

// Re-exports for convenience
pub use crdt::{Change, Clock, Document, Op, Transaction};
pub use keys::{ActorId, DiscoveryKey, DocId, GroupId, Keypair};
pub use metadata::{FeedMetadata, MetadataError, MetadataStore};
pub use protocol::{ExtensionMessage, PeerId, WireMessage, EXTENSION_NAME};
pub use repo::{Repo, RepoConfig, RepoError, RepoEvent};
pub use storage::{ArchiveConfig, FeedArchive};
