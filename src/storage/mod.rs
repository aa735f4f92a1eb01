//! Durable storage for feeds.
//!
//! One RocksDB database holds every feed this process has seen: the feed
//! records (with signing keys for writable feeds) and the raw blocks, LZ4
//! compressed. Storage is optional — a repo opened without a storage path
//! runs entirely in memory and forgets everything on shutdown.

pub mod archive;

pub use archive::{ArchiveConfig, ArchiveError, FeedArchive, FeedRecord};
