//! RocksDB-backed feed archive.
//!
//! Column families:
//! - `feeds`  — one record per feed (actor id, signing key if writable,
//!              last known length)
//! - `blocks` — feed blocks (LZ4 compressed, keyed by actor:index)
//!
//! The archive is the durable half of the registry: on open, every
//! archived feed is re-registered and its blocks restored, which is what
//! lets a process come back after a restart and resume replication where
//! it stopped. Removing a document evicts its feed from the live registry
//! but never deletes blocks from disk.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, Options,
    SingleThreaded,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::keys::ActorId;

const CF_FEEDS: &str = "feeds";
const CF_BLOCKS: &str = "blocks";

const COLUMN_FAMILIES: &[&str] = &[CF_FEEDS, CF_BLOCKS];

/// Archive configuration.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: f64,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("hypermerge_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10.0,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl ArchiveConfig {
    /// Config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10.0,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// One archived feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    /// The feed's actor id
    pub actor: ActorId,
    /// Signing key bytes, present only for feeds this process writes
    pub secret_key: Option<[u8; 32]>,
    /// Length at last archive time
    pub length: u64,
}

/// Archive errors.
#[derive(Debug, Clone)]
pub enum ArchiveError {
    /// RocksDB internal error
    Database(String),
    /// Record encode/decode failed
    Serialization(String),
    /// Stored block failed LZ4 decompression
    Decompression(String),
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveError::Database(e) => write!(f, "archive database error: {e}"),
            ArchiveError::Serialization(e) => write!(f, "archive serialization error: {e}"),
            ArchiveError::Decompression(e) => write!(f, "archive decompression error: {e}"),
        }
    }
}

impl std::error::Error for ArchiveError {}

impl From<rocksdb::Error> for ArchiveError {
    fn from(e: rocksdb::Error) -> Self {
        ArchiveError::Database(e.to_string())
    }
}

/// Durable feed storage.
pub struct FeedArchive {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
}

impl FeedArchive {
    /// Open the archive at the configured path, creating it if missing.
    pub fn open(config: ArchiveConfig) -> Result<Self, ArchiveError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                cf_opts.set_write_buffer_size(config.write_buffer_size);
                let mut block_opts = BlockBasedOptions::default();
                block_opts.set_block_cache(&cache);
                block_opts.set_bloom_filter(config.bloom_filter_bits, false);
                cf_opts.set_block_based_table_factory(&block_opts);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(FeedArchive { db })
    }

    /// Store or update a feed record.
    pub fn put_feed(&self, record: &FeedRecord) -> Result<(), ArchiveError> {
        let cf = self.cf(CF_FEEDS)?;
        let value = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| ArchiveError::Serialization(e.to_string()))?;
        self.db.put_cf(cf, record.actor.as_bytes(), value)?;
        Ok(())
    }

    /// Load one feed record.
    pub fn get_feed(&self, actor: ActorId) -> Result<Option<FeedRecord>, ArchiveError> {
        let cf = self.cf(CF_FEEDS)?;
        match self.db.get_cf(cf, actor.as_bytes())? {
            Some(bytes) => {
                let (record, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| ArchiveError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Every archived feed, for startup enumeration.
    pub fn list_feeds(&self) -> Result<Vec<FeedRecord>, ArchiveError> {
        let cf = self.cf(CF_FEEDS)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let (record, _) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map_err(|e| ArchiveError::Serialization(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Store one block, LZ4 compressed.
    pub fn put_block(&self, actor: ActorId, index: u64, block: &[u8]) -> Result<(), ArchiveError> {
        let cf = self.cf(CF_BLOCKS)?;
        let compressed = lz4_flex::compress_prepend_size(block);
        self.db.put_cf(cf, block_key(actor, index), compressed)?;
        Ok(())
    }

    /// Load one block.
    pub fn get_block(&self, actor: ActorId, index: u64) -> Result<Option<Vec<u8>>, ArchiveError> {
        let cf = self.cf(CF_BLOCKS)?;
        match self.db.get_cf(cf, block_key(actor, index))? {
            Some(compressed) => {
                let block = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| ArchiveError::Decompression(e.to_string()))?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    /// Every locally present block of one feed, in index order.
    pub fn blocks_for(&self, actor: ActorId) -> Result<Vec<(u64, Vec<u8>)>, ArchiveError> {
        let cf = self.cf(CF_BLOCKS)?;
        let prefix = actor.as_bytes().to_vec();
        let mut blocks = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, rocksdb::Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let index = index_from_key(&key);
            let block = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| ArchiveError::Decompression(e.to_string()))?;
            blocks.push((index, block));
        }
        Ok(blocks)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, ArchiveError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ArchiveError::Database(format!("missing column family {name}")))
    }
}

/// Block key: 32 raw actor bytes + big-endian index, so per-feed blocks
/// iterate contiguously and in order.
fn block_key(actor: ActorId, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(actor.as_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn index_from_key(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[32..40]);
    u64::from_be_bytes(buf)
}
