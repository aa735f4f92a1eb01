//! Actor identity keys.
//!
//! Every writer owns one append-only feed, and the feed is named by the
//! writer's ed25519 public key. That 32-byte key — rendered as 64 chars of
//! lowercase hex — is the `ActorId` used everywhere in the engine. A
//! `DocId` is the same key elevated to the role of "root feed of a
//! document"; a `GroupId` ties a document to all of its forks.
//!
//! Discovery keys are a keyed hash of the public key so that swarm
//! rendezvous does not leak the feed key itself.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Domain string mixed into the discovery-key hash.
const DISCOVERY_CONTEXT: &[u8] = b"hypermerge";

/// Key handling errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Hex string was not 64 lowercase hex chars
    InvalidHex(String),
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::InvalidHex(s) => write!(f, "invalid actor id hex: {s}"),
        }
    }
}

impl std::error::Error for KeyError {}

/// One writer's identity: the public key of its feed.
///
/// Ordering is byte-lexicographic, which matches the ordering of the hex
/// rendering. Conflict resolution in the CRDT layer relies on this.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActorId([u8; 32]);

impl ActorId {
    /// Build from raw public-key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ActorId(bytes)
    }

    /// The raw 32-byte public key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// 64-char lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from the 64-char lowercase hex rendering.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidHex(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidHex(s.to_string()))?;
        Ok(ActorId(arr))
    }

    /// Swarm rendezvous token for this actor's feed.
    ///
    /// Keyed blake3 hash of the public key so that knowing the discovery
    /// key does not reveal the feed key.
    pub fn discovery_key(&self) -> DiscoveryKey {
        DiscoveryKey(*blake3::keyed_hash(&self.0, DISCOVERY_CONTEXT).as_bytes())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({}..)", &self.to_hex()[..8])
    }
}

impl FromStr for ActorId {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActorId::from_hex(s)
    }
}

// Actor ids cross the wire as hex strings (JSON metadata, FEEDS_SHARED
// payloads), so serde goes through the hex rendering in both directions.
impl Serialize for ActorId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ActorId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ActorId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// One logical shared document: the actor id of its root feed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(pub ActorId);

impl DocId {
    pub fn actor(&self) -> ActorId {
        self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        Ok(DocId(ActorId::from_hex(s)?))
    }
}

impl From<ActorId> for DocId {
    fn from(actor: ActorId) -> Self {
        DocId(actor)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({}..)", &self.to_hex()[..8])
    }
}

/// Equivalence class joining a document with all its forks.
pub type GroupId = ActorId;

/// Swarm rendezvous token derived from a feed's public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiscoveryKey([u8; 32]);

impl DiscoveryKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({}..)", &self.to_hex()[..8])
    }
}

/// A writable feed's signing key.
///
/// The actor id is the corresponding verifying key; a feed opened with
/// only an `ActorId` can be filled by replication but never appended to.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        Keypair {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild from stored secret-key bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Keypair {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Secret-key bytes for archival.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The actor id this keypair writes as.
    pub fn actor_id(&self) -> ActorId {
        ActorId(self.signing_key.verifying_key().to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({}..)", &self.actor_id().to_hex()[..8])
    }
}
