//! Peer wire protocol.
//!
//! Two layers travel over one duplex connection:
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │ WireMessage (bincode envelope, one per frame)      │
//! │                                                    │
//! │  Open / Have / Request / Data   — block replication│
//! │  Extension { name, payload }    — named channels   │
//! │       └── "hypermerge": UTF-8 JSON {type, ...}     │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! Feeds are addressed on the wire by discovery key, never by public key:
//! rendezvous must not leak feed keys to peers that do not hold them.
//! Inside the `hypermerge` extension channel, keys ARE shared — that is
//! its purpose: FEEDS_SHARED announces which actor feeds belong to the
//! document group this connection replicates.
//!
//! The extension decoder is strict in shape but open in vocabulary: a
//! well-formed JSON object with an unknown `"type"` is handed to user
//! message handlers, anything malformed is dropped.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::keys::{ActorId, DiscoveryKey};

/// Transient id for one peer connection.
pub type PeerId = Uuid;

/// The named extension channel this engine speaks.
pub const EXTENSION_NAME: &str = "hypermerge";

/// One frame on a peer connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Announce interest in a feed
    Open { discovery_key: DiscoveryKey },
    /// Announce a feed's known length
    Have {
        discovery_key: DiscoveryKey,
        length: u64,
    },
    /// Ask for one block
    Request {
        discovery_key: DiscoveryKey,
        index: u64,
    },
    /// Deliver one block
    Data {
        discovery_key: DiscoveryKey,
        index: u64,
        block: Vec<u8>,
    },
    /// Named extension channel payload (UTF-8 JSON)
    Extension {
        discovery_key: DiscoveryKey,
        name: String,
        payload: Vec<u8>,
    },
}

impl WireMessage {
    /// Build a FEEDS_SHARED extension frame for a feed's channel.
    pub fn feeds_shared(
        discovery_key: DiscoveryKey,
        keys: impl IntoIterator<Item = ActorId>,
    ) -> Result<Self, ProtocolError> {
        let payload = ExtensionMessage::FeedsShared {
            keys: keys.into_iter().collect(),
        }
        .encode()?;
        Ok(WireMessage::Extension {
            discovery_key,
            name: EXTENSION_NAME.to_string(),
            payload,
        })
    }

    /// Serialize to the binary frame format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from a binary frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        match self {
            WireMessage::Open { discovery_key }
            | WireMessage::Have { discovery_key, .. }
            | WireMessage::Request { discovery_key, .. }
            | WireMessage::Data { discovery_key, .. }
            | WireMessage::Extension { discovery_key, .. } => *discovery_key,
        }
    }
}

/// Messages inside the `hypermerge` extension channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExtensionMessage {
    /// These actor feeds belong to the document group on this connection
    #[serde(rename = "FEEDS_SHARED")]
    FeedsShared { keys: Vec<ActorId> },
}

impl ExtensionMessage {
    /// Serialize to the UTF-8 JSON payload format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// Result of decoding an extension payload: a known message, or a
/// well-formed object of unknown type for user handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionPayload {
    Known(ExtensionMessage),
    Unknown(Value),
}

/// Decode a `hypermerge` extension payload.
///
/// Known `"type"` tags parse strictly; an unknown tag on a well-formed
/// object is surfaced as [`ExtensionPayload::Unknown`]; everything else
/// is a decode error.
pub fn decode_extension(payload: &[u8]) -> Result<ExtensionPayload, ProtocolError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::Decode("extension payload is not an object".into()));
    }
    match serde_json::from_value::<ExtensionMessage>(value.clone()) {
        Ok(msg) => Ok(ExtensionPayload::Known(msg)),
        Err(_) if value.get("type").is_some() => Ok(ExtensionPayload::Unknown(value)),
        Err(e) => Err(ProtocolError::Decode(e.to_string())),
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
    ConnectionClosed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Encode(e) => write!(f, "protocol encode error: {e}"),
            ProtocolError::Decode(e) => write!(f, "protocol decode error: {e}"),
            ProtocolError::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
