//! Change records: the unit of replication.
//!
//! A change is one atomic delta authored by one actor. Changes from the
//! same actor are totally ordered by `seq` (starting at 1 — block 0 of a
//! feed holds metadata, never a change). Cross-actor ordering is declared
//! by `deps`: for every other actor whose history the change extends, the
//! highest sequence number it depends on.
//!
//! Changes travel as UTF-8 JSON blocks, so the codec here is strict:
//! unknown fields or malformed shapes are rejected rather than defaulted.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::keys::ActorId;

/// Per-actor sequence number. Change seqs start at 1.
pub type Seq = u64;

/// Vector clock: highest applied (or depended-on) seq per actor, inclusive.
pub type Clock = BTreeMap<ActorId, Seq>;

/// One field mutation inside a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Op {
    /// Set a field to a value
    Set { key: String, value: Value },
    /// Remove a field
    Del { key: String },
}

impl Op {
    pub fn key(&self) -> &str {
        match self {
            Op::Set { key, .. } => key,
            Op::Del { key } => key,
        }
    }
}

/// One atomic CRDT delta with causal dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Change {
    /// Authoring actor
    pub actor: ActorId,
    /// Position in the author's history, starting at 1
    pub seq: Seq,
    /// Highest seq depended on per *other* actor (the author's own causal
    /// past is implicit in `seq`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deps: Clock,
    /// Field mutations, applied in order
    pub ops: Vec<Op>,
    /// Optional commit message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Change {
    /// The causal context this change was authored against: its declared
    /// deps plus the author's own prior history.
    pub fn context(&self) -> Clock {
        let mut ctx = self.deps.clone();
        if self.seq > 1 {
            ctx.insert(self.actor, self.seq - 1);
        }
        ctx
    }

    /// Whether every dependency is satisfied by `clock` and the change is
    /// the next one in its author's history.
    pub fn deliverable(&self, clock: &Clock) -> bool {
        if self.seq != clock.get(&self.actor).copied().unwrap_or(0) + 1 {
            return false;
        }
        self.deps
            .iter()
            .all(|(actor, seq)| clock.get(actor).copied().unwrap_or(0) >= *seq)
    }

    /// Serialize to the UTF-8 JSON block format.
    pub fn encode(&self) -> Result<Vec<u8>, ChangeError> {
        serde_json::to_vec(self).map_err(|e| ChangeError::Encode(e.to_string()))
    }

    /// Parse from a JSON block. Strict: unknown fields are an error.
    pub fn decode(bytes: &[u8]) -> Result<Self, ChangeError> {
        serde_json::from_slice(bytes).map_err(|e| ChangeError::Decode(e.to_string()))
    }
}

/// Change codec errors.
#[derive(Debug, Clone)]
pub enum ChangeError {
    Encode(String),
    Decode(String),
}

impl fmt::Display for ChangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeError::Encode(e) => write!(f, "change encode error: {e}"),
            ChangeError::Decode(e) => write!(f, "change decode error: {e}"),
        }
    }
}

impl std::error::Error for ChangeError {}

/// Whether clock `a` contains the event (actor, seq).
pub fn clock_contains(clock: &Clock, actor: ActorId, seq: Seq) -> bool {
    clock.get(&actor).copied().unwrap_or(0) >= seq
}

/// Merge `other` into `clock`, keeping per-actor maxima.
pub fn clock_union(clock: &mut Clock, other: &Clock) {
    for (actor, seq) in other {
        let entry = clock.entry(*actor).or_insert(0);
        if *seq > *entry {
            *entry = *seq;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keypair;
    use serde_json::json;

    fn actor() -> ActorId {
        Keypair::generate().actor_id()
    }

    fn set(key: &str, value: &str) -> Op {
        Op::Set {
            key: key.to_string(),
            value: json!(value),
        }
    }

    #[test]
    fn test_change_json_roundtrip() {
        let a = actor();
        let b = actor();
        let change = Change {
            actor: a,
            seq: 3,
            deps: [(b, 7)].into_iter().collect(),
            ops: vec![set("x0y0", "w"), Op::Del { key: "gone".into() }],
            message: Some("paint".into()),
        };

        let bytes = change.encode().unwrap();
        let back = Change::decode(&bytes).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn test_change_json_shape() {
        let a = actor();
        let change = Change {
            actor: a,
            seq: 1,
            deps: Clock::new(),
            ops: vec![set("k", "v")],
            message: None,
        };
        let value: Value = serde_json::from_slice(&change.encode().unwrap()).unwrap();

        assert_eq!(value["actor"], json!(a.to_hex()));
        assert_eq!(value["seq"], json!(1));
        assert_eq!(value["ops"][0]["action"], json!("set"));
        // Empty deps and message are omitted entirely
        assert!(value.get("deps").is_none());
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_decode_rejects_unknown_fields() {
        let raw = format!(
            r#"{{"actor":"{}","seq":1,"ops":[],"surprise":true}}"#,
            actor().to_hex()
        );
        assert!(Change::decode(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Change::decode(b"not json").is_err());
        assert!(Change::decode(b"{}").is_err());
    }

    #[test]
    fn test_deliverable_requires_contiguous_seq() {
        let a = actor();
        let change = Change {
            actor: a,
            seq: 2,
            deps: Clock::new(),
            ops: vec![],
            message: None,
        };

        let empty = Clock::new();
        assert!(!change.deliverable(&empty));

        let ready: Clock = [(a, 1)].into_iter().collect();
        assert!(change.deliverable(&ready));

        // Already applied
        let past: Clock = [(a, 2)].into_iter().collect();
        assert!(!change.deliverable(&past));
    }

    #[test]
    fn test_deliverable_requires_deps() {
        let a = actor();
        let b = actor();
        let change = Change {
            actor: a,
            seq: 1,
            deps: [(b, 2)].into_iter().collect(),
            ops: vec![],
            message: None,
        };

        let missing: Clock = [(b, 1)].into_iter().collect();
        assert!(!change.deliverable(&missing));

        let ready: Clock = [(b, 2)].into_iter().collect();
        assert!(change.deliverable(&ready));
    }

    #[test]
    fn test_context_includes_own_past() {
        let a = actor();
        let b = actor();
        let change = Change {
            actor: a,
            seq: 5,
            deps: [(b, 2)].into_iter().collect(),
            ops: vec![],
            message: None,
        };

        let ctx = change.context();
        assert_eq!(ctx.get(&a), Some(&4));
        assert_eq!(ctx.get(&b), Some(&2));

        // A first change has no own past
        let first = Change {
            actor: a,
            seq: 1,
            deps: Clock::new(),
            ops: vec![],
            message: None,
        };
        assert!(first.context().get(&a).is_none());
    }

    #[test]
    fn test_clock_union_keeps_maxima() {
        let a = actor();
        let b = actor();
        let mut clock: Clock = [(a, 3)].into_iter().collect();
        let other: Clock = [(a, 1), (b, 2)].into_iter().collect();

        clock_union(&mut clock, &other);
        assert_eq!(clock.get(&a), Some(&3));
        assert_eq!(clock.get(&b), Some(&2));
    }
}
