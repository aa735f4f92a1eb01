//! Materialized CRDT document state.
//!
//! A document is the deterministic fold of an unordered set of causally
//! linked changes:
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                  Document                       │
//! │                                                │
//! │  clock:   {actor → highest applied seq}        │
//! │  history: applied changes, per actor, in order │
//! │  pending: changes whose deps are unmet         │
//! │  fields:  per key, concurrent write candidates │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Delivery is causal: a change applies only when it is the next in its
//! author's history and every declared dependency has been applied.
//! Anything else parks in `pending` and is retried to fixed point, so
//! `apply_changes` is commutative, associative and idempotent over the
//! change set.
//!
//! Concurrent writes to one key keep every candidate. The materialized
//! winner is the candidate with the lexicographically greatest actor id;
//! the losers stay visible through [`Document::conflicts`].

use std::collections::BTreeMap;

use serde_json::Value;

use crate::crdt::change::{clock_contains, Change, Clock, Op, Seq};
use crate::keys::ActorId;

/// One surviving write to a field. `value == None` records a deletion.
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    actor: ActorId,
    seq: Seq,
    value: Option<Value>,
}

/// A collaborative document materialized from a change graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    actor: ActorId,
    clock: Clock,
    history: BTreeMap<ActorId, Vec<Change>>,
    pending: Vec<Change>,
    fields: BTreeMap<String, Vec<Candidate>>,
}

impl Document {
    /// Empty document authored by `actor`.
    pub fn new(actor: ActorId) -> Self {
        Document {
            actor,
            clock: Clock::new(),
            history: BTreeMap::new(),
            pending: Vec::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Clone this document's full state under a new authoring actor.
    ///
    /// Used by fork: the new document shares all applied history but its
    /// future changes are authored by `actor`.
    pub fn fork_as(&self, actor: ActorId) -> Self {
        let mut doc = self.clone();
        doc.set_actor(actor);
        doc
    }

    /// Retarget the authoring actor in place. Used when this process
    /// allocates its own writer feed for a document it opened.
    pub fn set_actor(&mut self, actor: ActorId) {
        self.actor = actor;
    }

    /// The local authoring actor.
    pub fn actor(&self) -> ActorId {
        self.actor
    }

    /// Highest applied seq per actor.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// The next seq this document would author.
    pub fn next_seq(&self) -> Seq {
        self.clock.get(&self.actor).copied().unwrap_or(0) + 1
    }

    /// Author one new change by running `f` against a transaction proxy.
    ///
    /// The change is applied locally and returned so the caller can append
    /// it to the author's feed. An empty `f` still produces a change — an
    /// empty change extends causality without touching fields, which is
    /// exactly what merge and fork seeds need.
    pub fn change<F>(&mut self, message: Option<&str>, f: F) -> Change
    where
        F: FnOnce(&mut Transaction<'_>),
    {
        let mut txn = Transaction {
            doc: self,
            ops: Vec::new(),
        };
        f(&mut txn);
        let ops = txn.ops;

        let mut deps = self.clock.clone();
        deps.remove(&self.actor); // own past is implicit in seq

        let change = Change {
            actor: self.actor,
            seq: self.next_seq(),
            deps,
            ops,
            message: message.map(str::to_string),
        };
        self.apply_one(change.clone());
        change
    }

    /// Apply a batch of remote changes.
    ///
    /// Deliverable changes apply immediately; the rest park in the pending
    /// set and are retried after every successful application. Returns the
    /// number of changes actually applied (0 means nothing new).
    pub fn apply_changes<I>(&mut self, changes: I) -> usize
    where
        I: IntoIterator<Item = Change>,
    {
        for change in changes {
            if self.seen(&change) {
                continue;
            }
            self.pending.push(change);
        }
        self.drain_pending()
    }

    /// Fold every change applied in `other` that this document lacks.
    pub fn merge(&mut self, other: &Document) -> usize {
        let new = other.changes_since(&self.clock);
        self.apply_changes(new)
    }

    /// Every applied change newer than `clock`, in per-actor seq order.
    pub fn changes_since(&self, clock: &Clock) -> Vec<Change> {
        let mut out = Vec::new();
        for (actor, changes) in &self.history {
            let have = clock.get(actor).copied().unwrap_or(0) as usize;
            if have < changes.len() {
                out.extend(changes[have..].iter().cloned());
            }
        }
        out
    }

    /// Missing causal dependencies: `{actor → highest seq needed}`.
    ///
    /// Computed from the pending set against the applied clock. A pending
    /// change with a same-actor gap below it reports the gap too.
    pub fn missing_deps(&self) -> Clock {
        let mut needed = Clock::new();
        for change in &self.pending {
            for (actor, seq) in &change.deps {
                if self.clock.get(actor).copied().unwrap_or(0) < *seq {
                    let entry = needed.entry(*actor).or_insert(0);
                    if *seq > *entry {
                        *entry = *seq;
                    }
                }
            }
            let applied = self.clock.get(&change.actor).copied().unwrap_or(0);
            if change.seq > applied + 1 {
                let entry = needed.entry(change.actor).or_insert(0);
                if change.seq - 1 > *entry {
                    *entry = change.seq - 1;
                }
            }
        }
        needed
    }

    /// Materialized field map: the winning value per live key.
    pub fn state(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for (key, candidates) in &self.fields {
            if let Some(value) = Self::winner(candidates).and_then(|c| c.value.clone()) {
                out.insert(key.clone(), value);
            }
        }
        out
    }

    /// Read one field's winning value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields
            .get(key)
            .and_then(|c| Self::winner(c))
            .and_then(|c| c.value.as_ref())
    }

    /// Conflict side-channel: `{key → {losing actor → losing value}}`.
    ///
    /// Only keys with more than one surviving candidate appear. Losing
    /// deletions are not reported (there is no value to show).
    pub fn conflicts(&self) -> BTreeMap<String, BTreeMap<ActorId, Value>> {
        let mut out = BTreeMap::new();
        for (key, candidates) in &self.fields {
            if candidates.len() < 2 {
                continue;
            }
            let winner = match Self::winner(candidates) {
                Some(w) => w.actor,
                None => continue,
            };
            let losers: BTreeMap<ActorId, Value> = candidates
                .iter()
                .filter(|c| c.actor != winner)
                .filter_map(|c| c.value.clone().map(|v| (c.actor, v)))
                .collect();
            if !losers.is_empty() {
                out.insert(key.clone(), losers);
            }
        }
        out
    }

    /// Whether a change with this (actor, seq) is already applied or parked.
    fn seen(&self, change: &Change) -> bool {
        if clock_contains(&self.clock, change.actor, change.seq) {
            return true;
        }
        self.pending
            .iter()
            .any(|p| p.actor == change.actor && p.seq == change.seq)
    }

    /// Retry the pending set until nothing more delivers.
    fn drain_pending(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let next = self
                .pending
                .iter()
                .position(|c| c.deliverable(&self.clock));
            match next {
                Some(i) => {
                    let change = self.pending.swap_remove(i);
                    self.apply_one(change);
                    applied += 1;
                }
                None => break,
            }
        }
        applied
    }

    /// Apply one deliverable change: advance the clock, record history,
    /// fold ops into the field candidates.
    fn apply_one(&mut self, change: Change) {
        debug_assert!(change.deliverable(&self.clock));
        let ctx = change.context();

        for op in &change.ops {
            let candidates = self.fields.entry(op.key().to_string()).or_default();
            // Drop candidates in this change's causal past; a second op on
            // the same key within one change supersedes the first.
            candidates.retain(|c| {
                !(c.actor == change.actor && c.seq == change.seq)
                    && !clock_contains(&ctx, c.actor, c.seq)
            });
            candidates.push(Candidate {
                actor: change.actor,
                seq: change.seq,
                value: match op {
                    Op::Set { value, .. } => Some(value.clone()),
                    Op::Del { .. } => None,
                },
            });
        }

        self.clock.insert(change.actor, change.seq);
        self.history.entry(change.actor).or_default().push(change);
    }

    fn winner(candidates: &[Candidate]) -> Option<&Candidate> {
        candidates.iter().max_by_key(|c| c.actor)
    }
}

/// Mutation proxy handed to [`Document::change`] closures.
pub struct Transaction<'a> {
    doc: &'a Document,
    ops: Vec<Op>,
}

impl Transaction<'_> {
    /// Set a field.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.ops.push(Op::Set {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Delete a field.
    pub fn del(&mut self, key: impl Into<String>) {
        self.ops.push(Op::Del { key: key.into() });
    }

    /// Read a field as it stands inside this transaction: local ops first,
    /// then the pre-change document state.
    pub fn get(&self, key: &str) -> Option<Value> {
        for op in self.ops.iter().rev() {
            if op.key() == key {
                return match op {
                    Op::Set { value, .. } => Some(value.clone()),
                    Op::Del { .. } => None,
                };
            }
        }
        self.doc.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Deterministic actor ids: `actor(1) < actor(2) < ...` in the
    /// byte-lexicographic order conflicts are resolved by.
    fn actor(n: u8) -> ActorId {
        ActorId::from_bytes([n; 32])
    }

    #[test]
    fn test_solo_change_materializes() {
        let mut doc = Document::new(actor(1));
        doc.change(Some("init"), |t| {
            t.set("x0y0", "w");
            t.set("x0y1", "w");
        });

        assert_eq!(doc.get("x0y0"), Some(&json!("w")));
        assert_eq!(doc.state().len(), 2);
        assert_eq!(doc.clock().get(&actor(1)), Some(&1));
        assert!(doc.conflicts().is_empty());
    }

    #[test]
    fn test_own_overwrite_is_not_a_conflict() {
        let mut doc = Document::new(actor(1));
        doc.change(None, |t| t.set("k", "a"));
        doc.change(None, |t| t.set("k", "b"));

        assert_eq!(doc.get("k"), Some(&json!("b")));
        assert!(doc.conflicts().is_empty());
    }

    #[test]
    fn test_transfer_changes_between_replicas() {
        let mut a = Document::new(actor(1));
        a.change(None, |t| t.set("k", "v"));

        let mut b = Document::new(actor(2));
        let applied = b.apply_changes(a.changes_since(&Clock::new()));
        assert_eq!(applied, 1);
        assert_eq!(b.get("k"), Some(&json!("v")));
        assert_eq!(b.clock(), a.clock());
    }

    #[test]
    fn test_causal_overwrite_across_actors() {
        let mut a = Document::new(actor(1));
        a.change(None, |t| t.set("k", "from-a"));

        let mut b = Document::new(actor(2));
        b.apply_changes(a.changes_since(&Clock::new()));
        // B saw A's write, so B's write causally supersedes it
        b.change(None, |t| t.set("k", "from-b"));

        a.apply_changes(b.changes_since(a.clock()));
        assert_eq!(a.get("k"), Some(&json!("from-b")));
        assert!(a.conflicts().is_empty());
    }

    #[test]
    fn test_concurrent_writes_conflict_highest_actor_wins() {
        let low = actor(1);
        let high = actor(2);

        let mut a = Document::new(low);
        let mut b = Document::new(high);

        a.change(None, |t| t.set("k", "low"));
        b.change(None, |t| t.set("k", "high"));

        let from_b = b.changes_since(&Clock::new());
        let from_a = a.changes_since(&Clock::new());
        a.apply_changes(from_b);
        b.apply_changes(from_a);

        for doc in [&a, &b] {
            assert_eq!(doc.get("k"), Some(&json!("high")));
            let conflicts = doc.conflicts();
            assert_eq!(conflicts["k"].get(&low), Some(&json!("low")));
            assert_eq!(conflicts["k"].len(), 1);
        }
    }

    #[test]
    fn test_conflict_cleared_by_later_write() {
        let mut a = Document::new(actor(1));
        let mut b = Document::new(actor(2));

        a.change(None, |t| t.set("k", "low"));
        b.change(None, |t| t.set("k", "high"));
        let from_b = b.changes_since(&Clock::new());
        let from_a = a.changes_since(&Clock::new());
        a.apply_changes(from_b);
        b.apply_changes(from_a);
        assert!(!a.conflicts().is_empty());

        // A new write from either side dominates both candidates
        b.change(None, |t| t.set("k", "settled"));
        a.apply_changes(b.changes_since(a.clock()));
        assert_eq!(a.get("k"), Some(&json!("settled")));
        assert!(a.conflicts().is_empty());
    }

    #[test]
    fn test_apply_is_commutative() {
        let mut a = Document::new(actor(1));
        a.change(None, |t| t.set("x", "1"));
        a.change(None, |t| t.set("y", "2"));
        let mut b = Document::new(actor(2));
        b.change(None, |t| t.set("z", "3"));

        let set_a = a.changes_since(&Clock::new());
        let set_b = b.changes_since(&Clock::new());

        let mut fwd = Document::new(actor(9));
        fwd.apply_changes(set_a.iter().cloned());
        fwd.apply_changes(set_b.iter().cloned());

        let mut rev = Document::new(actor(9));
        rev.apply_changes(set_b);
        rev.apply_changes(set_a.into_iter().rev());

        assert_eq!(fwd.state(), rev.state());
        assert_eq!(fwd.clock(), rev.clock());
        assert_eq!(fwd.conflicts(), rev.conflicts());
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut a = Document::new(actor(1));
        a.change(None, |t| t.set("k", "v"));
        let changes = a.changes_since(&Clock::new());

        let mut b = Document::new(actor(2));
        assert_eq!(b.apply_changes(changes.iter().cloned()), 1);
        assert_eq!(b.apply_changes(changes), 0);
        assert_eq!(b.get("k"), Some(&json!("v")));
    }

    #[test]
    fn test_out_of_order_delivery_parks_then_applies() {
        let mut a = Document::new(actor(1));
        a.change(None, |t| t.set("k", "1"));
        a.change(None, |t| t.set("k", "2"));
        let changes = a.changes_since(&Clock::new());

        let mut b = Document::new(actor(2));
        // Deliver seq 2 first: parks, reports the gap
        assert_eq!(b.apply_changes([changes[1].clone()]), 0);
        assert_eq!(b.missing_deps().get(&actor(1)), Some(&1));
        assert!(b.get("k").is_none());

        // Gap fills, both apply
        assert_eq!(b.apply_changes([changes[0].clone()]), 2);
        assert!(b.missing_deps().is_empty());
        assert_eq!(b.get("k"), Some(&json!("2")));
    }

    #[test]
    fn test_missing_deps_from_cross_actor_dep() {
        let mut a = Document::new(actor(1));
        a.change(None, |t| t.set("k", "v"));
        let mut b = Document::new(actor(2));
        b.apply_changes(a.changes_since(&Clock::new()));
        b.change(None, |t| t.set("k", "w"));

        // A third replica receives only B's change
        let mut c = Document::new(actor(3));
        c.apply_changes(b.changes_since(a.clock()));
        assert_eq!(c.missing_deps().get(&actor(1)), Some(&1));

        c.apply_changes(a.changes_since(&Clock::new()));
        assert!(c.missing_deps().is_empty());
        assert_eq!(c.get("k"), Some(&json!("w")));
    }

    #[test]
    fn test_delete_wins_over_causal_past() {
        let mut a = Document::new(actor(1));
        a.change(None, |t| t.set("k", "v"));
        a.change(None, |t| t.del("k"));

        assert!(a.get("k").is_none());
        assert!(a.state().is_empty());
    }

    #[test]
    fn test_empty_change_extends_causality() {
        let mut a = Document::new(actor(1));
        a.change(None, |t| t.set("k", "v"));

        let mut b = Document::new(actor(2));
        b.merge(&a);
        let seed = b.change(Some("merge"), |_| {});

        assert_eq!(seed.deps.get(&actor(1)), Some(&1));
        assert!(seed.ops.is_empty());

        // A replica that only sees the seed knows what it is missing
        let mut c = Document::new(actor(3));
        c.apply_changes([seed]);
        assert_eq!(c.missing_deps().get(&actor(1)), Some(&1));
    }

    #[test]
    fn test_fork_as_keeps_state_changes_author() {
        let mut a = Document::new(actor(1));
        a.change(None, |t| t.set("k", "v"));

        let mut fork = a.fork_as(actor(2));
        assert_eq!(fork.get("k"), Some(&json!("v")));
        assert_eq!(fork.actor(), actor(2));

        let change = fork.change(None, |t| t.set("k2", "v2"));
        assert_eq!(change.actor, actor(2));
        assert_eq!(change.seq, 1);
    }

    #[test]
    fn test_transaction_get_sees_local_ops() {
        let mut doc = Document::new(actor(1));
        doc.change(None, |t| t.set("k", "old"));
        doc.change(None, |t| {
            assert_eq!(t.get("k"), Some(json!("old")));
            t.set("k", "new");
            assert_eq!(t.get("k"), Some(json!("new")));
            t.del("k");
            assert_eq!(t.get("k"), None);
        });
        assert!(doc.get("k").is_none());
    }
}
