//! Block request cursors.
//!
//! One cursor per (doc, actor): the exclusive upper bound of blocks this
//! process has already asked that actor's feed for — or authored locally,
//! which counts the same. Cursors start at 1 (block 0 is metadata, never a
//! change) and only ever move forward, which is what makes block fetching
//! idempotent: the causal loader can be re-entered from any trigger and
//! never issues a request twice.

use std::collections::HashMap;

use crate::keys::{ActorId, DocId};

/// Per-(doc, actor) monotone request cursors.
#[derive(Debug, Default)]
pub struct RequestTracker {
    cursors: HashMap<(DocId, ActorId), u64>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the cursor to `max(current, upper)` and return the prior
    /// value. The returned bound and `upper` bracket exactly the blocks
    /// that still need requesting: `[returned, upper)`.
    pub fn max(&mut self, doc: DocId, actor: ActorId, upper: u64) -> u64 {
        let entry = self.cursors.entry((doc, actor)).or_insert(1);
        let prior = *entry;
        if upper > *entry {
            *entry = upper;
        }
        prior
    }

    /// Current cursor without advancing it.
    pub fn get(&self, doc: DocId, actor: ActorId) -> u64 {
        self.cursors.get(&(doc, actor)).copied().unwrap_or(1)
    }
}
