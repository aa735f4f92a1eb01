//! CRDT change graph: changes, causal delivery, conflict materialization.
//!
//! The replication engine treats documents as the deterministic fold of an
//! unordered change set. This module supplies that algebra:
//!
//! - [`Change`] — one atomic delta with a causal dependency vector
//! - [`Document`] — materialized state with pending-set causal delivery
//! - [`Transaction`] — the mutation proxy handed to change closures
//!
//! Everything above this module (feeds, loader, repo) moves changes around
//! without interpreting them; everything in here is pure state with no I/O.

pub mod change;
pub mod document;

pub use change::{clock_contains, clock_union, Change, ChangeError, Clock, Op, Seq};
pub use document::{Document, Transaction};
