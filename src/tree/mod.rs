//! # B+Tree Module
//!
//! The in-memory side of the copy-on-write B+tree. Pages hold the durable
//! encoding; this module holds [`Node`], the decoded mutable form a
//! transaction works on, and [`NodeArena`], the transaction-owned arena
//! that gives nodes parent back-references without reference cycles.
//!
//! All values live in leaves; internal nodes only route. Structural
//! maintenance is deferred: `set`/`remove` mutate a single leaf, and the
//! commit path merges underfilled nodes bottom-up, then splits overfilled
//! ones top-down while writing every touched node to a freshly allocated
//! page (the old page goes to the freelist).

mod node;

pub use node::{Node, NodeArena, NodeId, SearchResult};
