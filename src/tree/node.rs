//! # B+Tree Nodes
//!
//! A [`Node`] is the decoded, mutable materialization of one node page.
//! Keys, values, and child ids live in plain vectors; on the read path they
//! are zero-copy [`Bytes`] slices of the mmap epoch, and [`Node::dereference`]
//! swaps them for owned copies when the mapping is about to be replaced.
//!
//! ## Lifecycle
//!
//! A node is created by a transaction on first access to its page, mutated
//! only by that transaction, and ends in one of three ways:
//!
//! 1. re-serialized onto a freshly allocated page at commit (old page
//!    freed),
//! 2. merged into a sibling and freed entirely, or
//! 3. dropped at transaction end (read-only transactions).
//!
//! ## Arena
//!
//! Nodes never point at each other. [`NodeArena`] owns every node of one
//! transaction and hands out dense [`NodeId`] indices; the parent link is
//! an index into the same arena, so the parent/child graph needs no
//! reference counting and drops with the transaction.
//!
//! ## Split
//!
//! A node overfills when it has more than `MAX_KEYS` keys AND its
//! serialized size exceeds `PAGE_SIZE`. Splitting walks the records left
//! to right accumulating serialized size and cuts at the first index that
//! is at least `MIN_KEYS` in with at least `SPLIT_THRESHOLD` bytes behind
//! it; the left node keeps the prefix, a new right sibling takes the rest,
//! and the cut repeats on the right half until nothing overfills. Splitting
//! the root first manufactures a fresh parent seeded with the root's
//! separator; wiring that parent into the tree is the commit path's job.
//!
//! ## Underfill
//!
//! A node underfills when it has fewer than `MIN_KEYS` keys OR its
//! serialized size drops under `UNDERFILL_THRESHOLD`. Merging is driven by
//! the transaction because it must pick a sibling and rewire the parent.

use bytes::Bytes;
use eyre::{ensure, Result};
use smallvec::{smallvec, SmallVec};

use crate::config::{
    MAX_KEYS, MIN_KEYS, PAGE_HEADER_SIZE, PAGE_SIZE, SLOT_SIZE, SPLIT_THRESHOLD,
    UNDERFILL_THRESHOLD,
};
use crate::error::StoreError;
use crate::storage::{PageBuf, PageId, PageKind, PageRef};

/// Index of a node within its transaction's arena.
pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// The key exists at this index.
    Found(usize),
    /// The key is absent; this is the first strictly-greater index
    /// (`len` when every key is smaller).
    NotFound(usize),
}

#[derive(Debug, Default)]
pub struct Node {
    /// Backing page, 0 while the node has never been written out.
    pub(crate) page_id: PageId,
    pub(crate) is_leaf: bool,
    /// Set once the commit's merge pass has visited this node.
    pub(crate) balanced: bool,
    /// Set once the commit's spill pass has written this node to a page.
    pub(crate) spilled: bool,
    /// Set when the node was merged away; its arena slot stays dead.
    pub(crate) freed: bool,
    /// Enclosing node within the same transaction.
    pub(crate) parent: Option<NodeId>,
    /// Key under which the parent currently indexes this node. Kept even
    /// when `keys[0]` drifts, so the parent entry can be located and
    /// refreshed during merge and spill.
    pub(crate) separator: Option<Bytes>,
    pub(crate) keys: Vec<Bytes>,
    /// Leaf only.
    pub(crate) values: Vec<Bytes>,
    /// Internal only; `child_ids.len() == keys.len()`.
    pub(crate) child_ids: Vec<PageId>,
}

impl Node {
    pub fn leaf() -> Self {
        Self {
            is_leaf: true,
            ..Self::default()
        }
    }

    pub fn internal() -> Self {
        Self::default()
    }

    /// Decodes a node from a leaf or internal page.
    pub fn from_page(page: &PageRef, parent: Option<NodeId>) -> Result<Self> {
        let is_leaf = match page.kind() {
            PageKind::Leaf => true,
            PageKind::Internal => false,
            other => {
                return Err(StoreError::invariant(format!(
                    "decoding node from {:?} page {}",
                    other,
                    page.id()
                )))
            }
        };

        let count = page.count();
        let mut node = Node {
            page_id: page.id(),
            is_leaf,
            parent,
            keys: Vec::with_capacity(count),
            values: Vec::with_capacity(if is_leaf { count } else { 0 }),
            child_ids: Vec::with_capacity(if is_leaf { 0 } else { count }),
            ..Self::default()
        };

        for i in 0..count {
            node.keys.push(page.key_at(i)?);
            if is_leaf {
                node.values.push(page.value_at(i)?);
            } else {
                node.child_ids.push(page.child_id_at(i)?);
            }
        }

        node.separator = node.keys.first().cloned();
        Ok(node)
    }

    /// Serializes the node into a page buffer sized for `self.size()`.
    pub fn write(&self, buf: &mut PageBuf) -> Result<()> {
        if self.is_leaf {
            ensure!(
                self.keys.len() == self.values.len(),
                "leaf node with {} keys but {} values",
                self.keys.len(),
                self.values.len()
            );
            buf.set_kind(PageKind::Leaf);
        } else {
            ensure!(
                self.keys.len() == self.child_ids.len(),
                "internal node with {} keys but {} children",
                self.keys.len(),
                self.child_ids.len()
            );
            buf.set_kind(PageKind::Internal);
        }

        buf.set_count(self.keys.len() as u32);

        let mut offset = self.keys.len() * SLOT_SIZE;
        for (i, key) in self.keys.iter().enumerate() {
            if self.is_leaf {
                buf.write_key_value_at(i, offset, key, &self.values[i])?;
                offset += key.len() + self.values[i].len();
            } else {
                buf.write_key_child_at(i, offset, key, self.child_ids[i])?;
                offset += key.len();
            }
        }
        Ok(())
    }

    /// Binary search over the node's keys in byte-lexicographic order.
    pub fn search(&self, key: &[u8]) -> SearchResult {
        match self.keys.binary_search_by(|k| k.as_ref().cmp(key)) {
            Ok(i) => SearchResult::Found(i),
            Err(i) => SearchResult::NotFound(i),
        }
    }

    /// Index of the child to descend into for `key`: the child of the last
    /// separator that is less than or equal to the key. An exact separator
    /// match routes into that separator's own child; keys below every
    /// separator clamp to child 0.
    pub fn child_index(&self, key: &[u8]) -> usize {
        match self.search(key) {
            SearchResult::Found(i) => i,
            SearchResult::NotFound(i) => i.saturating_sub(1),
        }
    }

    pub fn insert_key_value_at(&mut self, i: usize, key: Bytes, value: Bytes) -> Result<()> {
        if !self.is_leaf {
            return Err(StoreError::invariant("inserting key/value into internal node"));
        }
        if i > self.keys.len() {
            return Err(StoreError::invariant(format!(
                "key/value insert index {} out of bounds {}",
                i,
                self.keys.len()
            )));
        }

        self.keys.insert(i, key);
        self.values.insert(i, value);
        Ok(())
    }

    pub fn insert_key_child_at(&mut self, i: usize, key: Bytes, child: PageId) -> Result<()> {
        if self.is_leaf {
            return Err(StoreError::invariant("inserting key/child into leaf node"));
        }
        if i > self.keys.len() {
            return Err(StoreError::invariant(format!(
                "key/child insert index {} out of bounds {}",
                i,
                self.keys.len()
            )));
        }

        self.keys.insert(i, key);
        self.child_ids.insert(i, child);
        Ok(())
    }

    pub fn remove_key_value_at(&mut self, i: usize) -> Result<(Bytes, Bytes)> {
        if !self.is_leaf {
            return Err(StoreError::invariant("removing key/value from internal node"));
        }
        if i >= self.keys.len() {
            return Err(StoreError::invariant(format!(
                "key/value remove index {} out of bounds {}",
                i,
                self.keys.len()
            )));
        }

        Ok((self.keys.remove(i), self.values.remove(i)))
    }

    pub fn remove_key_child_at(&mut self, i: usize) -> Result<(Bytes, PageId)> {
        if self.is_leaf {
            return Err(StoreError::invariant("removing key/child from leaf node"));
        }
        if i >= self.keys.len() {
            return Err(StoreError::invariant(format!(
                "key/child remove index {} out of bounds {}",
                i,
                self.keys.len()
            )));
        }

        Ok((self.keys.remove(i), self.child_ids.remove(i)))
    }

    /// Serialized size: header, one slot per key, then packed records.
    pub fn size(&self) -> usize {
        let mut size = PAGE_HEADER_SIZE + self.keys.len() * SLOT_SIZE;
        for (i, key) in self.keys.iter().enumerate() {
            size += key.len();
            if self.is_leaf {
                size += self.values[i].len();
            }
        }
        size
    }

    /// Split trigger: too many keys AND too large for a single page.
    pub fn overfill(&self) -> bool {
        self.keys.len() > MAX_KEYS && self.size() > PAGE_SIZE
    }

    /// Merge trigger: too few keys OR well under a quarter page.
    pub fn underfill(&self) -> bool {
        self.keys.len() < MIN_KEYS || self.size() < UNDERFILL_THRESHOLD
    }

    /// Replaces every record slice with an owned copy, detaching the node
    /// from the mmap epoch it was decoded from. Called by the writable
    /// transaction before the map is replaced, and by readers at decode
    /// time.
    pub fn dereference(&mut self) {
        for key in &mut self.keys {
            *key = Bytes::copy_from_slice(key);
        }
        for value in &mut self.values {
            *value = Bytes::copy_from_slice(value);
        }
        if let Some(sep) = &mut self.separator {
            *sep = Bytes::copy_from_slice(sep);
        }
    }
}

/// Transaction-owned node storage. Ids are indices into a dense vector;
/// they are never reused within a transaction, and freed nodes simply stay
/// behind with their `freed` flag set.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut()
    }

    /// Splits a node until no piece overfills, returning every resulting
    /// sibling (the node itself first, then new right siblings in key
    /// order). Splitting a root manufactures its new parent; the caller
    /// wires the parent into the tree when it spills.
    pub fn split(&mut self, id: NodeId) -> Result<SmallVec<[NodeId; 4]>> {
        let mut siblings: SmallVec<[NodeId; 4]> = smallvec![id];
        let mut current = id;

        while let Some(next) = self.split_two(current)? {
            siblings.push(next);
            current = next;
        }

        Ok(siblings)
    }

    /// One split step: carves a right sibling off an overfilled node, or
    /// returns `None` when the node fits as-is.
    fn split_two(&mut self, id: NodeId) -> Result<Option<NodeId>> {
        if !self.node(id).overfill() {
            return Ok(None);
        }

        let split_index = {
            let node = self.node(id);
            let mut acc = PAGE_HEADER_SIZE;
            // Leave at least one record for the right sibling even when a
            // single oversized record dominates the accumulated size.
            let mut split_index = node.keys.len() - 1;

            for i in 0..node.keys.len() {
                if i >= MIN_KEYS && acc >= SPLIT_THRESHOLD {
                    split_index = i;
                    break;
                }
                acc += SLOT_SIZE + node.keys[i].len();
                if node.is_leaf {
                    acc += node.values[i].len();
                }
            }
            split_index
        };

        if self.node(id).parent.is_none() {
            let node = self.node(id);
            let seed_key = node
                .separator
                .clone()
                .or_else(|| node.keys.first().cloned())
                .ok_or_else(|| StoreError::invariant("splitting an empty root"))?;
            let seed_child = node.page_id;

            let mut parent = Node::internal();
            parent.keys.push(seed_key);
            parent.child_ids.push(seed_child);

            let parent_id = self.alloc(parent);
            self.node_mut(id).parent = Some(parent_id);
        }

        let right = {
            let node = self.node_mut(id);
            let keys = node.keys.split_off(split_index);
            let values = if node.is_leaf {
                node.values.split_off(split_index)
            } else {
                Vec::new()
            };
            let child_ids = if node.is_leaf {
                Vec::new()
            } else {
                node.child_ids.split_off(split_index)
            };

            Node {
                page_id: 0,
                is_leaf: node.is_leaf,
                parent: node.parent,
                keys,
                values,
                child_ids,
                ..Node::default()
            }
        };

        Ok(Some(self.alloc(right)))
    }
}
