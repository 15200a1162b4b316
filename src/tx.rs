//! # Transactions
//!
//! All reads and writes funnel through a transaction. A transaction owns a
//! private copy of the meta, an arena of decoded nodes with a PageId cache,
//! and (for writers) a dirty-page table. Nothing touches the committed
//! state until `commit` publishes the new meta.
//!
//! ## Read Path
//!
//! `get` descends from the transaction's root, decoding pages into nodes
//! lazily. At each internal node the child is the one owning the last
//! separator less than or equal to the key. Read-only transactions copy
//! records out of each page they decode, so pages recycled by later
//! commits cannot change what the reader already observed.
//!
//! ## Write Path
//!
//! `set` and `remove` mutate a single leaf and mark it unbalanced. The
//! tree is NOT rebalanced inline; all structural work happens at commit:
//!
//! ```text
//! commit:
//!   1. merge pass    -- bottom-up, concatenates underfilled nodes into
//!                       siblings, collapses shrinking roots
//!   2. spill pass    -- top-down over touched nodes: split overfilled
//!                       nodes, write every result to a freshly allocated
//!                       page, free the superseded page, refresh the
//!                       parent entry
//!   3. freelist page -- free the old one, write the new one
//!   4. write         -- dirty pages ascending by id, fsync, meta page
//!                       last, fsync again
//!   5. publish       -- install the new meta, release this tx's freed
//!                       pages, clear the writer gate
//! ```
//!
//! Any error inside commit rolls the transaction back: pending frees are
//! discarded and the dirty table dropped. Because no committed page was
//! overwritten (copy-on-write) and the meta was never rewritten, the store
//! is untouched.
//!
//! ## Rollback
//!
//! Explicit `rollback` and dropping an uncommitted `WriteTx` are
//! equivalent; both discard all transaction state and release the writer
//! gate.

use bytes::Bytes;
use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::config::{MAX_KEY_SIZE, MAX_VALUE_SIZE, PAGE_SIZE};
use crate::db::Db;
use crate::error::StoreError;
use crate::storage::{Meta, PageBuf, PageId, PageRef, TxId};
use crate::tree::{Node, NodeArena, NodeId, SearchResult};

/// Read-only transaction. Any number may coexist with one writer; each
/// observes the meta committed before it began.
pub struct ReadTx<'db> {
    core: TxCore<'db>,
}

impl<'db> ReadTx<'db> {
    pub(crate) fn new(db: &'db Db) -> Result<Self> {
        Ok(Self {
            core: TxCore::new(db, false)?,
        })
    }

    pub fn id(&self) -> TxId {
        self.core.id
    }

    /// Looks up a key. The returned bytes stay readable for as long as the
    /// caller holds them.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        self.core.get(key)
    }
}

/// Writable transaction. At most one exists per database at a time.
pub struct WriteTx<'db> {
    core: TxCore<'db>,
    finished: bool,
}

impl std::fmt::Debug for WriteTx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTx")
            .field("id", &self.core.id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<'db> WriteTx<'db> {
    pub(crate) fn new(db: &'db Db) -> Result<Self> {
        Ok(Self {
            core: TxCore::new(db, true)?,
            finished: false,
        })
    }

    pub fn id(&self) -> TxId {
        self.core.id
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        self.core.get(key)
    }

    /// Inserts or overwrites a key, returning the previous value on
    /// overwrite.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Bytes>> {
        self.core.set(key, value)
    }

    /// Removes a key, returning its value when it was present.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        self.core.remove(key)
    }

    /// Rebalances, writes, and atomically publishes every change in this
    /// transaction. On error the transaction is rolled back and the store
    /// is left exactly as before it began.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;

        let result = self.core.commit();
        if result.is_err() {
            self.core.rollback();
        }
        self.core.db.finish_write();
        result
    }

    /// Discards every change in this transaction.
    pub fn rollback(mut self) {
        self.finished = true;
        self.core.rollback();
        self.core.db.finish_write();
    }
}

impl Drop for WriteTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.core.rollback();
            self.core.db.finish_write();
        }
    }
}

/// State shared by both transaction kinds. `dirty` stays empty for
/// readers.
struct TxCore<'db> {
    db: &'db Db,
    id: TxId,
    writable: bool,
    meta: Meta,
    arena: NodeArena,
    /// PageId of a decoded node -> its arena id. Re-keyed when spill moves
    /// a node to a fresh page.
    cache: HashMap<PageId, NodeId>,
    /// Pages created or rewritten by this transaction, keyed by PageId.
    dirty: HashMap<PageId, PageBuf>,
    root: NodeId,
}

impl<'db> TxCore<'db> {
    fn new(db: &'db Db, writable: bool) -> Result<Self> {
        let id = db.next_tx_id();
        let meta = db.meta();

        let mut core = Self {
            db,
            id,
            writable,
            meta,
            arena: NodeArena::new(),
            cache: HashMap::new(),
            dirty: HashMap::new(),
            root: 0,
        };

        core.root = core
            .get_node(meta.root_page, None)
            .wrap_err("failed to load tree root")?;
        Ok(core)
    }

    /// Returns the page view for `id`, preferring this transaction's dirty
    /// table over the mapped file.
    fn get_page(&self, id: PageId) -> Result<PageRef> {
        ensure!(
            id < self.meta.total_pages,
            "page {} beyond total_pages {}",
            id,
            self.meta.total_pages
        );

        match self.dirty.get(&id) {
            Some(buf) => buf.as_page_ref(),
            None => self.db.page(id),
        }
    }

    /// Returns the cached node for a page, decoding it on first access.
    fn get_node(&mut self, id: PageId, parent: Option<NodeId>) -> Result<NodeId> {
        if let Some(&node) = self.cache.get(&id) {
            return Ok(node);
        }

        let page = self.get_page(id)?;
        let mut node = Node::from_page(&page, parent)?;
        if !self.writable {
            // Readers own their records outright, so pages recycled by
            // later commits cannot mutate what this transaction sees.
            node.dereference();
        }

        let node_id = self.arena.alloc(node);
        self.cache.insert(id, node_id);
        Ok(node_id)
    }

    fn get_child_at(&mut self, parent: NodeId, i: usize) -> Result<NodeId> {
        let child_page = {
            let node = self.arena.node(parent);
            ensure!(
                !node.is_leaf && i < node.child_ids.len(),
                "child index {} out of bounds {} on page {}",
                i,
                node.child_ids.len(),
                node.page_id
            );
            node.child_ids[i]
        };
        self.get_node(child_page, Some(parent))
    }

    /// Descends from the root to the leaf that owns `key`.
    fn descend(&mut self, key: &[u8]) -> Result<NodeId> {
        let mut current = self.root;
        loop {
            if self.arena.node(current).is_leaf {
                return Ok(current);
            }
            let child = self.arena.node(current).child_index(key);
            current = self.get_child_at(current, child)?;
        }
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        let leaf = self.descend(key)?;
        let node = self.arena.node(leaf);

        match node.search(key) {
            SearchResult::Found(i) => Ok(Some(node.values[i].clone())),
            SearchResult::NotFound(_) => Ok(None),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Bytes>> {
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Err(StoreError::KeyTooLarge {
                len: key.len(),
                max: MAX_KEY_SIZE,
            }
            .into());
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(StoreError::ValueTooLarge {
                len: value.len(),
                max: MAX_VALUE_SIZE,
            }
            .into());
        }

        let leaf = self.descend(key)?;
        let node = self.arena.node_mut(leaf);

        match node.search(key) {
            SearchResult::Found(i) => {
                let previous = std::mem::replace(
                    &mut node.values[i],
                    Bytes::copy_from_slice(value),
                );
                Ok(Some(previous))
            }
            SearchResult::NotFound(i) => {
                node.balanced = false;
                node.insert_key_value_at(
                    i,
                    Bytes::copy_from_slice(key),
                    Bytes::copy_from_slice(value),
                )?;
                Ok(None)
            }
        }
    }

    fn remove(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        let leaf = self.descend(key)?;
        let node = self.arena.node_mut(leaf);

        match node.search(key) {
            SearchResult::Found(i) => {
                node.balanced = false;
                let (_, value) = node.remove_key_value_at(i)?;
                Ok(Some(value))
            }
            SearchResult::NotFound(_) => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Commit pipeline
    // ------------------------------------------------------------------

    fn commit(&mut self) -> Result<()> {
        self.merge_pass().wrap_err("merge pass failed")?;
        self.normalize_root().wrap_err("root normalization failed")?;

        self.spill(self.root).wrap_err("spill pass failed")?;
        self.finish_spill()?;

        self.rewrite_freelist().wrap_err("freelist rewrite failed")?;
        self.write_pages().wrap_err("page write failed")?;

        self.db.publish_meta(self.meta);
        self.db.freelist().release(self.id);
        Ok(())
    }

    fn rollback(&mut self) {
        if self.writable {
            self.db.freelist().rollback(self.id);
        }
        self.dirty.clear();
    }

    /// Visits every cached node bottom-up until none remains unbalanced.
    /// Merging can decode siblings and re-arm parents, so the pass repeats
    /// until it finds nothing left to do.
    fn merge_pass(&mut self) -> Result<()> {
        loop {
            let pending: Vec<NodeId> = self
                .cache
                .values()
                .copied()
                .filter(|&n| {
                    let node = self.arena.node(n);
                    !node.balanced && !node.freed
                })
                .collect();

            if pending.is_empty() {
                return Ok(());
            }
            for node in pending {
                self.merge(node)?;
            }
        }
    }

    /// Merges one underfilled node into a sibling, recursing into the
    /// parent when it loses an entry.
    fn merge(&mut self, id: NodeId) -> Result<()> {
        {
            let node = self.arena.node(id);
            if node.freed || node.balanced {
                return Ok(());
            }
        }
        self.arena.node_mut(id).balanced = true;

        if !self.arena.node(id).underfill() {
            return Ok(());
        }

        let Some(parent) = self.arena.node(id).parent else {
            // A shrinking internal root with a single child absorbs it,
            // reducing the tree height by one.
            let node = self.arena.node(id);
            if !node.is_leaf && node.keys.len() == 1 {
                self.collapse_root(id)?;
            }
            return Ok(());
        };

        // A node emptied by removals is unlinked and freed outright.
        if self.arena.node(id).keys.is_empty() {
            let i = self.parent_entry_index(id, parent)?;
            self.arena.node_mut(parent).remove_key_child_at(i)?;
            self.free_node(id)?;
            self.arena.node_mut(parent).balanced = false;
            return self.merge(parent);
        }

        if self.arena.node(parent).keys.len() < 2 {
            // No sibling to merge with. Only the root may legally shrink
            // to a single child; normalize_root collapses that shape.
            ensure!(
                self.arena.node(parent).parent.is_none(),
                "non-root parent holds a single child"
            );
            return Ok(());
        }

        // Concatenate into the left sibling; the leftmost node instead
        // absorbs its right neighbor.
        let (from, to, from_index) = {
            let page_id = self.arena.node(id).page_id;
            if self.arena.node(parent).child_ids[0] == page_id {
                (self.get_child_at(parent, 1)?, id, 1)
            } else {
                let i = self.parent_entry_index(id, parent)?;
                (id, self.get_child_at(parent, i - 1)?, i)
            }
        };

        ensure!(
            self.arena.node(from).is_leaf == self.arena.node(to).is_leaf,
            "sibling nodes on one level must share a kind"
        );

        for child_page in self.arena.node(from).child_ids.clone() {
            if let Some(&grandchild) = self.cache.get(&child_page) {
                self.arena.node_mut(grandchild).parent = Some(to);
            }
        }

        let (keys, values, children) = {
            let source = self.arena.node_mut(from);
            (
                std::mem::take(&mut source.keys),
                std::mem::take(&mut source.values),
                std::mem::take(&mut source.child_ids),
            )
        };
        {
            let target = self.arena.node_mut(to);
            target.keys.extend(keys);
            target.values.extend(values);
            target.child_ids.extend(children);
        }

        self.arena.node_mut(parent).remove_key_child_at(from_index)?;
        self.free_node(from)?;
        self.arena.node_mut(parent).balanced = false;
        self.merge(parent)
    }

    /// Locates a node's entry in its parent via the separator memo.
    fn parent_entry_index(&self, id: NodeId, parent: NodeId) -> Result<usize> {
        let separator = self
            .arena
            .node(id)
            .separator
            .clone()
            .ok_or_else(|| StoreError::invariant("parented node without a separator"))?;

        match self.arena.node(parent).search(&separator) {
            SearchResult::Found(i) => Ok(i),
            SearchResult::NotFound(_) => Err(StoreError::invariant(
                "child separator missing from its parent",
            )),
        }
    }

    /// Pulls a lone child's contents up into the root.
    fn collapse_root(&mut self, root: NodeId) -> Result<()> {
        let child = self.get_child_at(root, 0)?;

        let (is_leaf, keys, values, children) = {
            let node = self.arena.node_mut(child);
            (
                node.is_leaf,
                std::mem::take(&mut node.keys),
                std::mem::take(&mut node.values),
                std::mem::take(&mut node.child_ids),
            )
        };

        {
            let node = self.arena.node_mut(root);
            node.is_leaf = is_leaf;
            node.keys = keys;
            node.values = values;
            node.child_ids = children;
        }

        for child_page in self.arena.node(root).child_ids.clone() {
            if let Some(&grandchild) = self.cache.get(&child_page) {
                self.arena.node_mut(grandchild).parent = Some(root);
            }
        }

        self.free_node(child)
    }

    /// Final height adjustments the bottom-up pass cannot always reach: a
    /// root left with a single child (or none at all) after heavy
    /// deletion.
    fn normalize_root(&mut self) -> Result<()> {
        loop {
            let node = self.arena.node(self.root);
            if !node.is_leaf && node.keys.len() == 1 && node.underfill() {
                self.collapse_root(self.root)?;
                continue;
            }
            if !node.is_leaf && node.keys.is_empty() {
                let node = self.arena.node_mut(self.root);
                node.is_leaf = true;
                node.values.clear();
                node.child_ids.clear();
            }
            return Ok(());
        }
    }

    /// Detaches a node from the tree and hands its page span to the
    /// freelist.
    fn free_node(&mut self, id: NodeId) -> Result<()> {
        let page_id = self.arena.node(id).page_id;
        self.arena.node_mut(id).freed = true;

        if page_id != 0 {
            let page = self.get_page(page_id)?;
            self.cache.remove(&page_id);
            self.dirty.remove(&page_id);
            self.db.freelist().free(self.id, &page)?;
        }
        Ok(())
    }

    /// Writes a subtree out: children first, then split this node and
    /// serialize every resulting sibling onto a fresh page, freeing the
    /// superseded one and refreshing the parent's entry.
    fn spill(&mut self, id: NodeId) -> Result<()> {
        if self.arena.node(id).spilled {
            return Ok(());
        }

        if !self.arena.node(id).is_leaf {
            for child_page in self.arena.node(id).child_ids.clone() {
                if let Some(&child) = self.cache.get(&child_page) {
                    self.spill(child)?;
                }
            }
        }

        let siblings = self.arena.split(id)?;
        for sibling in siblings {
            self.spill_one(sibling)?;
        }

        // A root split manufactured a parent above this level; it has no
        // page yet and still needs writing out.
        if let Some(parent) = self.arena.node(id).parent {
            let node = self.arena.node(parent);
            if node.page_id == 0 && !node.spilled {
                return self.spill(parent);
            }
        }
        Ok(())
    }

    fn spill_one(&mut self, id: NodeId) -> Result<()> {
        let old_page = self.arena.node(id).page_id;
        if old_page != 0 {
            let page = self.get_page(old_page)?;
            self.db.freelist().free(self.id, &page)?;
            self.cache.remove(&old_page);
            self.arena.node_mut(id).page_id = 0;
        }

        let size = self.arena.node(id).size();
        let new_page = self.allocate(size.div_ceil(PAGE_SIZE) as u32)?;
        self.arena.node_mut(id).page_id = new_page;

        {
            let buf = self
                .dirty
                .get_mut(&new_page)
                .ok_or_else(|| StoreError::invariant("allocated page missing from dirty table"))?;
            self.arena.node(id).write(buf)?;
        }
        self.arena.node_mut(id).spilled = true;
        self.cache.insert(new_page, id);

        let first_key = self.arena.node(id).keys.first().cloned();
        match self.arena.node(id).parent {
            Some(parent) => {
                let old_separator = self
                    .arena
                    .node(id)
                    .separator
                    .clone()
                    .or_else(|| first_key.clone())
                    .ok_or_else(|| StoreError::invariant("spilling a parented node with no keys"))?;
                let new_separator = first_key
                    .ok_or_else(|| StoreError::invariant("spilling a parented node with no keys"))?;

                // Refresh the existing entry (this sibling was already
                // indexed) or insert a new one (fresh right siblings).
                match self.arena.node(parent).search(&old_separator) {
                    SearchResult::Found(i) => {
                        let node = self.arena.node_mut(parent);
                        node.keys[i] = new_separator.clone();
                        node.child_ids[i] = new_page;
                    }
                    SearchResult::NotFound(i) => {
                        self.arena
                            .node_mut(parent)
                            .insert_key_child_at(i, new_separator.clone(), new_page)?;
                    }
                }
                self.arena.node_mut(id).separator = Some(new_separator);
            }
            None => {
                self.arena.node_mut(id).separator = first_key;
            }
        }
        Ok(())
    }

    /// Resolves the post-spill root (splits may have stacked new parents)
    /// and records it in the transaction's meta.
    fn finish_spill(&mut self) -> Result<()> {
        let mut top = self.root;
        while let Some(parent) = self.arena.node(top).parent {
            top = parent;
        }
        self.root = top;

        let root = self.arena.node(top);
        ensure!(root.spilled, "root not spilled after commit spill pass");
        ensure!(root.page_id != 0, "spilled root has no page");
        self.meta.root_page = root.page_id;
        Ok(())
    }

    /// Frees the previous freelist page and serializes the current free
    /// set onto a fresh one.
    fn rewrite_freelist(&mut self) -> Result<()> {
        let old_page = self.get_page(self.meta.freelist_page)?;
        self.db.freelist().free(self.id, &old_page)?;

        let pages = {
            let freelist = self.db.freelist();
            freelist.size().div_ceil(PAGE_SIZE).max(1) as u32
        };
        let new_page = self.allocate(pages)?;

        let buf = self
            .dirty
            .get_mut(&new_page)
            .ok_or_else(|| StoreError::invariant("allocated page missing from dirty table"))?;
        self.db.freelist().write_page(buf)?;

        self.meta.freelist_page = new_page;
        Ok(())
    }

    /// Durably writes the transaction: dirty pages ascending, fsync, then
    /// the meta page, then fsync again. The meta-last discipline is what
    /// makes an interrupted commit invisible.
    fn write_pages(&mut self) -> Result<()> {
        let mut order: SmallVec<[PageId; 16]> = self.dirty.keys().copied().collect();
        order.sort_unstable();

        let storage = self.db.storage();
        for page_id in &order {
            let buf = &self.dirty[page_id];
            storage.write_page(*page_id, buf.bytes())?;
        }
        storage.sync()?;

        let mut meta_buf = PageBuf::new(0, 1)?;
        self.meta.write(&mut meta_buf)?;
        storage.write_page(0, meta_buf.bytes())?;
        storage.sync()?;
        Ok(())
    }

    /// Allocates `pages` contiguous pages: freelist first, then file
    /// headroom, remapping (after detaching every cached record) when the
    /// headroom outgrows the map. The span is registered in the dirty
    /// table immediately.
    fn allocate(&mut self, pages: u32) -> Result<PageId> {
        ensure!(self.writable, "allocation inside a read-only transaction");
        ensure!(pages >= 1, "allocating an empty page span");

        if let Some(start) = self.db.freelist().allocate(pages) {
            self.dirty.insert(start, PageBuf::new(start, pages)?);
            return Ok(start);
        }

        let start = self.meta.total_pages;
        let total = start
            .checked_add(pages)
            .ok_or_else(|| StoreError::invariant("page id space exhausted"))?;
        self.meta.total_pages = total;

        let needed = total as usize * PAGE_SIZE;
        if needed > self.db.mapped_len() {
            for node in self.arena.iter_mut() {
                node.dereference();
            }
            self.db
                .remap(needed)
                .wrap_err("failed to grow memory map for allocation")?;
        }

        self.dirty.insert(start, PageBuf::new(start, pages)?);
        Ok(start)
    }
}
