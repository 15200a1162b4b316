//! # Database Handle
//!
//! `Db` is the process-wide handle to one store file: it owns the file and
//! its memory map, the committed meta, the freelist, the writer gate, and
//! the TxId counter. Transactions borrow the handle, so the borrow checker
//! enforces "close fails while a transaction is live" at compile time;
//! dropping the `Db` unmaps and closes the file.
//!
//! ## Opening
//!
//! `open` creates a three-page skeleton when the file does not exist:
//!
//! ```text
//! page 0: meta      magic, total_pages=3, freelist=1, root=2
//! page 1: freelist  count=0
//! page 2: leaf      count=0 (the initial tree root)
//! ```
//!
//! then maps the file and loads the freelist from the meta's pointer. A
//! meta page without the magic constant fails the open without touching
//! the file.
//!
//! ## Concurrency
//!
//! One writable transaction at a time, enforced by an atomic gate;
//! `begin_write` fails fast with `WritableConflict` rather than blocking.
//! Readers are unbounded: each copies the committed meta at begin and
//! resolves pages against the shared map. The writer publishes its meta
//! under the meta mutex at commit; readers that begin afterwards observe
//! the new state atomically.
//!
//! ## Allocation
//!
//! Three tiers, in order: reuse a contiguous run from the freelist; claim
//! file headroom by bumping the transaction's `total_pages`; grow the map
//! along the ladder when the headroom outruns it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use eyre::{Result, WrapErr};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::config::PAGE_SIZE;
use crate::error::StoreError;
use crate::storage::{Freelist, Meta, MmapStorage, PageBuf, PageId, PageKind, PageRef, TxId};
use crate::tx::{ReadTx, WriteTx};

pub struct Db {
    path: PathBuf,
    storage: RwLock<MmapStorage>,
    /// Most recently committed meta; swapped by the writer at commit.
    meta: Mutex<Meta>,
    /// Owned by the live writable transaction while one exists.
    freelist: Mutex<Freelist>,
    writer_active: AtomicBool,
    last_tx_id: AtomicU32,
}

impl Db {
    /// Opens a store file, creating it with the skeleton layout when
    /// missing. Validates the meta magic and loads the freelist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            create_skeleton(&path)
                .wrap_err_with(|| format!("failed to create store at '{}'", path.display()))?;
        }

        let storage = MmapStorage::open(&path)?;

        let meta_page = PageRef::new(storage.page(0)?)
            .wrap_err_with(|| format!("failed to read meta page of '{}'", path.display()))?;
        let meta = Meta::read(&meta_page)
            .wrap_err_with(|| format!("failed to validate '{}'", path.display()))?;

        let mut freelist = Freelist::new();
        let freelist_page = PageRef::new(storage.page(meta.freelist_page)?)
            .wrap_err_with(|| format!("failed to read freelist page {}", meta.freelist_page))?;
        freelist.read_page(&freelist_page)?;

        Ok(Self {
            path,
            storage: RwLock::new(storage),
            meta: Mutex::new(meta),
            freelist: Mutex::new(freelist),
            writer_active: AtomicBool::new(false),
            last_tx_id: AtomicU32::new(0),
        })
    }

    /// Starts the writable transaction. Fails with
    /// [`StoreError::WritableConflict`] while another one is live.
    pub fn begin_write(&self) -> Result<WriteTx<'_>> {
        if self
            .writer_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StoreError::WritableConflict.into());
        }

        match WriteTx::new(self) {
            Ok(tx) => Ok(tx),
            Err(e) => {
                self.finish_write();
                Err(e)
            }
        }
    }

    /// Starts a read-only transaction pinned to the current committed
    /// meta.
    pub fn begin_read(&self) -> Result<ReadTx<'_>> {
        ReadTx::new(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current committed meta.
    pub fn meta(&self) -> Meta {
        *self.meta.lock()
    }

    /// Snapshot of the pages currently available for reuse.
    pub fn free_pages(&self) -> Vec<PageId> {
        self.freelist.lock().slots().to_vec()
    }

    pub(crate) fn page(&self, id: PageId) -> Result<PageRef> {
        PageRef::new(self.storage.read().page(id)?)
    }

    pub(crate) fn storage(&self) -> RwLockReadGuard<'_, MmapStorage> {
        self.storage.read()
    }

    pub(crate) fn freelist(&self) -> parking_lot::MutexGuard<'_, Freelist> {
        self.freelist.lock()
    }

    pub(crate) fn mapped_len(&self) -> usize {
        self.storage.read().mapped_len()
    }

    pub(crate) fn remap(&self, min_len: usize) -> Result<()> {
        self.storage.write().remap(min_len)
    }

    pub(crate) fn publish_meta(&self, meta: Meta) {
        *self.meta.lock() = meta;
    }

    pub(crate) fn next_tx_id(&self) -> TxId {
        self.last_tx_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn finish_write(&self) {
        self.writer_active.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let meta = self.meta();
        f.debug_struct("Db")
            .field("path", &self.path)
            .field("total_pages", &meta.total_pages)
            .field("root_page", &meta.root_page)
            .field("freelist_page", &meta.freelist_page)
            .finish()
    }
}

/// Writes the initial three-page file: meta, empty freelist, empty leaf
/// root. Synced before open proceeds so a crash mid-create cannot leave a
/// torn skeleton behind a successful open.
fn create_skeleton(path: &Path) -> Result<()> {
    use std::io::Write;

    let mut data = Vec::with_capacity(3 * PAGE_SIZE);

    let mut meta_page = PageBuf::new(0, 1)?;
    Meta {
        total_pages: 3,
        freelist_page: 1,
        root_page: 2,
    }
    .write(&mut meta_page)?;
    data.extend_from_slice(meta_page.bytes());

    let mut freelist_page = PageBuf::new(1, 1)?;
    Freelist::new().write_page(&mut freelist_page)?;
    data.extend_from_slice(freelist_page.bytes());

    let mut root_page = PageBuf::new(2, 1)?;
    root_page.set_kind(PageKind::Leaf);
    data.extend_from_slice(root_page.bytes());

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .wrap_err("failed to create store file")?;
    file.write_all(&data).wrap_err("failed to write skeleton")?;
    file.sync_all().wrap_err("failed to sync skeleton")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn fresh_open_creates_three_page_skeleton() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.db");

        let db = Db::open(&path).unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, 3 * PAGE_SIZE as u64);

        let meta = db.meta();
        assert_eq!(meta.total_pages, 3);
        assert_eq!(meta.freelist_page, 1);
        assert_eq!(meta.root_page, 2);

        assert_eq!(db.page(1).unwrap().kind(), PageKind::Freelist);
        assert_eq!(db.page(1).unwrap().count(), 0);
        assert_eq!(db.page(2).unwrap().kind(), PageKind::Leaf);
        assert_eq!(db.page(2).unwrap().count(), 0);
        assert!(db.free_pages().is_empty());
    }

    #[test]
    fn reopen_preserves_committed_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.db");

        {
            let db = Db::open(&path).unwrap();
            let mut tx = db.begin_write().unwrap();
            tx.set(b"stable", b"value").unwrap();
            tx.commit().unwrap();
        }

        let db = Db::open(&path).unwrap();
        let mut reader = db.begin_read().unwrap();
        assert_eq!(reader.get(b"stable").unwrap().as_deref(), Some(b"value".as_ref()));
    }

    #[test]
    fn reopen_reloads_freelist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("freelist.db");

        {
            let db = Db::open(&path).unwrap();
            let mut tx = db.begin_write().unwrap();
            for i in 0..300u32 {
                tx.set(format!("key{:04}", i).as_bytes(), b"freelist fodder")
                    .unwrap();
            }
            tx.commit().unwrap();

            // Shrink the tree so the next commit starts with far more free
            // pages than it consumes.
            let mut tx = db.begin_write().unwrap();
            for i in 0..300u32 {
                tx.remove(format!("key{:04}", i).as_bytes()).unwrap();
            }
            tx.commit().unwrap();

            let mut tx = db.begin_write().unwrap();
            tx.set(b"tail", b"write").unwrap();
            tx.commit().unwrap();
        }

        // The last commit serialized a non-empty free set; the reopened
        // handle must come back with it.
        let db = Db::open(&path).unwrap();
        assert!(!db.free_pages().is_empty());

        let mut tx = db.begin_write().unwrap();
        tx.set(b"after", b"reopen").unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn second_writer_conflicts() {
        let (_dir, db) = open_db();

        let tx = db.begin_write().unwrap();
        let err = db.begin_write().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::WritableConflict)
        ));

        tx.rollback();
        let tx = db.begin_write().unwrap();
        tx.rollback();
    }

    #[test]
    fn readers_coexist_with_writer() {
        let (_dir, db) = open_db();

        let _writer = db.begin_write().unwrap();
        let mut r1 = db.begin_read().unwrap();
        let mut r2 = db.begin_read().unwrap();

        assert_eq!(r1.get(b"x").unwrap(), None);
        assert_eq!(r2.get(b"x").unwrap(), None);
    }

    #[test]
    fn tx_ids_increase_monotonically() {
        let (_dir, db) = open_db();

        let a = db.begin_read().unwrap().id();
        let b = db.begin_read().unwrap().id();
        let c = {
            let tx = db.begin_write().unwrap();
            let id = tx.id();
            tx.rollback();
            id
        };

        assert!(a < b && b < c);
    }

    #[test]
    fn corrupted_magic_fails_open_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.db");

        Db::open(&path).unwrap();

        let mut contents = std::fs::read(&path).unwrap();
        contents[crate::config::PAGE_HEADER_SIZE] ^= 0xFF;
        std::fs::write(&path, &contents).unwrap();

        let err = Db::open(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::MagicMismatch { .. })
        ));

        assert_eq!(std::fs::read(&path).unwrap(), contents);
    }

    #[test]
    fn open_rejects_directory_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Db::open(dir.path()).is_err());
    }
}
