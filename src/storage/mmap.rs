//! # Memory-Mapped File Storage
//!
//! `MmapStorage` owns the store file and its read-only memory map. All page
//! reads are zero-copy slices of the map; all writes go through the file
//! descriptor (`write_at`) and are made durable with `sync_data`. The map
//! is never written through.
//!
//! ## Epochs
//!
//! The entire mapping is wrapped once in a refcounted [`Bytes`] via
//! `Bytes::from_owner`; every page slice handed out is a sub-slice of that
//! epoch. Remapping installs a new epoch, while outstanding slices keep the
//! old mapping alive until they are dropped. This means a remap can never
//! invalidate a slice a reader still holds -- the classic dangling-mmap
//! hazard is unrepresentable. The writable transaction still detaches its
//! cached records before a remap so the old epoch is released promptly.
//!
//! ## Headroom
//!
//! The mapping is usually longer than the file. Sizes follow a ladder:
//! 128 KiB initially, doubling up to 1 GiB, then 1 GiB steps up to a hard
//! 16 GiB ceiling. Pages between the file's end and the map's end are
//! headroom: they may be allocated and written by a commit (extending the
//! file) but are never read before that commit completes, so no access
//! ever touches unmapped file space.
//!
//! ## Error Handling
//!
//! All fallible operations return `eyre::Result` with the file path, page
//! number, or requested size attached as context.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use bytes::Bytes;
use eyre::{ensure, Result, WrapErr};
use memmap2::MmapOptions;

use crate::config::{INIT_MMAP_SIZE, MAX_MMAP_SIZE, MMAP_STEP};
use crate::error::StoreError;

use super::{PageHeader, PageId, PAGE_SIZE};

#[derive(Debug)]
pub struct MmapStorage {
    file: File,
    epoch: Bytes,
    mapped_len: usize,
}

impl MmapStorage {
    /// Opens an existing store file and maps it at the ladder-rounded size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        let metadata = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?;

        let file_size = metadata.len();

        ensure!(
            file_size > 0,
            "cannot open empty store file '{}'",
            path.display()
        );

        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "store file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        let mapped_len = round_mmap_size(file_size.max(INIT_MMAP_SIZE as u64) as usize)?;
        let epoch = map_epoch(&file, mapped_len)
            .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?;

        Ok(Self {
            file,
            epoch,
            mapped_len,
        })
    }

    /// Returns the full physical span of the logical page starting at
    /// `page_no` as a zero-copy slice of the current epoch.
    pub fn page(&self, page_no: PageId) -> Result<Bytes> {
        let offset = page_no as usize * PAGE_SIZE;
        ensure!(
            offset + PAGE_SIZE <= self.mapped_len,
            "page {} beyond mapped length {}",
            page_no,
            self.mapped_len
        );

        let header = PageHeader::from_bytes(&self.epoch[offset..offset + PAGE_SIZE])?;
        let span = header.span() as usize * PAGE_SIZE;
        ensure!(
            offset + span <= self.mapped_len,
            "page {} with overflow {} beyond mapped length {}",
            page_no,
            header.overflow(),
            self.mapped_len
        );

        Ok(self.epoch.slice(offset..offset + span))
    }

    /// Writes a page span through the file descriptor at its fixed offset.
    /// The file grows automatically when the offset is past its end.
    pub fn write_page(&self, page_no: PageId, data: &[u8]) -> Result<()> {
        ensure!(
            !data.is_empty() && data.len() % PAGE_SIZE == 0,
            "page write of {} bytes is not a positive multiple of {}",
            data.len(),
            PAGE_SIZE
        );

        let offset = page_no as u64 * PAGE_SIZE as u64;
        self.file
            .write_all_at(data, offset)
            .wrap_err_with(|| format!("failed to write page {} at offset {}", page_no, offset))
    }

    /// Flushes file data to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data().wrap_err("failed to fsync store file")
    }

    /// Grows the mapping so at least `min_len` bytes are addressable.
    /// Installs a fresh epoch; outstanding slices keep the old one alive.
    pub fn remap(&mut self, min_len: usize) -> Result<()> {
        if min_len <= self.mapped_len {
            return Ok(());
        }

        let mapped_len = round_mmap_size(min_len)?;
        self.epoch = map_epoch(&self.file, mapped_len)
            .wrap_err_with(|| format!("failed to remap store file to {} bytes", mapped_len))?;
        self.mapped_len = mapped_len;
        Ok(())
    }

    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata().wrap_err("failed to stat store file")?.len())
    }
}

fn map_epoch(file: &File, len: usize) -> Result<Bytes> {
    // SAFETY: mapping the file is unsafe because external writers could
    // mutate it underneath us. This is sound here because:
    // 1. The mapping is PROT_READ; this process never writes through it.
    // 2. Store files are exclusively owned by one Db handle per process.
    // 3. The mapping's lifetime is carried by the refcounted Bytes epoch,
    //    so slices can never outlive the mapping they point into.
    let map = unsafe {
        MmapOptions::new()
            .len(len)
            .map(file)
            .wrap_err("mmap failed")?
    };

    Ok(Bytes::from_owner(map))
}

/// Rounds a requested size up the growth ladder: 128 KiB initially,
/// doubling up to 1 GiB, then 1 GiB steps, capped at 16 GiB.
pub(crate) fn round_mmap_size(size: usize) -> Result<usize> {
    if size > MAX_MMAP_SIZE {
        return Err(StoreError::MmapLimit {
            requested: size,
            max: MAX_MMAP_SIZE,
        }
        .into());
    }

    if size <= INIT_MMAP_SIZE {
        return Ok(INIT_MMAP_SIZE);
    }

    if size < MMAP_STEP {
        return Ok(size.next_power_of_two());
    }

    Ok(size.div_ceil(MMAP_STEP) * MMAP_STEP)
}
