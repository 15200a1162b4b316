//! # Page Format
//!
//! Every page is exactly 4096 bytes and begins with a fixed 16-byte header.
//! A logical page may span several contiguous physical pages; the header's
//! `overflow` field counts the extra pages (0 for a single page).
//!
//! ## Page Header Layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  ----------------------------------------
//! 0       4     overflow   Extra contiguous pages following this one
//! 4       4     count      Records (keys for nodes, ids for freelist)
//! 8       4     index      This page's PageId
//! 12      2     flags      META=1, FREELIST=2, INTERNAL=4, LEAF=8
//! 14      2     reserved   Zero padding
//! ```
//!
//! Exactly one flag bit is set on a valid page.
//!
//! ## Record Layout
//!
//! Node pages store `count` fixed-size slots followed by packed record
//! bytes. Leaf and internal slots share one 16-byte struct:
//!
//! ```text
//! Slot (16 bytes):
//! +-----------+-----------+------------+-----------+
//! | offset    | key_size  | value_size | child_id  |
//! +-----------+-----------+------------+-----------+
//! ```
//!
//! - **offset**: byte offset of the key, measured from the start of the
//!   page's data area (immediately after the header)
//! - **value_size**: value length; zero on internal pages
//! - **child_id**: child PageId; zero on leaf pages
//!
//! On a leaf page the value immediately follows its key:
//!
//! ```text
//! leaf:     header | slot .. slot | key value | key value | ..
//! internal: header | slot .. slot | key | key | ..
//! ```
//!
//! Slots are ordered so decoded keys are ascending. A freelist page's data
//! area is simply `count` little-endian PageIds; the meta page's data area
//! is the [`super::Meta`] payload.
//!
//! ## Views and Buffers
//!
//! [`PageRef`] is the read-only view: it wraps a refcounted [`Bytes`] span
//! (either the mmap epoch or a copied dirty buffer) and hands out zero-copy
//! `Bytes` slices for keys, values, and child ids. Accessors fail when
//! called against an incompatible page kind.
//!
//! [`PageBuf`] is the owned write buffer used for dirty pages: the caller
//! sets the kind and count, then appends records with cumulative offsets
//! starting at the end of the slot table. At commit the buffer is written
//! verbatim at `index * PAGE_SIZE`.

use bytes::Bytes;
use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{PageId, PAGE_HEADER_SIZE, PAGE_SIZE, SLOT_SIZE};

pub const FLAG_META: u16 = 1;
pub const FLAG_FREELIST: u16 = 1 << 1;
pub const FLAG_INTERNAL: u16 = 1 << 2;
pub const FLAG_LEAF: u16 = 1 << 3;

/// The four page kinds, decoded from the header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Meta,
    Freelist,
    Internal,
    Leaf,
}

impl PageKind {
    /// Decodes the flags bitset; exactly one known bit must be set.
    pub fn from_flags(flags: u16) -> Result<Self> {
        match flags {
            FLAG_META => Ok(PageKind::Meta),
            FLAG_FREELIST => Ok(PageKind::Freelist),
            FLAG_INTERNAL => Ok(PageKind::Internal),
            FLAG_LEAF => Ok(PageKind::Leaf),
            other => bail!("invalid page flags {:#06x}: exactly one kind bit must be set", other),
        }
    }

    pub fn flag(self) -> u16 {
        match self {
            PageKind::Meta => FLAG_META,
            PageKind::Freelist => FLAG_FREELIST,
            PageKind::Internal => FLAG_INTERNAL,
            PageKind::Leaf => FLAG_LEAF,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    overflow: U32,
    count: U32,
    index: U32,
    flags: U16,
    reserved: [u8; 2],
}

const _: () = assert!(size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn new(index: PageId, overflow: u32) -> Self {
        Self {
            overflow: U32::new(overflow),
            count: U32::new(0),
            index: U32::new(index),
            flags: U16::new(0),
            reserved: [0; 2],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );

        Self::ref_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );

        Self::mut_from_bytes(&mut data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn overflow(&self) -> u32 {
        self.overflow.get()
    }

    pub fn set_overflow(&mut self, overflow: u32) {
        self.overflow = U32::new(overflow);
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }

    pub fn set_count(&mut self, count: u32) {
        self.count = U32::new(count);
    }

    pub fn index(&self) -> PageId {
        self.index.get()
    }

    pub fn set_index(&mut self, index: PageId) {
        self.index = U32::new(index);
    }

    pub fn flags(&self) -> u16 {
        self.flags.get()
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.flags = U16::new(flags);
    }

    pub fn kind(&self) -> Result<PageKind> {
        PageKind::from_flags(self.flags())
    }

    /// Physical pages occupied by this logical page.
    pub fn span(&self) -> u32 {
        self.overflow() + 1
    }
}

/// One record slot. Leaf records use `value_size` (child_id is zero);
/// internal records use `child_id` (value_size is zero).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Slot {
    offset: U32,
    key_size: U32,
    value_size: U32,
    child_id: U32,
}

const _: () = assert!(size_of::<Slot>() == SLOT_SIZE);

impl Slot {
    pub fn leaf(offset: u32, key_size: u32, value_size: u32) -> Self {
        Self {
            offset: U32::new(offset),
            key_size: U32::new(key_size),
            value_size: U32::new(value_size),
            child_id: U32::new(0),
        }
    }

    pub fn internal(offset: u32, key_size: u32, child_id: PageId) -> Self {
        Self {
            offset: U32::new(offset),
            key_size: U32::new(key_size),
            value_size: U32::new(0),
            child_id: U32::new(child_id),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset.get() as usize
    }

    pub fn key_size(&self) -> usize {
        self.key_size.get() as usize
    }

    pub fn value_size(&self) -> usize {
        self.value_size.get() as usize
    }

    pub fn child_id(&self) -> PageId {
        self.child_id.get()
    }
}

/// Read-only view of one logical page (the header's full `overflow + 1`
/// span). Backed by a refcounted [`Bytes`], so key/value accessors are
/// zero-copy slices that stay valid as long as the caller holds them.
#[derive(Debug, Clone)]
pub struct PageRef {
    data: Bytes,
    header: PageHeader,
    kind: PageKind,
}

impl PageRef {
    pub fn new(data: Bytes) -> Result<Self> {
        ensure!(
            data.len() >= PAGE_SIZE && data.len() % PAGE_SIZE == 0,
            "page span length {} is not a positive multiple of {}",
            data.len(),
            PAGE_SIZE
        );

        let header = *PageHeader::from_bytes(&data)?;
        let kind = header.kind()?;

        ensure!(
            data.len() == header.span() as usize * PAGE_SIZE,
            "page {} span mismatch: {} bytes for overflow {}",
            header.index(),
            data.len(),
            header.overflow()
        );

        Ok(Self { data, header, kind })
    }

    pub fn id(&self) -> PageId {
        self.header.index()
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn count(&self) -> usize {
        self.header.count() as usize
    }

    pub fn overflow(&self) -> u32 {
        self.header.overflow()
    }

    /// The page's data area as a zero-copy slice.
    pub(crate) fn payload(&self) -> Bytes {
        self.data.slice(PAGE_HEADER_SIZE..)
    }

    fn slot(&self, i: usize) -> Result<Slot> {
        ensure!(
            i < self.count(),
            "slot index {} out of bounds (count={}) on page {}",
            i,
            self.count(),
            self.id()
        );

        let start = PAGE_HEADER_SIZE + i * SLOT_SIZE;
        let slot = Slot::ref_from_bytes(&self.data[start..start + SLOT_SIZE])
            .map_err(|e| eyre::eyre!("failed to read slot {} on page {}: {:?}", i, self.id(), e))?;
        Ok(*slot)
    }

    fn record(&self, offset: usize, len: usize) -> Result<Bytes> {
        let start = PAGE_HEADER_SIZE + offset;
        ensure!(
            start + len <= self.data.len(),
            "record extends beyond page {}: offset={}, len={}, span={}",
            self.id(),
            offset,
            len,
            self.data.len()
        );
        Ok(self.data.slice(start..start + len))
    }

    pub fn key_at(&self, i: usize) -> Result<Bytes> {
        ensure!(
            matches!(self.kind, PageKind::Leaf | PageKind::Internal),
            "key_at on {:?} page {}",
            self.kind,
            self.id()
        );

        let slot = self.slot(i)?;
        self.record(slot.offset(), slot.key_size())
    }

    pub fn value_at(&self, i: usize) -> Result<Bytes> {
        ensure!(
            self.kind == PageKind::Leaf,
            "value_at on {:?} page {}",
            self.kind,
            self.id()
        );

        let slot = self.slot(i)?;
        self.record(slot.offset() + slot.key_size(), slot.value_size())
    }

    pub fn child_id_at(&self, i: usize) -> Result<PageId> {
        ensure!(
            self.kind == PageKind::Internal,
            "child_id_at on {:?} page {}",
            self.kind,
            self.id()
        );

        Ok(self.slot(i)?.child_id())
    }

    /// Decodes a freelist page's id array.
    pub fn freelist_ids(&self) -> Result<Vec<PageId>> {
        ensure!(
            self.kind == PageKind::Freelist,
            "freelist_ids on {:?} page {}",
            self.kind,
            self.id()
        );

        let count = self.count();
        let end = PAGE_HEADER_SIZE + count * size_of::<PageId>();
        ensure!(
            end <= self.data.len(),
            "freelist page {} overruns its span: {} ids in {} bytes",
            self.id(),
            count,
            self.data.len()
        );

        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let at = PAGE_HEADER_SIZE + i * size_of::<PageId>();
            ids.push(PageId::from_le_bytes(self.data[at..at + 4].try_into().unwrap()));
        }
        Ok(ids)
    }
}

/// Owned, mutable buffer for a dirty page. Sized at creation to the full
/// physical span and written verbatim at commit.
#[derive(Debug)]
pub struct PageBuf {
    buf: Vec<u8>,
}

impl PageBuf {
    pub fn new(index: PageId, pages: u32) -> Result<Self> {
        ensure!(pages >= 1, "page buffer must span at least one page");

        let mut buf = vec![0u8; pages as usize * PAGE_SIZE];
        let header = PageHeader::from_bytes_mut(&mut buf)?;
        header.set_index(index);
        header.set_overflow(pages - 1);

        Ok(Self { buf })
    }

    pub fn id(&self) -> PageId {
        self.header().index()
    }

    pub fn header(&self) -> PageHeader {
        *PageHeader::from_bytes(&self.buf).expect("page buffer shorter than its header")
    }

    fn header_mut(&mut self) -> &mut PageHeader {
        PageHeader::from_bytes_mut(&mut self.buf).expect("page buffer shorter than its header")
    }

    pub fn set_kind(&mut self, kind: PageKind) {
        self.header_mut().set_flags(kind.flag());
    }

    pub fn set_count(&mut self, count: u32) {
        self.header_mut().set_count(count);
    }

    pub fn kind(&self) -> Result<PageKind> {
        self.header().kind()
    }

    /// Capacity of the data area across the whole span.
    pub fn data_capacity(&self) -> usize {
        self.buf.len() - PAGE_HEADER_SIZE
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Re-reads this buffer as a [`PageRef`] (copies the bytes).
    pub fn as_page_ref(&self) -> Result<PageRef> {
        PageRef::new(Bytes::copy_from_slice(&self.buf))
    }

    fn write_slot(&mut self, i: usize, slot: Slot) -> Result<()> {
        let start = PAGE_HEADER_SIZE + i * SLOT_SIZE;
        ensure!(
            start + SLOT_SIZE <= self.buf.len(),
            "slot {} outside page {} span",
            i,
            self.id()
        );
        self.buf[start..start + SLOT_SIZE].copy_from_slice(slot.as_bytes());
        Ok(())
    }

    fn check_record(&self, i: usize, key_offset: usize, len: usize) -> Result<()> {
        let count = self.header().count() as usize;
        ensure!(
            i < count,
            "record index {} out of bounds (count={}) on page {}",
            i,
            count,
            self.id()
        );
        ensure!(
            key_offset >= count * SLOT_SIZE,
            "record at offset {} would overlap the slot table ({} slots) on page {}",
            key_offset,
            count,
            self.id()
        );
        ensure!(
            key_offset + len <= self.data_capacity(),
            "record at offset {} with length {} exceeds page {} capacity {}",
            key_offset,
            len,
            self.id(),
            self.data_capacity()
        );
        Ok(())
    }

    /// Writes leaf record `i`: slot metadata plus `key || value` bytes at
    /// `key_offset` within the data area. The caller accumulates offsets,
    /// starting at the end of the slot table.
    pub fn write_key_value_at(
        &mut self,
        i: usize,
        key_offset: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        ensure!(
            self.kind()? == PageKind::Leaf,
            "write_key_value_at on {:?} page {}",
            self.kind()?,
            self.id()
        );
        self.check_record(i, key_offset, key.len() + value.len())?;

        self.write_slot(i, Slot::leaf(key_offset as u32, key.len() as u32, value.len() as u32))?;

        let start = PAGE_HEADER_SIZE + key_offset;
        self.buf[start..start + key.len()].copy_from_slice(key);
        self.buf[start + key.len()..start + key.len() + value.len()].copy_from_slice(value);
        Ok(())
    }

    /// Writes internal record `i`: slot metadata plus the key bytes.
    pub fn write_key_child_at(
        &mut self,
        i: usize,
        key_offset: usize,
        key: &[u8],
        child: PageId,
    ) -> Result<()> {
        ensure!(
            self.kind()? == PageKind::Internal,
            "write_key_child_at on {:?} page {}",
            self.kind()?,
            self.id()
        );
        self.check_record(i, key_offset, key.len())?;

        self.write_slot(i, Slot::internal(key_offset as u32, key.len() as u32, child))?;

        let start = PAGE_HEADER_SIZE + key_offset;
        self.buf[start..start + key.len()].copy_from_slice(key);
        Ok(())
    }

    /// Serializes a sorted id list as a freelist page.
    pub fn write_freelist(&mut self, ids: &[PageId]) -> Result<()> {
        ensure!(
            ids.len() * size_of::<PageId>() <= self.data_capacity(),
            "freelist with {} ids does not fit page {} span of {} bytes",
            ids.len(),
            self.id(),
            self.buf.len()
        );

        self.set_kind(PageKind::Freelist);
        self.set_count(ids.len() as u32);

        for (i, id) in ids.iter().enumerate() {
            let at = PAGE_HEADER_SIZE + i * size_of::<PageId>();
            self.buf[at..at + 4].copy_from_slice(&id.to_le_bytes());
        }
        Ok(())
    }

    /// The data area, for payloads written by other modules (meta).
    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[PAGE_HEADER_SIZE..]
    }
}
