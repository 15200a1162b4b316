//! # Storage Module
//!
//! This module provides the on-disk layer for burrow: the fixed 4KB page
//! format, the memory-mapped file, the free-page manager, and the meta page
//! that anchors everything else.
//!
//! ## Architecture Overview
//!
//! The store is a single regular file of concatenated 4096-byte pages:
//!
//! ```text
//! Offset 0:       Page 0  (meta: magic, total_pages, freelist, root)
//! Offset 4096:    Page 1  (freelist, internal, or leaf)
//! Offset 8192:    Page 2  ...
//! ```
//!
//! Reads go through a read-only memory map; writes go through the file
//! descriptor at commit time (`write_at` + `fsync`), with the meta page
//! written last so an interrupted commit leaves only unreferenced pages.
//!
//! ## Zero-Copy Reads
//!
//! The whole mapping is wrapped once per map epoch in a refcounted
//! [`bytes::Bytes`]. Page views and the keys/values inside them are `Bytes`
//! slices of that epoch: no copying on the read path, and a reader that
//! outlives a remap keeps the old epoch alive instead of dangling. The old
//! mapping is unmapped when its last slice is dropped.
//!
//! ## Safety Model
//!
//! The mapping is `PROT_READ`; nothing in the process writes through it.
//! The only unsafe block in the crate is the `mmap` call itself, which is
//! sound because the mapping is read-only and its lifetime is carried by the
//! refcounted epoch.
//!
//! ## Module Organization
//!
//! - `page`: page header, record slots, read views and write buffers
//! - `meta`: the page-0 payload anchoring root and freelist
//! - `mmap`: file + mapping lifecycle, growth ladder, page I/O
//! - `freelist`: free-page set with contiguous allocation and per-tx
//!   quarantine

mod freelist;
mod meta;
mod mmap;
mod page;

pub use freelist::Freelist;
pub use meta::Meta;
pub use mmap::MmapStorage;
pub use page::{
    PageBuf, PageHeader, PageKind, PageRef, Slot, FLAG_FREELIST, FLAG_INTERNAL, FLAG_LEAF,
    FLAG_META,
};

pub use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE, PAGE_USABLE_SIZE, SLOT_SIZE};

/// Page identifier: the page's index within the file. Page 0 is the meta
/// page and is never freed or reallocated.
pub type PageId = u32;

/// Transaction identifier, monotonically increasing per database handle.
pub type TxId = u32;
