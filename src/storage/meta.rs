//! # Meta Page
//!
//! Page 0 of every store file is the meta page. Its data area carries the
//! magic constant and the three pointers that anchor the committed state:
//!
//! ```text
//! Offset  Size  Field          Description
//! ------  ----  -------------  ----------------------------------------
//! 0       4     magic          MAGIC ("burw"); rejected at open otherwise
//! 4       4     total_pages    Allocated page count, also the next fresh id
//! 8       4     freelist_page  PageId of the current freelist page
//! 12      4     root_page      PageId of the current B+tree root
//! ```
//!
//! The meta page is the only page ever overwritten in place: a commit
//! writes all its freshly allocated pages first, syncs, then writes the
//! meta page and syncs again. A crash between the two syncs leaves the old
//! meta intact and only unreferenced pages changed, so the store is always
//! either entirely the previous commit or entirely the new one.
//!
//! In memory, [`Meta`] is a small `Copy` struct; every transaction works on
//! a private copy and the writer publishes its copy at commit.

use eyre::{ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::MAGIC;
use crate::error::StoreError;

use super::{PageBuf, PageId, PageKind, PageRef};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MetaPayload {
    magic: U32,
    total_pages: U32,
    freelist_page: U32,
    root_page: U32,
}

/// In-memory form of the meta page payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    /// Number of allocated pages; doubles as the next headroom PageId.
    pub total_pages: PageId,
    /// Current freelist page.
    pub freelist_page: PageId,
    /// Current B+tree root page.
    pub root_page: PageId,
}

impl Meta {
    /// Decodes and validates the meta payload of page 0.
    pub fn read(page: &PageRef) -> Result<Self> {
        ensure!(
            page.kind() == PageKind::Meta,
            "expected meta page, got {:?} at page {}",
            page.kind(),
            page.id()
        );

        let payload = page.payload();
        let decoded = MetaPayload::ref_from_bytes(&payload[..size_of::<MetaPayload>()])
            .map_err(|e| eyre::eyre!("failed to decode meta payload: {:?}", e))?;

        let found = decoded.magic.get();
        if found != MAGIC {
            return Err(StoreError::MagicMismatch {
                expected: MAGIC,
                found,
            }
            .into());
        }

        Ok(Self {
            total_pages: decoded.total_pages.get(),
            freelist_page: decoded.freelist_page.get(),
            root_page: decoded.root_page.get(),
        })
    }

    /// Encodes the payload (including the magic) into a meta page buffer.
    pub fn write(&self, buf: &mut PageBuf) -> Result<()> {
        buf.set_kind(PageKind::Meta);

        let payload = MetaPayload {
            magic: U32::new(MAGIC),
            total_pages: U32::new(self.total_pages),
            freelist_page: U32::new(self.freelist_page),
            root_page: U32::new(self.root_page),
        };

        let dst = buf.payload_mut();
        ensure!(
            dst.len() >= size_of::<MetaPayload>(),
            "meta payload does not fit page data area"
        );
        dst[..size_of::<MetaPayload>()].copy_from_slice(payload.as_bytes());
        Ok(())
    }
}
