//! # Burrow - Embeddable Single-File Key-Value Store
//!
//! Burrow stores arbitrary byte keys and values in one memory-mapped file,
//! indexed by a copy-on-write B+tree. Point reads, writes, and deletes are
//! grouped into transactions under a single-writer / multiple-reader
//! discipline; a commit is atomic or invisible.
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrow::Db;
//!
//! let db = Db::open("./data.db")?;
//!
//! let mut tx = db.begin_write()?;
//! tx.set(b"hello", b"world")?;
//! tx.commit()?;
//!
//! let mut reader = db.begin_read()?;
//! assert_eq!(reader.get(b"hello")?.as_deref(), Some(b"world".as_ref()));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │    Public API (Db / ReadTx / WriteTx)│
//! ├─────────────────────────────────────┤
//! │  Transaction (node cache, dirty set, │
//! │  merge / spill / commit pipeline)    │
//! ├─────────────────────────────────────┤
//! │  B+Tree nodes (arena, split, search) │
//! ├─────────────────────────────────────┤
//! │  Pages (header, slots, freelist,     │
//! │  meta) + free-space management       │
//! ├─────────────────────────────────────┤
//! │  Memory-mapped file (read path) +    │
//! │  pwrite/fsync (commit path)          │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Layout
//!
//! A single regular file of 4096-byte pages. Page 0 is the meta page
//! (magic, total pages, freelist pointer, root pointer); every other page
//! is a freelist, internal, or leaf page identified by its header flags.
//! No log file, no sidecars.
//!
//! ## Durability Model
//!
//! Commits are copy-on-write: every modified node is rewritten onto a
//! freshly allocated page and the superseded page goes to the freelist,
//! quarantined until the commit publishes. The write order -- data pages,
//! fsync, meta page, fsync -- means a crash at any point leaves the file
//! readable as the previous committed state.
//!
//! ## Concurrency Model
//!
//! At most one writable transaction is live per database; `begin_write`
//! fails fast instead of queueing. Readers never block and see the meta
//! committed before they began. There are no background threads.
//!
//! ## Module Overview
//!
//! - [`storage`]: page format, mmap lifecycle, freelist, meta page
//! - [`tree`]: decoded B+tree nodes and the transaction node arena
//! - [`tx`]: read/write transactions and the commit pipeline
//! - [`db`]: the database handle, writer gate, and page allocation
//! - [`config`]: page geometry, thresholds, limits, growth ladder
//! - [`error`]: typed error kinds carried through `eyre` reports

pub mod config;
pub mod db;
pub mod error;
pub mod storage;
pub mod tree;
pub mod tx;

pub use bytes::Bytes;
pub use db::Db;
pub use error::StoreError;
pub use tx::{ReadTx, WriteTx};
