//! # Burrow Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (4096 bytes, fixed -- NOT derived from the host page size)
//!       │
//!       ├─> PAGE_HEADER_SIZE (16 bytes, fixed)
//!       │
//!       ├─> SLOT_SIZE (16 bytes, shared by leaf and internal records)
//!       │
//!       ├─> PAGE_USABLE_SIZE (derived: PAGE_SIZE - PAGE_HEADER_SIZE)
//!       │
//!       ├─> SPLIT_THRESHOLD (derived: PAGE_SIZE / 2)
//!       │     A node splits at the first record boundary past this size.
//!       │     Half-full packing leaves room for later inserts without an
//!       │     immediate re-split.
//!       │
//!       └─> UNDERFILL_THRESHOLD (derived: PAGE_SIZE / 4)
//!             Below this serialized size a node becomes a merge candidate.
//!
//! MIN_KEYS (2)
//!       │
//!       └─> MAX_KEYS (2 * MIN_KEYS)
//!             A node is split-eligible only past MAX_KEYS, which guarantees
//!             both halves of a split end with at least MIN_KEYS keys.
//!
//! INIT_MMAP_SIZE (128 KiB)
//!       │
//!       └─> Doubles up to 1 GiB, then grows by MMAP_STEP (1 GiB) up to
//!           MAX_MMAP_SIZE (16 GiB, hard ceiling).
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `PAGE_USABLE_SIZE == PAGE_SIZE - PAGE_HEADER_SIZE`
//! 2. `SPLIT_THRESHOLD` and `UNDERFILL_THRESHOLD` derive from `PAGE_SIZE`
//! 3. `MAX_KEYS == 2 * MIN_KEYS`
//! 4. The mmap ladder is ordered: `INIT_MMAP_SIZE < MMAP_STEP < MAX_MMAP_SIZE`
//!
//! ## Modifying Constants
//!
//! `PAGE_SIZE`, `PAGE_HEADER_SIZE`, `SLOT_SIZE`, and `MAGIC` define the
//! on-disk format. Changing any of them makes existing database files
//! unreadable; there is no cross-version migration.

// ============================================================================
// PAGE LAYOUT CONSTANTS
// These define the on-disk format and must never change for existing files
// ============================================================================

/// Size of each database page in bytes (4KB).
/// Fixed for file portability; deliberately not read from the host OS.
pub const PAGE_SIZE: usize = 4096;

/// Size of the page header in bytes.
/// Every page begins with this header: overflow, count, index, flags.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Size of one record slot in bytes.
/// Leaf slots are (offset, key_size, value_size); internal slots are
/// (offset, key_size, child_id). Both use the same fixed-width struct so
/// slot-table arithmetic is identical for every node page.
pub const SLOT_SIZE: usize = 16;

/// Usable space in a page after the header.
pub const PAGE_USABLE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Magic constant stored in the meta page ("burw" in little-endian ASCII).
/// A file whose meta page does not carry it is rejected at open.
pub const MAGIC: u32 = 0x6275_7277;

const _: () = assert!(PAGE_USABLE_SIZE == PAGE_SIZE - PAGE_HEADER_SIZE);

// ============================================================================
// B+TREE NODE THRESHOLDS
// Split and merge triggers; all derived from the page geometry
// ============================================================================

/// Minimum key count for a committed non-root node.
pub const MIN_KEYS: usize = 2;

/// Key count above which an oversized node becomes split-eligible.
/// A node splits only when BOTH `keys > MAX_KEYS` AND `size > PAGE_SIZE`,
/// so both split halves retain at least MIN_KEYS keys.
pub const MAX_KEYS: usize = 2 * MIN_KEYS;

/// Serialized size at which the split point is placed.
/// The left half of a split keeps at least this many bytes.
pub const SPLIT_THRESHOLD: usize = PAGE_SIZE / 2;

/// Serialized size below which a node becomes a merge candidate.
pub const UNDERFILL_THRESHOLD: usize = PAGE_SIZE / 4;

const _: () = assert!(MAX_KEYS == 2 * MIN_KEYS);
const _: () = assert!(UNDERFILL_THRESHOLD < SPLIT_THRESHOLD);
const _: () = assert!(SPLIT_THRESHOLD <= PAGE_SIZE);

// ============================================================================
// KEY / VALUE LIMITS
// ============================================================================

/// Maximum key length in bytes (1 MiB). Keys are at least one byte.
pub const MAX_KEY_SIZE: usize = 1 << 20;

/// Maximum value length in bytes (1 GiB). Values may be empty.
pub const MAX_VALUE_SIZE: usize = 1 << 30;

// ============================================================================
// MEMORY MAP GROWTH LADDER
// ============================================================================

/// Initial memory map size (128 KiB).
pub const INIT_MMAP_SIZE: usize = 1 << 17;

/// Once the map passes 1 GiB it grows in steps of this size (1 GiB).
pub const MMAP_STEP: usize = 1 << 30;

/// Hard ceiling on the memory map size (16 GiB).
pub const MAX_MMAP_SIZE: usize = 1 << 34;

const _: () = assert!(INIT_MMAP_SIZE % PAGE_SIZE == 0);
const _: () = assert!(INIT_MMAP_SIZE < MMAP_STEP && MMAP_STEP < MAX_MMAP_SIZE);
const _: () = assert!(MAX_MMAP_SIZE % MMAP_STEP == 0);
