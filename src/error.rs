//! # Typed Error Kinds
//!
//! All fallible operations in this crate return `eyre::Result`, following the
//! convention of attaching human-readable context at each layer. The handful
//! of conditions callers need to react to programmatically are expressed as
//! `StoreError` variants and attached to the report, so they survive context
//! wrapping and can be recovered with `Report::downcast_ref::<StoreError>()`.
//!
//! Lookup misses are deliberately NOT an error: `get` and `remove` return
//! `Option` for the absent case.
//!
//! ## Classification
//!
//! | kind               | raised by            | recoverable |
//! |--------------------|----------------------|-------------|
//! | `MagicMismatch`    | `Db::open`           | no (wrong or corrupt file) |
//! | `WritableConflict` | `Db::begin_write`    | yes (retry after the writer finishes) |
//! | `KeyTooLarge`      | `WriteTx::set`       | yes (caller input) |
//! | `ValueTooLarge`    | `WriteTx::set`       | yes (caller input) |
//! | `MmapLimit`        | allocation past 16 GiB | no (store is full) |
//! | `InvariantViolated`| internal consistency checks | no (engine bug, do not continue) |
//!
//! I/O failures (`read`/`write_at`/`fsync`/`mmap`) propagate as wrapped
//! `std::io::Error`s; a commit that hits one rolls back before returning it.

use thiserror::Error;

/// Typed error kinds surfaced through `eyre::Report`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The file's meta page does not carry the expected magic constant.
    #[error("file magic mismatch: expected {expected:#010x}, found {found:#010x}")]
    MagicMismatch { expected: u32, found: u32 },

    /// A second writable transaction was requested while one is live.
    #[error("another writable transaction is in progress")]
    WritableConflict,

    /// Key is empty or exceeds the 1 MiB limit.
    #[error("key length {len} outside supported range 1..={max}")]
    KeyTooLarge { len: usize, max: usize },

    /// Value exceeds the 1 GiB limit.
    #[error("value length {len} exceeds maximum {max}")]
    ValueTooLarge { len: usize, max: usize },

    /// Growing the store would push the memory map past its hard ceiling.
    #[error("memory map would exceed the {max} byte ceiling (requested {requested})")]
    MmapLimit { requested: usize, max: usize },

    /// An internal consistency check failed. The store must not be used
    /// for further writes after observing this.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),
}

impl StoreError {
    /// Shorthand used by internal consistency checks.
    pub(crate) fn invariant(msg: impl Into<String>) -> eyre::Report {
        eyre::Report::new(StoreError::InvariantViolated(msg.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_downcasts_through_context() {
        use eyre::WrapErr;

        let report: eyre::Report = eyre::Report::new(StoreError::WritableConflict);
        let wrapped = Err::<(), _>(report)
            .wrap_err("failed to begin transaction")
            .unwrap_err();

        assert_eq!(
            wrapped.downcast_ref::<StoreError>(),
            Some(&StoreError::WritableConflict)
        );
    }

    #[test]
    fn invariant_constructor_preserves_message() {
        let report = StoreError::invariant("freeing page zero");
        let kind = report.downcast_ref::<StoreError>().unwrap();

        assert!(matches!(kind, StoreError::InvariantViolated(msg) if msg == "freeing page zero"));
    }

    #[test]
    fn display_names_the_limit() {
        let err = StoreError::KeyTooLarge {
            len: 2 << 20,
            max: 1 << 20,
        };

        let msg = err.to_string();
        assert!(msg.contains("2097152"));
        assert!(msg.contains("1048576"));
    }
}
