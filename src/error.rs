//! Error surface for the store.
//!
//! Everything that can go wrong falls into four families: storage I/O,
//! on-disk corruption, lifecycle misuse (closed handles, nested
//! transactions, writes through read views), and payload conversion.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by database operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying storage read/write/seek/fsync/rename failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The fixed-size file header could not be parsed.
    #[error("corrupt header: {reason}")]
    CorruptHeader { reason: String },

    /// A record payload could not be decoded.
    #[error("corrupt record at offset {addr:#x}: {reason}")]
    CorruptRecord { addr: u64, reason: String },

    /// A reference points outside the record region of the file.
    #[error("address {addr:#x} does not point at a record")]
    BadAddress { addr: u64 },

    /// The root address no longer fits the fixed-width header.
    #[error("address {addr:#x} exceeds the 8-digit header width")]
    AddressOverflow { addr: u64 },

    /// A write transaction was started while one is already active on
    /// this thread.
    #[error("a write transaction is already active on this thread")]
    NestedTransaction,

    /// The database has been closed; the handle is no longer usable.
    #[error("database is closed")]
    Closed,

    /// A mutation was attempted through a handle attached to a read view.
    #[error("cannot mutate a handle attached to a read-only view")]
    ReadOnlyView,

    /// A value of one shape was used where another was required.
    #[error("expected {expected}, found {found}")]
    WrongType {
        expected: &'static str,
        found: &'static str,
    },

    /// Serialization of a payload or user value failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
