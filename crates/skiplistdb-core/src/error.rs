//! Error types for the skip-list store.

use thiserror::Error;

/// Store error kinds.
///
/// These map directly onto the semantic error kinds a caller needs to
/// distinguish: whether a retry makes sense, whether the handle is still
/// usable, and whether the on-disk file itself needs attention.
#[derive(Error, Debug)]
pub enum Error {
    /// Point lookup found no record for the key.
    #[error("key not found")]
    NotFound,

    /// `create` was called for a key that already exists.
    #[error("key already exists")]
    Exists,

    /// Transient contention; the caller may retry the operation.
    #[error("transient contention, retry")]
    Again,

    /// A `Txn` was passed to `commit`/`abort` that does not belong to this
    /// handle (or the handle already has a different transaction open).
    #[error("transaction does not belong to this handle")]
    Locked,

    /// Argument validation failure (e.g. an empty key).
    #[error("invalid parameter: {0}")]
    BadParam(String),

    /// Low-level read/write/lock/fsync/mmap failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A consistency violation: CRC mismatch, corrupt header, unsupported
    /// compressed record when compression support isn't linked, or a skip
    /// list invariant broken where it must never be.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for [`Error::BadParam`].
    pub fn bad_param(msg: impl Into<String>) -> Self {
        Error::BadParam(msg.into())
    }

    /// Shorthand for [`Error::Internal`].
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// True if this error kind leaves the handle in a state that must be
    /// recovered before further writes are attempted.
    #[must_use]
    pub fn requires_recovery(&self) -> bool {
        matches!(self, Error::Internal(_) | Error::Io(_))
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
