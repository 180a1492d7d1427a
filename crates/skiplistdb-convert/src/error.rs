//! Error types for skiplistdb-convert.

use thiserror::Error;

/// Conversion error kinds.
#[derive(Error, Debug)]
pub enum Error {
    /// The store layer returned an error opening, reading, or writing one
    /// of the two files involved in a conversion.
    #[error("store error: {0}")]
    Store(#[from] skiplistdb_core::Error),

    /// The destination path already exists and `--force` wasn't passed.
    #[error("destination already exists: {0}")]
    DestinationExists(String),

    /// Source and destination resolved to the same canonical path.
    #[error("source and destination are the same file")]
    SameFile,

    /// Command-line argument validation failure.
    #[error("invalid argument: {0}")]
    BadArg(String),

    /// IO error outside the store layer (e.g. checking whether a path
    /// exists).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for conversion operations.
pub type Result<T> = std::result::Result<T, Error>;
