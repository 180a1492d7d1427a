//! # skiplistdb-core
//!
//! An embedded, single-file, crash-safe, ordered key-value store.
//!
//! The on-disk layout is a persistent skip list: every record (key, value,
//! and a handful of forward pointers) lives at a fixed offset in one
//! memory-mapped file, alongside an append-only write-ahead log of the same
//! record kinds. Recovery never trusts a record's forward pointers once
//! it's in the WAL region — it replays the log from the last checkpoint
//! instead. Checkpoint periodically rewrites the live key set into a fresh,
//! compact file and atomically renames it into place.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use skiplistdb_core::{Database, OpenFlags, StoreFactory, StoreOptions};
//!
//! fn main() -> skiplistdb_core::Result<()> {
//!     let factory = StoreFactory::new();
//!     let db = Database::open(&factory, "./data.db", OpenFlags::CREATE, StoreOptions::default())?;
//!
//!     db.create(b"hello", b"world".to_vec())?;
//!     assert_eq!(db.fetch(b"hello")?, Some(b"world".to_vec()));
//!
//!     let mut txn = db.begin()?;
//!     txn.store(b"hello", b"there".to_vec())?;
//!     txn.commit()?;
//!
//!     db.close()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(
    test,
    allow(
        clippy::doc_markdown,
        clippy::uninlined_format_args,
        clippy::single_match_else,
        clippy::cast_lossless,
        clippy::manual_assert
    )
)]

pub mod checkpoint;
pub mod consistency;
pub mod error;
pub mod file_io;
pub mod handle;
pub mod header;
pub mod location;
pub mod lock;
pub mod offset;
pub mod options;
pub mod record;
pub mod recovery;
pub mod registry;
pub mod skiplist;
pub mod stamp;
pub mod wal;

pub use error::{Error, Result};
pub use file_io::{FileStore, RecordSliceGuard};
pub use handle::{Database, Transaction};
pub use header::{FileHeader, FormatVersion};
pub use lock::{LockManager, LockMode};
pub use location::Location;
pub use offset::RecordOffset;
pub use options::{OpenFlags, StoreOptions};
pub use record::{Record, RecordKind};
pub use registry::{SharedStore, StoreFactory};
