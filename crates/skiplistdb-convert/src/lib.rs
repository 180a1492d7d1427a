//! Converts a skiplistdb file between the legacy and current on-disk
//! formats.
//!
//! Opens the source file under its own native format (whichever one
//! [`skiplistdb_core::Database::open`] detects), opens a fresh destination
//! file in the requested format, and copies every live key/value pair
//! across via `foreach` + `store`. This is a plain reader/writer copy, not
//! an in-place upgrade: the source file is left untouched.

#![warn(missing_docs)]

pub mod error;

pub use error::{Error, Result};

use skiplistdb_core::{Database, FormatVersion, OpenFlags, StoreFactory, StoreOptions};
use std::path::Path;
use tracing::info;

/// Summary of a completed conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertStats {
    /// Number of key/value pairs copied.
    pub records: u64,
}

/// Copies every entry from `source` into a freshly created `dest` file in
/// `target_version` format.
///
/// # Errors
///
/// Returns [`Error::DestinationExists`] if `dest` exists and `force` is
/// `false`, [`Error::SameFile`] if `source` and `dest` canonicalize to the
/// same file, or [`Error::Store`]/[`Error::Io`] for any failure opening,
/// reading, or writing either file.
pub fn convert(source: &Path, dest: &Path, target_version: FormatVersion, force: bool) -> Result<ConvertStats> {
    if let (Ok(src_canon), Ok(dst_canon)) = (source.canonicalize(), dest.canonicalize()) {
        if src_canon == dst_canon {
            return Err(Error::SameFile);
        }
    }
    if dest.exists() {
        if !force {
            return Err(Error::DestinationExists(dest.display().to_string()));
        }
        std::fs::remove_file(dest)?;
    }

    let factory = StoreFactory::new();
    let src = Database::open(&factory, source, OpenFlags::empty(), StoreOptions::default())?;

    let dest_options = StoreOptions { create_version: target_version, ..StoreOptions::default() };
    let dst = Database::open(&factory, dest, OpenFlags::CREATE, dest_options)?;

    let mut records = 0u64;
    src.foreach(None, |key, value| {
        dst.store(key, value.to_vec())?;
        records += 1;
        if records % 10_000 == 0 {
            info!(records, "conversion progress");
        }
        Ok(true)
    })?;

    dst.close()?;
    src.close()?;
    info!(records, source = %source.display(), dest = %dest.display(), "conversion complete");
    Ok(ConvertStats { records })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_all_entries_to_legacy() {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("current.db");
        let dst_path = dir.path().join("legacy.db");

        let factory = StoreFactory::new();
        let src = Database::open(&factory, &src_path, OpenFlags::CREATE, StoreOptions::default()).unwrap();
        src.create(b"alpha", b"1".to_vec()).unwrap();
        src.create(b"beta", b"2".to_vec()).unwrap();
        src.create(b"gamma", b"3".to_vec()).unwrap();
        src.close().unwrap();

        let stats = convert(&src_path, &dst_path, FormatVersion::Legacy, false).unwrap();
        assert_eq!(stats.records, 3);

        let factory2 = StoreFactory::new();
        let dst = Database::open(&factory2, &dst_path, OpenFlags::empty(), StoreOptions::default()).unwrap();
        assert_eq!(dst.fetch(b"alpha").unwrap(), Some(b"1".to_vec()));
        assert_eq!(dst.fetch(b"beta").unwrap(), Some(b"2".to_vec()));
        assert_eq!(dst.fetch(b"gamma").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn refuses_existing_destination_without_force() {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("a.db");
        let dst_path = dir.path().join("b.db");
        let factory = StoreFactory::new();
        Database::open(&factory, &src_path, OpenFlags::CREATE, StoreOptions::default())
            .unwrap()
            .close()
            .unwrap();
        std::fs::write(&dst_path, b"existing").unwrap();

        let err = convert(&src_path, &dst_path, FormatVersion::Current, false).unwrap_err();
        assert!(matches!(err, Error::DestinationExists(_)));
    }

    #[test]
    fn force_overwrites_existing_destination() {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("a.db");
        let dst_path = dir.path().join("b.db");
        let factory = StoreFactory::new();
        let src = Database::open(&factory, &src_path, OpenFlags::CREATE, StoreOptions::default()).unwrap();
        src.create(b"k", b"v".to_vec()).unwrap();
        src.close().unwrap();
        std::fs::write(&dst_path, b"stale contents").unwrap();

        let stats = convert(&src_path, &dst_path, FormatVersion::Current, true).unwrap();
        assert_eq!(stats.records, 1);
    }
}
