//! The sibling "stamp" file: a single big-endian timestamp recording the
//! last time the host process started up. Any store whose header's
//! `last_recovery_timestamp` predates the stamp was left open across a
//! restart and must be recovered before use, regardless of whether its WAL
//! tail looks clean — another process may have crashed with the lock held
//! in a way this process can't otherwise detect.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Path of the stamp file: `<dir>/.skiplistdb-stamp` alongside the store.
#[must_use]
pub fn stamp_path(store_path: &Path) -> PathBuf {
    let dir = store_path.parent().unwrap_or_else(|| Path::new("."));
    dir.join(".skiplistdb-stamp")
}

/// Reads the stamp value, tolerating both a 4-byte (legacy) and 8-byte
/// (current) big-endian encoding. Returns `0` if the file does not exist
/// (nothing has booted against this directory yet).
///
/// # Errors
///
/// Returns `Error::Internal` if the file exists but is neither 4 nor 8
/// bytes long.
pub fn read(store_path: &Path) -> Result<u64> {
    let path = stamp_path(store_path);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(Error::Io(err)),
    };
    match bytes.len() {
        4 => Ok(u64::from(u32::from_be_bytes(bytes.try_into().unwrap()))),
        8 => Ok(u64::from_be_bytes(bytes.try_into().unwrap())),
        other => Err(Error::internal(format!("stamp file has unexpected length {other}"))),
    }
}

/// Writes `timestamp` as an 8-byte big-endian stamp, creating or
/// truncating the file as needed.
///
/// # Errors
///
/// Returns `Error::Io` if the write fails.
pub fn write(store_path: &Path, timestamp: u64) -> Result<()> {
    let path = stamp_path(store_path);
    std::fs::write(path, timestamp.to_be_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_stamp_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("store.db");
        assert_eq!(read(&store_path).unwrap(), 0);
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("store.db");
        write(&store_path, 123_456_789).unwrap();
        assert_eq!(read(&store_path).unwrap(), 123_456_789);
    }

    #[test]
    fn reads_legacy_four_byte_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("store.db");
        std::fs::write(stamp_path(&store_path), 42u32.to_be_bytes()).unwrap();
        assert_eq!(read(&store_path).unwrap(), 42);
    }
}
