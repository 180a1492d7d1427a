//! File-range advisory locking, for coordination between processes sharing
//! a store file. In-process concurrency is the caller's problem (see
//! `registry`); this module only arbitrates across process boundaries.
//!
//! The lock is taken directly on the store's own path, not a sibling file:
//! a checkpoint's atomic rename swaps that very path out from under any
//! handle still holding an open descriptor on it, which is exactly the
//! staleness `reopen_if_stale` below exists to detect.

use crate::error::Result;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Holds the store file open for locking purposes and tracks the inode it
/// was opened against, so a rename-based checkpoint swap (which leaves old
/// lock-holders pointing at an unlinked inode) can be detected and
/// recovered from.
pub struct LockManager {
    path: PathBuf,
    file: File,
    inode: u64,
}

/// What a held lock guarantees.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Any number of shared holders, no exclusive holder.
    Shared,
    /// Exactly one holder, no shared holders.
    Exclusive,
}

impl LockManager {
    /// Opens (creating if necessary) `path` itself for locking.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let inode = file.metadata()?.ino();
        Ok(LockManager { path, file, inode })
    }

    /// Acquires the lock in the given mode, blocking until available.
    ///
    /// Before blocking, checks whether the on-disk lock file's inode still
    /// matches the one this manager opened; if a checkpoint renamed a new
    /// file into place since, reopens against the current inode first so
    /// this handle doesn't lock a now-unlinked file nobody else is looking
    /// at.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the lock cannot be taken or the stale-inode
    /// reopen fails.
    pub fn lock(&mut self, mode: LockMode) -> Result<()> {
        self.reopen_if_stale()?;
        match mode {
            LockMode::Shared => self.file.lock_shared()?,
            LockMode::Exclusive => self.file.lock_exclusive()?,
        }
        Ok(())
    }

    /// Releases a previously acquired lock. For a write transaction the
    /// caller must `fsync` the data file *before* calling this, so that any
    /// reader who acquires the lock next sees durable data (spec.md's
    /// "fsync-before-release-on-write" contract).
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the unlock fails.
    pub fn unlock(&mut self) -> Result<()> {
        fs2::FileExt::unlock(&self.file)?;
        Ok(())
    }

    fn reopen_if_stale(&mut self) -> Result<()> {
        let on_disk_inode = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.ino(),
            Err(_) => {
                // The path vanished outright (e.g. its directory was
                // recreated); recreate it.
                let file = OpenOptions::new().read(true).write(true).create(true).open(&self.path)?;
                let inode = file.metadata()?.ino();
                self.file = file;
                self.inode = inode;
                return Ok(());
            }
        };
        if on_disk_inode != self.inode {
            let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
            self.inode = on_disk_inode;
            self.file = file;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_do_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let mut a = LockManager::open(&path).unwrap();
        let mut b = LockManager::open(&path).unwrap();
        a.lock(LockMode::Shared).unwrap();
        b.lock(LockMode::Shared).unwrap();
        a.unlock().unwrap();
        b.unlock().unwrap();
    }

    #[test]
    fn open_locks_the_store_path_itself_not_a_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let _manager = LockManager::open(&path).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("store.db.lock").exists());
    }

    #[test]
    fn reopen_after_checkpoint_style_rename_picks_up_new_inode() {
        // Simulates what checkpoint::run does: a replacement file is built
        // under a sibling name, then renamed on top of the original path.
        // The rename leaves `manager` holding a descriptor on the old,
        // now-unlinked inode until `lock` notices the mismatch.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let mut manager = LockManager::open(&path).unwrap();
        let original_inode = manager.inode;

        let replacement = dir.path().join("store.db.NEW");
        std::fs::write(&replacement, b"new contents").unwrap();
        std::fs::rename(&replacement, &path).unwrap();

        manager.lock(LockMode::Exclusive).unwrap();
        assert_ne!(manager.inode, original_inode);
        manager.unlock().unwrap();
    }
}
