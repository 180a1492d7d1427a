//! The open-instance registry: a path-keyed, refcounted table of handles
//! owned by a `StoreFactory` value, not a process-global static. Two
//! callers opening the same path through the same factory share a single
//! underlying `FileStore`/`LockManager` pair rather than mapping the file
//! twice.
//!
//! The registry itself is internally synchronized (it must be, since a
//! `StoreFactory` can be cloned and handed to multiple threads), but it
//! deliberately does not serialize access *within* a shared entry beyond
//! that: callers sharing an entry still coordinate through the entry's own
//! `LockManager` and single-outstanding-transaction rule, exactly as two
//! separate processes would.

use crate::error::{Error, Result};
use crate::file_io::FileStore;
use crate::lock::LockManager;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// The shared state behind every open handle for one store path.
pub struct SharedStore {
    pub store: FileStore,
    pub lock: Mutex<LockManager>,
}

/// A refcounted table of open stores, keyed by canonicalized path.
///
/// Cloning a `StoreFactory` shares the same underlying table: every clone
/// sees the same set of open entries.
#[derive(Clone)]
pub struct StoreFactory {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<SharedStore>>>>,
}

impl StoreFactory {
    /// Creates a factory with an empty table.
    #[must_use]
    pub fn new() -> Self {
        StoreFactory { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Returns the existing entry for `path` if one is open, or opens and
    /// registers a new one via `open_new`. `path` is canonicalized first so
    /// two different-but-equivalent paths (e.g. `./a` and `a`) to the same
    /// file share an entry.
    ///
    /// # Errors
    ///
    /// Returns any error from `open_new`, or `Error::Io` if the path cannot
    /// be canonicalized (e.g. the parent directory doesn't exist and
    /// `create` wasn't requested).
    pub fn acquire(
        &self,
        path: impl Into<PathBuf>,
        open_new: impl FnOnce(&std::path::Path) -> Result<SharedStore>,
    ) -> Result<Arc<SharedStore>> {
        let raw_path = path.into();
        let key = canonical_key(&raw_path)?;
        let mut table = self.inner.lock();
        if let Some(existing) = table.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let shared = Arc::new(open_new(&raw_path)?);
        table.insert(key, Arc::clone(&shared));
        Ok(shared)
    }

    /// Drops this factory's reference to `path`'s entry if this was the
    /// last outside holder (i.e. the `Arc` strong count is 1 before this
    /// call removes the table's own reference, meaning no handle is still
    /// using it). Safe to call even if nothing is registered for `path`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if `path` cannot be canonicalized.
    pub fn release(&self, path: impl Into<PathBuf>) -> Result<()> {
        let raw_path = path.into();
        let key = canonical_key(&raw_path)?;
        let mut table = self.inner.lock();
        if let Some(entry) = table.get(&key) {
            if Arc::strong_count(entry) <= 1 {
                table.remove(&key);
            }
        }
        Ok(())
    }

    /// Number of distinct store paths currently tracked. Exposed for tests
    /// and diagnostics, not part of the steady-state API surface.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Default for StoreFactory {
    fn default() -> Self {
        Self::new()
    }
}

fn canonical_key(path: &std::path::Path) -> Result<PathBuf> {
    match fs::canonicalize(path) {
        Ok(canonical) => Ok(canonical),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            // The file doesn't exist yet (first `create`); key on the
            // canonicalized parent plus the file name instead.
            let parent = path.parent().ok_or_else(|| Error::bad_param("path has no parent"))?;
            let file_name = path
                .file_name()
                .ok_or_else(|| Error::bad_param("path has no file name"))?;
            let canonical_parent = fs::canonicalize(parent)?;
            Ok(canonical_parent.join(file_name))
        }
        Err(err) => Err(Error::Io(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockManager;

    fn dummy_open(path: &std::path::Path) -> Result<SharedStore> {
        let store = FileStore::open(path, true, 4096, false)?;
        let lock = LockManager::open(path)?;
        Ok(SharedStore { store, lock: Mutex::new(lock) })
    }

    #[test]
    fn same_path_shares_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let factory = StoreFactory::new();
        let a = factory.acquire(&path, dummy_open).unwrap();
        let b = factory.acquire(&path, dummy_open).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.open_count(), 1);
    }

    #[test]
    fn release_drops_entry_once_unused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let factory = StoreFactory::new();
        let a = factory.acquire(&path, dummy_open).unwrap();
        drop(a);
        factory.release(&path).unwrap();
        assert_eq!(factory.open_count(), 0);
    }

    #[test]
    fn distinct_paths_get_distinct_entries() {
        let dir = tempfile::tempdir().unwrap();
        let factory = StoreFactory::new();
        let a = factory.acquire(dir.path().join("a.db"), dummy_open).unwrap();
        let b = factory.acquire(dir.path().join("b.db"), dummy_open).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(factory.open_count(), 2);
    }
}
