//! Single-file storage: the growable, memory-mapped backing file that
//! holds the header, every record, and the WAL region, all in one place.
//!
//! Reads go through the mmap directly (zero-copy, guarded against
//! concurrent remap by an epoch counter). Writes go through the same
//! mapping at a caller-given offset ("positional write"), so append and
//! in-place rewrite (header, stamp) share one code path.

use crate::error::{Error, Result};
use crate::offset::RecordOffset;
use memmap2::MmapMut;
use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// The open file descriptor and its current mapping, bundled so a checkpoint
/// rename can swap both atomically (see [`FileStore::reopen`]).
struct Mapping {
    file: File,
    mmap: MmapMut,
}

/// The growable, memory-mapped backing file for a store.
pub struct FileStore {
    path: PathBuf,
    mapping: RwLock<Mapping>,
    remap_epoch: AtomicU64,
    unsafe_no_fsync: bool,
}

impl FileStore {
    /// Minimum growth increment applied on top of whatever `required_len`
    /// demands, so frequent small appends don't each trigger a resize.
    pub const MIN_GROWTH: u64 = 1024 * 1024;

    /// Opens an existing store file, or creates one of `initial_size` bytes
    /// if `create` is set and the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` on any filesystem failure.
    pub fn open(path: impl AsRef<Path>, create: bool, initial_size: u64, unsafe_no_fsync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            file.set_len(initial_size.max(1))?;
        }

        // SAFETY: `file` is open for read+write and has a nonzero length
        // (set above if it was freshly created), so the whole mapped range
        // is backed by real file bytes.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(FileStore {
            path,
            mapping: RwLock::new(Mapping { file, mmap }),
            remap_epoch: AtomicU64::new(0),
            unsafe_no_fsync,
        })
    }

    /// The path this store is backed by.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current mapped length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.mapping.read().mmap.len() as u64
    }

    /// Whether the store is currently empty (zero bytes mapped — never
    /// true once opened, since `open` always maps at least one byte).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows the backing file/mapping, if necessary, so that `required_len`
    /// bytes are addressable from offset 0.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if resizing the file or remapping fails.
    pub fn ensure_capacity(&self, required_len: u64) -> Result<()> {
        let mut mapping = self.mapping.write();
        if (mapping.mmap.len() as u64) >= required_len {
            return Ok(());
        }
        mapping.mmap.flush()?;
        let current_len = mapping.mmap.len() as u64;
        let doubled = current_len.saturating_mul(2);
        let with_headroom = required_len.saturating_add(Self::MIN_GROWTH);
        let new_len = doubled.max(with_headroom).max(required_len);
        mapping.file.set_len(new_len)?;
        // SAFETY: `set_len` above guarantees the new range is fully backed
        // by the (sparse-extended) file; the old mapping is dropped here.
        mapping.mmap = unsafe { MmapMut::map_mut(&mapping.file)? };
        self.remap_epoch.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Writes `bytes` at `offset`, growing the file first if needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write or a necessary resize fails.
    pub fn write_at(&self, offset: RecordOffset, bytes: &[u8]) -> Result<()> {
        let end = offset.get().saturating_add(bytes.len() as u64);
        self.ensure_capacity(end)?;
        let mut mapping = self.mapping.write();
        let start = offset.as_usize();
        mapping.mmap[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Appends `bytes` at the current end-of-file marker `at`, returning
    /// the offset the bytes were written at. The caller owns tracking of
    /// what "end of file" means (the WAL append cursor); this just writes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write fails.
    pub fn append(&self, at: RecordOffset, bytes: &[u8]) -> Result<RecordOffset> {
        self.write_at(at, bytes)?;
        Ok(at)
    }

    /// Reads `len` bytes starting at `offset` into an owned `Vec`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the range is out of bounds.
    pub fn read_at(&self, offset: RecordOffset, len: usize) -> Result<Vec<u8>> {
        let mapping = self.mapping.read();
        let start = offset.as_usize();
        let end = start
            .checked_add(len)
            .ok_or_else(|| Error::internal("read range overflows"))?;
        mapping
            .mmap
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::internal("read range out of bounds"))
    }

    /// Returns a zero-copy, epoch-validated guard over `[offset, offset +
    /// len)`, valid until the backing file is next resized.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the range is out of bounds.
    pub fn read_guard(&self, offset: RecordOffset, len: usize) -> Result<RecordSliceGuard<'_>> {
        let mapping = self.mapping.read();
        let start = offset.as_usize();
        let end = start
            .checked_add(len)
            .ok_or_else(|| Error::internal("read range overflows"))?;
        if end > mapping.mmap.len() {
            return Err(Error::internal("read range out of bounds"));
        }
        let ptr = mapping.mmap.as_ptr();
        let epoch_at_creation = self.remap_epoch.load(Ordering::Acquire);
        Ok(RecordSliceGuard {
            _guard: mapping,
            ptr,
            start,
            len,
            epoch_ptr: &self.remap_epoch,
            epoch_at_creation,
        })
    }

    /// Truncates the backing file to `new_len` bytes and remaps. Used by
    /// transaction abort to discard a partially-written WAL tail.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if truncation or remapping fails.
    pub fn truncate(&self, new_len: u64) -> Result<()> {
        let mut mapping = self.mapping.write();
        mapping.mmap.flush()?;
        mapping.file.set_len(new_len)?;
        mapping.mmap = unsafe { MmapMut::map_mut(&mapping.file)? };
        self.remap_epoch.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Flushes the mapping and fsyncs the underlying file, unless the
    /// store was opened in unsafe/no-fsync mode.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the flush or fsync fails.
    pub fn sync(&self) -> Result<()> {
        if self.unsafe_no_fsync {
            return Ok(());
        }
        let mapping = self.mapping.read();
        mapping.mmap.flush()?;
        mapping.file.sync_all()?;
        Ok(())
    }

    /// Re-opens the backing file by path and remaps, discarding the old
    /// file descriptor and mapping. Used after a checkpoint renames a new
    /// file over this store's path: the existing descriptor still refers to
    /// the old (now-unlinked) inode, so every handle sharing this
    /// `FileStore` must pick up the new one before reading or writing again.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the reopen or remap fails.
    pub fn reopen(&self) -> Result<()> {
        let mut mapping = self.mapping.write();
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        // SAFETY: `file` was just opened read+write against a file that, by
        // the atomic-rename contract this is used under, is already fully
        // written and fsynced.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        *mapping = Mapping { file, mmap };
        self.remap_epoch.fetch_add(1, Ordering::Release);
        Ok(())
    }
}

/// Zero-copy, epoch-validated view into a [`FileStore`]'s mapping.
pub struct RecordSliceGuard<'a> {
    _guard: RwLockReadGuard<'a, Mapping>,
    ptr: *const u8,
    start: usize,
    len: usize,
    epoch_ptr: &'a AtomicU64,
    epoch_at_creation: u64,
}

// SAFETY: the guard only exposes read-only bytes; the held read lock keeps
// the mapping pinned for its lifetime, and the epoch check below rejects
// any pointer left dangling by a concurrent remap.
unsafe impl Send for RecordSliceGuard<'_> {}
// SAFETY: see above; shared immutable access to stable mapped memory is
// sound across threads.
unsafe impl Sync for RecordSliceGuard<'_> {}

impl RecordSliceGuard<'_> {
    /// Returns the guarded bytes as a slice.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the backing file was resized since
    /// this guard was created.
    pub fn as_slice(&self) -> Result<&[u8]> {
        if self.epoch_ptr.load(Ordering::Acquire) != self.epoch_at_creation {
            return Err(Error::internal("mapping was resized; guard is stale"));
        }
        // SAFETY: bounds were validated in `FileStore::read_guard`, and the
        // epoch check above confirms the mapping has not moved since.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.add(self.start), self.len) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("data"), true, 64, false).unwrap();
        store.write_at(RecordOffset(0), b"hello world").unwrap();
        let bytes = store.read_at(RecordOffset(0), 11).unwrap();
        assert_eq!(&bytes, b"hello world");
    }

    #[test]
    fn write_past_end_grows_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("data"), true, 16, false).unwrap();
        store.write_at(RecordOffset(1000), b"grown").unwrap();
        assert!(store.len() >= 1005);
        let bytes = store.read_at(RecordOffset(1000), 5).unwrap();
        assert_eq!(&bytes, b"grown");
    }

    #[test]
    fn read_guard_detects_resize() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("data"), true, 16, false).unwrap();
        store.write_at(RecordOffset(0), b"stable").unwrap();
        let guard = store.read_guard(RecordOffset(0), 6).unwrap();
        store.write_at(RecordOffset(100_000), b"x").unwrap();
        assert!(guard.as_slice().is_err());
    }

    #[test]
    fn truncate_shrinks_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("data"), true, 4096, false).unwrap();
        store.truncate(64).unwrap();
        assert_eq!(store.len(), 64);
    }
}
