//! The external interface: `Database`, the facade a host actually talks to.
//!
//! Ties together the registry (shared handles across opens of the same
//! path), the lock manager (cross-process coordination), the skip-list
//! stitch algorithms, the WAL/`Txn` type, recovery, and checkpoint, into
//! `open`/`close`/`fetch`/`fetch_next`/`foreach`/`store`/`create`/`delete`/
//! `begin`/`commit`/`abort`.

use crate::checkpoint;
use crate::error::{Error, Result};
use crate::file_io::FileStore;
use crate::header::{self, FileHeader, FormatVersion};
use crate::lock::{LockManager, LockMode};
use crate::location::{self, RecordSource};
use crate::offset::RecordOffset;
use crate::options::{OpenFlags, StoreOptions};
use crate::record::{self, Record};
use crate::registry::{SharedStore, StoreFactory};
use crate::skiplist::{self, StoreSource};
use crate::wal;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

struct DbState {
    header: FileHeader,
    /// Logical end-of-data append cursor. The backing file's physical
    /// length may exceed this (see `FileStore::ensure_capacity`), so this is
    /// tracked here rather than derived from `FileStore::len`.
    cursor: RecordOffset,
}

/// An open store handle.
///
/// Two `Database`s opened against the same canonical path through the same
/// [`StoreFactory`] share the underlying file and lock; each still enforces
/// its own single-outstanding-transaction rule.
pub struct Database {
    path: PathBuf,
    factory: StoreFactory,
    shared: Arc<SharedStore>,
    version: FormatVersion,
    options: StoreOptions,
    state: Mutex<DbState>,
    in_txn: AtomicBool,
}

impl Database {
    /// Opens (or creates, with `OpenFlags::CREATE`) the store at `path`,
    /// running crash recovery unconditionally (recovery is idempotent and
    /// cheap on an already-clean file; see `recovery::recovery_is_idempotent`).
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the file doesn't exist and `CREATE`
    /// wasn't passed, or any I/O/codec error encountered opening or
    /// recovering the file.
    pub fn open(
        factory: &StoreFactory,
        path: impl AsRef<Path>,
        flags: OpenFlags,
        options: StoreOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        checkpoint::recover_stray_new(&path)?;

        // A brand-new file is created in `options.create_version`; an
        // existing file's actual version (possibly legacy) is read back from
        // its own header below rather than assumed.
        let create_version = options.create_version;
        let header_flags = flags.to_header_flags();
        let create = flags.contains(OpenFlags::CREATE);
        let initial_size = options.initial_size;
        let unsafe_no_fsync = options.unsafe_no_fsync;

        let shared = factory.acquire(path.clone(), |p| {
            let store = FileStore::open(p, create, initial_size, unsafe_no_fsync)?;
            let lock = LockManager::open(p)?;
            Ok(SharedStore { store, lock: Mutex::new(lock) })
        })?;

        let mut lock = shared.lock.lock();
        lock.lock(LockMode::Exclusive)?;
        let result = Self::open_locked(&shared, create_version, header_flags, create);
        lock.unlock()?;
        let (version, header, cursor) = result?;
        drop(lock);

        Ok(Database {
            path,
            factory: factory.clone(),
            shared,
            version,
            options,
            state: Mutex::new(DbState { header, cursor }),
            in_txn: AtomicBool::new(false),
        })
    }

    fn open_locked(
        shared: &Arc<SharedStore>,
        create_version: FormatVersion,
        header_flags: u32,
        create: bool,
    ) -> Result<(FormatVersion, FileHeader, RecordOffset)> {
        let magic_probe = shared.store.read_at(RecordOffset(0), header::MAGIC.len())?;
        let is_fresh = magic_probe.as_slice() != header::MAGIC.as_slice();

        if is_fresh {
            if !create {
                return Err(Error::NotFound);
            }
            let header = FileHeader::new(create_version, header_flags);
            shared.store.write_at(RecordOffset(0), &header.encode())?;
            let dummy = Record::dummy(header.max_level);
            let dummy_offset = header.dummy_offset();
            let dummy_bytes = record::encode(&dummy, create_version);
            shared.store.write_at(dummy_offset, &dummy_bytes)?;
            shared.store.sync()?;
            let cursor = RecordOffset(dummy_offset.get() + dummy_bytes.len() as u64);
            Ok((create_version, header, cursor))
        } else {
            // Read the larger of the two header sizes up front: the actual
            // version (and therefore the real header length) isn't known
            // until `FileHeader::decode` inspects the version byte.
            let probe_len = header::HEADER_SIZE_V1.max(header::HEADER_SIZE_V2);
            let header_bytes = shared.store.read_at(RecordOffset(0), probe_len)?;
            let header = FileHeader::decode(&header_bytes)?;
            let version = header.version;
            let recovered = crate::recovery::recover(&shared.store, version, header)?;
            let cursor = RecordOffset(shared.store.len());
            Ok((version, recovered, cursor))
        }
    }

    /// Closes this handle, releasing the factory's reference to the
    /// underlying shared store. If this was the last open handle for the
    /// path, the in-process registry entry is dropped (the file itself is
    /// left on disk, obviously).
    ///
    /// # Errors
    ///
    /// Returns any error from releasing the registry entry.
    pub fn close(self) -> Result<()> {
        self.factory.release(self.path.clone())
    }

    fn dummy_offset(&self) -> RecordOffset {
        self.state.lock().header.dummy_offset()
    }

    /// Point lookup. Returns `None` if `key` has no live entry.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadParam` on an empty key, or any I/O/codec error.
    pub fn fetch(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return Err(Error::bad_param("key must not be empty"));
        }
        let mut lock = self.shared.lock.lock();
        lock.lock(LockMode::Shared)?;
        let result = self.fetch_unlocked(key);
        lock.unlock()?;
        result
    }

    fn fetch_unlocked(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let source = StoreSource { store: &self.shared.store, version: self.version };
        let loc = location::search(&source, self.dummy_offset(), key)?;
        match loc.match_offset {
            Some(offset) => {
                let (record, _) = skiplist::read_record_at(&self.shared.store, self.version, offset)?;
                Ok(record.value)
            }
            None => Ok(None),
        }
    }

    /// Finds the first live key greater than or equal to `key` (or the very
    /// first live key, if `key` is `None`), for forward iteration. Inclusive
    /// of an exact match: `fetch_next(Some(k))` where `k` is itself live
    /// returns `k`, not the entry after it.
    ///
    /// # Errors
    ///
    /// Returns any I/O/codec error.
    pub fn fetch_next(&self, key: Option<&[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut lock = self.shared.lock.lock();
        lock.lock(LockMode::Shared)?;
        let result = self.fetch_next_unlocked(key);
        lock.unlock()?;
        result
    }

    fn fetch_next_unlocked(&self, key: Option<&[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let source = StoreSource { store: &self.shared.store, version: self.version };
        let dummy_offset = self.dummy_offset();
        let next_offset = match key {
            None => source.get(dummy_offset)?.forward.first().copied().unwrap_or(RecordOffset::NULL),
            Some(k) => {
                let loc = location::search(&source, dummy_offset, k)?;
                if loc.exact_match {
                    loc.match_offset.expect("exact_match implies match_offset")
                } else {
                    loc.forward_pointers.first().copied().unwrap_or(RecordOffset::NULL)
                }
            }
        };
        self.read_entry_at(&source, next_offset)
    }

    /// Finds the first live key strictly greater than `key`. Used by
    /// `foreach` to step past the entry it just visited — unlike
    /// `fetch_next`, an exact match on `key` itself is skipped rather than
    /// returned, or `foreach` would never advance past a live key.
    fn advance_past(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut lock = self.shared.lock.lock();
        lock.lock(LockMode::Shared)?;
        let result = (|| {
            let source = StoreSource { store: &self.shared.store, version: self.version };
            let loc = location::search(&source, self.dummy_offset(), key)?;
            let next_offset = if loc.exact_match {
                let matched = source.get(loc.match_offset.expect("exact_match implies match_offset"))?;
                matched.forward.first().copied().unwrap_or(RecordOffset::NULL)
            } else {
                loc.forward_pointers.first().copied().unwrap_or(RecordOffset::NULL)
            };
            self.read_entry_at(&source, next_offset)
        })();
        lock.unlock()?;
        result
    }

    fn read_entry_at(&self, source: &StoreSource<'_>, offset: RecordOffset) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if offset.is_null() {
            return Ok(None);
        }
        let record = source.get(offset)?;
        Ok(Some((record.key, record.value.unwrap_or_default())))
    }

    /// Walks live entries in ascending key order starting at `start` (or
    /// from the beginning, if `None`), invoking `f(key, value)` for each.
    /// `f` returns `false` to stop early.
    ///
    /// The shared lock is held only while locating each entry, never while
    /// `f` runs — `f` is free to call `create`/`store`/`delete`/`begin` on
    /// this same handle. Because of that, a key deleted or inserted by `f`
    /// partway through may or may not be observed by later iterations;
    /// iteration always resumes from "the next key after the last one
    /// returned", re-searched fresh each time, never from a stale cursor.
    ///
    /// # Errors
    ///
    /// Propagates any error from `f` or from the underlying store.
    pub fn foreach(&self, start: Option<&[u8]>, mut f: impl FnMut(&[u8], &[u8]) -> Result<bool>) -> Result<()> {
        let mut next = self.fetch_next(start)?;
        while let Some((key, value)) = next {
            if !f(&key, &value)? {
                break;
            }
            next = self.advance_past(&key)?;
        }
        Ok(())
    }

    /// Creates `key` with `value` as a single autocommitted transaction.
    /// Fails with `Error::Exists` if `key` is already present.
    ///
    /// # Errors
    ///
    /// Returns `Error::Exists`, `Error::BadParam`, `Error::Locked` (another
    /// transaction on this handle is outstanding), or any I/O/codec error.
    pub fn create(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let mut txn = self.begin()?;
        txn.create(key, value)?;
        txn.commit()
    }

    /// Stores `value` for `key`, inserting if new or replacing if present,
    /// as a single autocommitted transaction.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadParam`, `Error::Locked`, or any I/O/codec error.
    pub fn store(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let mut txn = self.begin()?;
        txn.store(key, value)?;
        txn.commit()
    }

    /// Deletes `key` as a single autocommitted transaction. Fails with
    /// `Error::NotFound` if absent, unless `force` is set, in which case a
    /// missing key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound`, `Error::Locked`, or any I/O/codec error.
    pub fn delete(&self, key: &[u8], force: bool) -> Result<()> {
        let mut txn = self.begin()?;
        txn.delete(key, force)?;
        txn.commit()
    }

    /// Begins a transaction. Only one may be outstanding per `Database`
    /// handle at a time; a second concurrent call returns `Error::Locked`.
    /// Acquires the exclusive file-range lock for the duration of the
    /// transaction, so other handles (in this or another process) block
    /// until `commit`/`abort`/drop releases it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Locked` if a transaction is already outstanding on
    /// this handle, or any I/O error acquiring the lock.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        if self.in_txn.swap(true, Ordering::AcqRel) {
            return Err(Error::Locked);
        }
        let mut lock = self.shared.lock.lock();
        if let Err(err) = lock.lock(LockMode::Exclusive) {
            drop(lock);
            self.in_txn.store(false, Ordering::Release);
            return Err(err);
        }
        let (dummy_offset, cursor, max_level) = {
            let state = self.state.lock();
            (state.header.dummy_offset(), state.cursor, state.header.max_level)
        };
        let inner = wal::Txn::begin(&self.shared.store, self.version, dummy_offset, cursor);
        Ok(Transaction { db: self, inner: Some(inner), max_level, lock })
    }

    /// Manually runs a checkpoint now, regardless of the WAL-to-in-order
    /// size ratio that would otherwise trigger one automatically after a
    /// commit.
    ///
    /// # Errors
    ///
    /// Returns `Error::Locked` if a transaction is outstanding, or any
    /// I/O/codec error from the rewrite.
    pub fn checkpoint(&self) -> Result<()> {
        if self.in_txn.swap(true, Ordering::AcqRel) {
            return Err(Error::Locked);
        }
        let mut lock = self.shared.lock.lock();
        let result = lock.lock(LockMode::Exclusive).and_then(|()| self.run_checkpoint_locked());
        let _ = lock.unlock();
        self.in_txn.store(false, Ordering::Release);
        result
    }

    fn run_checkpoint_locked(&self) -> Result<()> {
        let mut state = self.state.lock();
        let new_header = checkpoint::run(&self.shared.store, self.version, &state.header)?;
        state.cursor = RecordOffset(self.shared.store.len());
        state.header = new_header;
        debug!(cursor = state.cursor.get(), "checkpoint finished");
        Ok(())
    }

    fn should_checkpoint(&self, new_cursor: RecordOffset) -> bool {
        let state = self.state.lock();
        let wal_size = new_cursor.get().saturating_sub(state.header.log_start.get());
        let in_order_size = state.header.log_start.get().max(1);
        (wal_size as f64) >= (in_order_size as f64) * self.options.checkpoint_threshold_multiplier
    }

    fn finish_txn(&self, new_cursor: RecordOffset) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.cursor = new_cursor;
            let header_bytes = state.header.encode();
            // Best-effort: num_records/cur_level drift until the next
            // checkpoint recomputes them exactly; they're advisory (see
            // `FileHeader::num_records`), so a failed write here isn't fatal
            // to correctness, only to this one diagnostic persisted early.
            let _ = self.shared.store.write_at(RecordOffset(0), &header_bytes);
        }
        if self.should_checkpoint(new_cursor) {
            self.run_checkpoint_locked()?;
        }
        Ok(())
    }
}

/// A single outstanding transaction against a [`Database`] handle. Created
/// by [`Database::begin`]; must be finished with [`Transaction::commit`] or
/// [`Transaction::abort`]. Dropping without either aborts automatically.
///
/// Holds the exclusive file-range lock for its entire lifetime (not just
/// while `begin`/`commit`/`abort` run): since the underlying advisory lock
/// doesn't block a second call from the same process/file descriptor, this
/// held `MutexGuard` is what actually keeps a concurrent `fetch`/`foreach`
/// on the same handle from observing a transaction mid-flight.
pub struct Transaction<'db> {
    db: &'db Database,
    inner: Option<wal::Txn<'db>>,
    max_level: u8,
    lock: parking_lot::MutexGuard<'db, LockManager>,
}

impl Transaction<'_> {
    fn inner_mut(&mut self) -> &mut wal::Txn<'_> {
        self.inner.as_mut().expect("transaction already finished")
    }

    /// Creates a new key within this transaction.
    ///
    /// # Errors
    ///
    /// Returns `Error::Exists`, `Error::BadParam`, or any I/O/codec error.
    pub fn create(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let max_level = self.max_level;
        let mut rng = rand::thread_rng();
        self.inner_mut().create(&mut rng, max_level, key, value)?;
        Ok(())
    }

    /// Stores a value for `key` within this transaction, inserting or
    /// replacing as appropriate.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadParam` or any I/O/codec error.
    pub fn store(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let max_level = self.max_level;
        let mut rng = rand::thread_rng();
        self.inner_mut().store(&mut rng, max_level, key, value)?;
        Ok(())
    }

    /// Deletes `key` within this transaction. Fails with `Error::NotFound`
    /// if absent, unless `force` is set, in which case a missing key is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` or any I/O/codec error.
    pub fn delete(&mut self, key: &[u8], force: bool) -> Result<()> {
        self.inner_mut().delete(key, force)
    }

    /// Commits the transaction: fsyncs, writes the commit marker, fsyncs
    /// again, runs a checkpoint if the WAL region has grown large enough
    /// relative to the in-order region, then releases the exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from the commit, or from a triggered
    /// checkpoint.
    pub fn commit(mut self) -> Result<()> {
        let inner = self.inner.take().expect("transaction already finished");
        let marker_offset = inner.commit()?;
        let commit_len = record::encode(&Record::commit(), self.db.version).len();
        let new_cursor = RecordOffset(marker_offset.get() + commit_len as u64);
        let result = self.db.finish_txn(new_cursor);
        self.finish();
        result
    }

    /// Aborts the transaction: undoes every pointer patch and truncates away
    /// everything it appended, then releases the exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the undo itself failed partway (the
    /// store then needs a full recovery pass before further use).
    pub fn abort(mut self) -> Result<()> {
        let inner = self.inner.take().expect("transaction already finished");
        let result = inner.abort();
        self.finish();
        result
    }

    /// Releases the exclusive lock and resets the handle's single-txn gate.
    /// Idempotent: the `Drop` impl calls this too, but only when `inner` was
    /// never taken (i.e. neither `commit` nor `abort` ran).
    fn finish(&mut self) {
        let _ = self.lock.unlock();
        self.db.in_txn.store(false, Ordering::Release);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            // `wal::Txn::drop` aborts automatically since `inner` was never
            // committed; its own `Drop` impl runs here.
            drop(inner);
            self.finish();
        }
    }
}
