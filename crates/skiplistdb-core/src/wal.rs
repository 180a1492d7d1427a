//! Write-ahead log and transactions.
//!
//! At most one transaction may be outstanding per handle at a time (spec:
//! "single-outstanding-transaction-per-handle"). A `Txn` is a scoped guard:
//! every pointer patch it makes is recorded so `abort` can undo them in
//! reverse order and truncate away anything appended, and `Drop` aborts
//! automatically if the caller never explicitly committed or aborted.

use crate::error::{Error, Result};
use crate::file_io::FileStore;
use crate::header::FormatVersion;
use crate::location::{self, Location};
use crate::offset::RecordOffset;
use crate::record::{self, Record, RecordKind};
use crate::skiplist::{self, StoreSource};
use rand::Rng;
use tracing::{debug, warn};

/// One predecessor pointer patch, recorded so abort can put it back.
struct UndoEntry {
    pred_offset: RecordOffset,
    level: u8,
    previous_target: RecordOffset,
}

/// A single outstanding transaction against one store handle.
pub struct Txn<'a> {
    store: &'a FileStore,
    version: FormatVersion,
    dummy_offset: RecordOffset,
    /// Append cursor at the moment the transaction began; on abort the
    /// file is truncated back to this, discarding every record the
    /// transaction wrote.
    start_cursor: RecordOffset,
    /// Current append cursor; every write advances it.
    cursor: RecordOffset,
    undo_log: Vec<UndoEntry>,
    done: bool,
}

impl<'a> Txn<'a> {
    /// Begins a transaction with the append cursor starting at `cursor`
    /// (the handle's current WAL end-of-data position).
    #[must_use]
    pub fn begin(store: &'a FileStore, version: FormatVersion, dummy_offset: RecordOffset, cursor: RecordOffset) -> Self {
        Txn {
            store,
            version,
            dummy_offset,
            start_cursor: cursor,
            cursor,
            undo_log: Vec::new(),
            done: false,
        }
    }

    fn source(&self) -> StoreSource<'a> {
        StoreSource { store: self.store, version: self.version }
    }

    fn locate(&self, key: &[u8]) -> Result<Location> {
        location::search(&self.source(), self.dummy_offset, key)
    }

    fn record_undo(&mut self, loc: &Location, up_to_level: u8) {
        for l in 0..=usize::from(up_to_level) {
            self.undo_log.push(UndoEntry {
                pred_offset: loc.back_pointers[l],
                level: l as u8,
                previous_target: loc.forward_pointers[l],
            });
        }
    }

    /// Creates a new key. Fails with `Error::Exists` if the key is already
    /// present.
    ///
    /// # Errors
    ///
    /// Returns `Error::Exists` on duplicate key, `Error::BadParam` on an
    /// empty key, or any I/O/codec error from the underlying writes.
    pub fn create(&mut self, rng: &mut impl Rng, max_level: u8, key: &[u8], value: Vec<u8>) -> Result<RecordOffset> {
        if key.is_empty() {
            return Err(Error::bad_param("key must not be empty"));
        }
        let loc = self.locate(key)?;
        if loc.exact_match {
            return Err(Error::Exists);
        }
        let level = skiplist::draw_height(rng, max_level);
        self.record_undo(&loc, level);
        let at = self.cursor;
        let written = skiplist::insert(self.store, self.version, &loc, level, at, key, value, false)?;
        self.cursor = RecordOffset(at.get() + written as u64);
        Ok(at)
    }

    /// Stores a value for `key`, inserting if new or replacing if present.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadParam` on an empty key, or any I/O/codec error.
    pub fn store(&mut self, rng: &mut impl Rng, max_level: u8, key: &[u8], value: Vec<u8>) -> Result<RecordOffset> {
        if key.is_empty() {
            return Err(Error::bad_param("key must not be empty"));
        }
        let loc = self.locate(key)?;
        let at = self.cursor;
        if loc.exact_match {
            let old_offset = loc.match_offset.expect("exact_match implies match_offset");
            let (old_record, _) = skiplist::read_record_at(self.store, self.version, old_offset)?;
            self.record_undo(&loc, old_record.level());
            let written = skiplist::replace(self.store, self.version, &loc, old_offset, at, key, value, false)?;
            self.cursor = RecordOffset(at.get() + written as u64);
        } else {
            let level = skiplist::draw_height(rng, max_level);
            self.record_undo(&loc, level);
            let written = skiplist::insert(self.store, self.version, &loc, level, at, key, value, false)?;
            self.cursor = RecordOffset(at.get() + written as u64);
        }
        Ok(at)
    }

    /// Deletes `key`. Fails with `Error::NotFound` if absent, unless `force`
    /// is set, in which case a missing key is a no-op.
    ///
    /// Appends a Delete tombstone to the log before unstitching, mirroring
    /// `create`/`store`'s append-then-stitch order: recovery must find
    /// physical bytes representing this delete so an uncommitted one can be
    /// discarded by truncation rather than having already taken permanent
    /// effect in place.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the key doesn't exist and `force` is
    /// false, or any I/O/codec error.
    pub fn delete(&mut self, key: &[u8], force: bool) -> Result<()> {
        let loc = self.locate(key)?;
        if !loc.exact_match {
            return if force { Ok(()) } else { Err(Error::NotFound) };
        }
        let old_offset = loc.match_offset.expect("exact_match implies match_offset");
        let (old_record, _) = skiplist::read_record_at(self.store, self.version, old_offset)?;
        self.record_undo(&loc, old_record.level());

        let at = self.cursor;
        let tombstone = Record::delete(key);
        let bytes = record::encode(&tombstone, self.version);
        self.store.write_at(at, &bytes)?;
        self.cursor = RecordOffset(at.get() + bytes.len() as u64);

        skiplist::delete(self.store, self.version, &loc, old_offset)?;
        Ok(())
    }

    /// Whether `at` is currently a valid point to append a record and have
    /// a crash-recovery scan stop cleanly: for the current format, a
    /// multiple of the record alignment that is either the commit marker
    /// itself or immediately precedes one; for legacy, the tail must
    /// decode as a complete, type-consistent record. In practice this
    /// module only ever appends at its own tracked cursor, so this check
    /// exists for `recovery`'s benefit (verifying a log tail before
    /// treating it as replayable) rather than for `Txn` itself.
    #[must_use]
    pub fn cursor(&self) -> RecordOffset {
        self.cursor
    }

    /// Commits: fsync the data just written, append a commit marker,
    /// fsync again, then release nothing itself (the caller's handle owns
    /// the lock and decides whether a checkpoint threshold was crossed).
    ///
    /// # Errors
    ///
    /// Returns any I/O error from the two fsyncs or the marker write.
    pub fn commit(mut self) -> Result<RecordOffset> {
        self.store.sync()?;
        let marker_offset = self.cursor;
        let commit_record = Record::commit();
        let bytes = record::encode(&commit_record, self.version);
        self.store.write_at(marker_offset, &bytes)?;
        self.cursor = RecordOffset(marker_offset.get() + bytes.len() as u64);
        self.store.sync()?;
        self.done = true;
        debug!(marker = marker_offset.get(), "transaction committed");
        Ok(marker_offset)
    }

    /// Aborts: undoes every pointer patch in reverse order, then truncates
    /// the file back to the cursor the transaction started at. Falls back
    /// to requesting a full recovery scan if the undo itself fails midway
    /// (spec: "fall back to full recovery on any undo failure").
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` wrapping the original failure if undo
    /// could not complete; the caller must then run full recovery before
    /// trusting the file again.
    pub fn abort(mut self) -> Result<()> {
        self.do_abort()
    }

    fn do_abort(&mut self) -> Result<()> {
        while let Some(entry) = self.undo_log.pop() {
            let outcome = skiplist::read_record_at(self.store, self.version, entry.pred_offset)
                .and_then(|(mut pred, _)| {
                    pred.forward[usize::from(entry.level)] = entry.previous_target;
                    let bytes = record::encode(&pred, self.version);
                    self.store.write_at(entry.pred_offset, &bytes)
                });
            if let Err(err) = outcome {
                warn!(%err, "transaction undo failed, full recovery required");
                return Err(Error::internal(format!(
                    "abort undo failed, recovery required: {err}"
                )));
            }
        }
        self.store.truncate(self.start_cursor.get())?;
        self.done = true;
        Ok(())
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(err) = self.do_abort() {
                warn!(%err, "transaction abort-on-drop failed");
            }
        }
    }
}

/// Whether `kind` is one this module ever appends mid-transaction (used by
/// `recovery` to recognize where a replayable log tail may legally end).
#[must_use]
pub fn is_commit_marker(kind: RecordKind) -> bool {
    matches!(kind, RecordKind::Commit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::FileHeader;

    fn new_store_with_dummy() -> (tempfile::TempDir, FileStore, RecordOffset, RecordOffset) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store.db"), true, 4096, false).unwrap();
        let version = FormatVersion::Current;
        let header = FileHeader::new(version, 0);
        store.write_at(RecordOffset(0), &header.encode()).unwrap();
        let dummy_offset = header.dummy_offset();
        let dummy_bytes = record::encode(&Record::dummy(header.max_level), version);
        store.write_at(dummy_offset, &dummy_bytes).unwrap();
        let cursor = RecordOffset(dummy_offset.get() + dummy_bytes.len() as u64);
        (dir, store, dummy_offset, cursor)
    }

    #[test]
    fn commit_persists_and_abort_undoes() {
        let (_dir, store, dummy_offset, cursor) = new_store_with_dummy();
        let version = FormatVersion::Current;
        let mut rng = rand::thread_rng();

        let mut txn = Txn::begin(&store, version, dummy_offset, cursor);
        txn.create(&mut rng, 4, b"a", b"1".to_vec()).unwrap();
        txn.commit().unwrap();

        let source = StoreSource { store: &store, version };
        let found = location::search(&source, dummy_offset, b"a").unwrap();
        assert!(found.exact_match);

        let cursor_after_commit = {
            let (_, consumed) = skiplist::read_record_at(&store, version, found.match_offset.unwrap()).unwrap();
            RecordOffset(found.match_offset.unwrap().get() + consumed as u64)
        };

        let mut txn2 = Txn::begin(&store, version, dummy_offset, cursor_after_commit);
        txn2.create(&mut rng, 4, b"b", b"2".to_vec()).unwrap();
        txn2.abort().unwrap();

        let after_abort = location::search(&source, dummy_offset, b"b").unwrap();
        assert!(!after_abort.exact_match);
        // "a" must still be there; the abort must not have touched it.
        let a_still_there = location::search(&source, dummy_offset, b"a").unwrap();
        assert!(a_still_there.exact_match);
    }

    #[test]
    fn duplicate_create_fails() {
        let (_dir, store, dummy_offset, cursor) = new_store_with_dummy();
        let version = FormatVersion::Current;
        let mut rng = rand::thread_rng();

        let mut txn = Txn::begin(&store, version, dummy_offset, cursor);
        txn.create(&mut rng, 4, b"a", b"1".to_vec()).unwrap();
        let err = txn.create(&mut rng, 4, b"a", b"2".to_vec()).unwrap_err();
        assert!(matches!(err, Error::Exists));
        txn.abort().unwrap();
    }

    #[test]
    fn drop_without_commit_aborts() {
        let (_dir, store, dummy_offset, cursor) = new_store_with_dummy();
        let version = FormatVersion::Current;
        let mut rng = rand::thread_rng();
        {
            let mut txn = Txn::begin(&store, version, dummy_offset, cursor);
            txn.create(&mut rng, 4, b"x", b"1".to_vec()).unwrap();
        }
        let source = StoreSource { store: &store, version };
        let found = location::search(&source, dummy_offset, b"x").unwrap();
        assert!(!found.exact_match);
    }

    #[test]
    fn delete_missing_key_fails() {
        let (_dir, store, dummy_offset, cursor) = new_store_with_dummy();
        let version = FormatVersion::Current;
        let mut txn = Txn::begin(&store, version, dummy_offset, cursor);
        let err = txn.delete(b"missing", false).unwrap_err();
        assert!(matches!(err, Error::NotFound));
        txn.abort().unwrap();
    }
}
