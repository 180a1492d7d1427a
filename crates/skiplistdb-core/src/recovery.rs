//! Crash recovery.
//!
//! Normal operation patches a new record's predecessors in place as soon
//! as it's stitched in (see `skiplist`), for speed — but that means a
//! crash mid-stitch can leave some predecessor pointers updated and others
//! not. Recovery trusts no forward pointer anywhere in the file, in either
//! region:
//!
//! - Phase A rebuilds the in-order region (DUMMY up to `log_start`, written
//!   by the last checkpoint or by initialization) in place: every record
//!   there is read back by sequential file offset, not by following its
//!   own forward pointers, since those are exactly what might be
//!   corrupted; each is zeroed and rewritten, then stitched onto an
//!   incrementally maintained `Location` the same way `checkpoint` stitches
//!   its destination.
//! - Phase B replays every Add/Delete/Commit record at or after
//!   `log_start` (the WAL region), re-running the same search-then-stitch
//!   sequence a live transaction would have run.
//!
//! A non-commit-boundary tail — a record that fails to decode, or any
//! Add/Delete after the last Commit marker — is simply truncated away:
//! whatever it represented was never acknowledged to a caller.

use crate::error::{Error, Result};
use crate::file_io::FileStore;
use crate::header::{FileHeader, FormatVersion};
use crate::location::{self, RecordSource};
use crate::offset::RecordOffset;
use crate::record::{self, Record, RecordKind};
use crate::skiplist::StoreSource;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Phase A: rebuilds the in-order region (DUMMY up to `log_start`) in
/// place, trusting none of its on-disk forward pointers. Records there are
/// read back by sequential file offset rather than by following forward
/// pointers, since the region was written in strict key order by the last
/// checkpoint (or by initialization) and walking by offset is exactly
/// walking by key. Each record is zeroed and rewritten, then stitched onto
/// `back_pointers`, a `Location`-shaped set of predecessors maintained
/// incrementally level by level — the same technique `checkpoint::run`
/// uses for its destination store. Because records are visited in the
/// order they'll end up linked in, every predecessor a given record needs
/// has already been rewritten by the time it's reached, so the whole pass
/// is O(n) with no lookups.
///
/// # Errors
///
/// Propagates any I/O error, or a decode error if a record in the region
/// is corrupt in a way unrelated to its pointers (bad CRC, truncation).
fn rebuild_in_order_region(store: &FileStore, version: FormatVersion, dummy_offset: RecordOffset, log_start: RecordOffset) -> Result<()> {
    let dummy_slice = store.read_at(dummy_offset, (log_start.get() - dummy_offset.get()) as usize)?;
    let (dummy, dummy_len) = record::decode(&dummy_slice, version)?;
    let max_level = dummy.level();

    let mut zeroed_dummy = dummy;
    zeroed_dummy.forward = vec![RecordOffset::NULL; usize::from(max_level) + 1];
    store.write_at(dummy_offset, &record::encode(&zeroed_dummy, version))?;

    let mut back_pointers = vec![dummy_offset; usize::from(max_level) + 1];
    let mut pos = RecordOffset(dummy_offset.get() + dummy_len as u64);

    while pos.get() < log_start.get() {
        let remaining = (log_start.get() - pos.get()) as usize;
        let slice = store.read_at(pos, remaining)?;
        let (mut record, len) = record::decode(&slice, version)?;
        let level = record.level();

        record.forward = vec![RecordOffset::NULL; usize::from(level) + 1];
        store.write_at(pos, &record::encode(&record, version))?;

        for l in 0..=usize::from(level) {
            let pred_offset = back_pointers[l];
            let (mut pred, _) = crate::skiplist::read_record_at(store, version, pred_offset)?;
            pred.forward[l] = pos;
            store.write_at(pred_offset, &record::encode(&pred, version))?;
            back_pointers[l] = pos;
        }

        pos = RecordOffset(pos.get() + len as u64);
    }
    Ok(())
}

/// Re-stitches an Add/InOrder record found during WAL replay: searches
/// fresh for its key, rewrites its own forward pointers from the search
/// result (never trusting what was on disk), then patches every
/// predecessor up to its level, bottom-up.
fn replay_add(store: &FileStore, version: FormatVersion, dummy_offset: RecordOffset, at: RecordOffset, original: &Record) -> Result<()> {
    let source = StoreSource { store, version };
    let loc = location::search(&source, dummy_offset, &original.key)?;
    let level = original.level();

    let mut rewritten = original.clone();
    rewritten.kind = RecordKind::Add;
    rewritten.forward = loc.forward_pointers[0..=usize::from(level)].to_vec();
    let bytes = record::encode(&rewritten, version);
    store.write_at(at, &bytes)?;

    for l in 0..=usize::from(level) {
        let pred_offset = loc.back_pointers[l];
        let (mut pred, _) = crate::skiplist::read_record_at(store, version, pred_offset)?;
        pred.forward[l] = at;
        let pred_bytes = record::encode(&pred, version);
        store.write_at(pred_offset, &pred_bytes)?;
    }
    Ok(())
}

/// Re-applies a Delete record found during WAL replay: searches fresh for
/// the key it names and unstitches whatever record currently matches,
/// top-down from that record's own level. The tombstone itself is never
/// re-appended here — its bytes are already on disk as the very record
/// being scanned at `pos`; only the unstitch needs re-deriving.
fn replay_delete(store: &FileStore, version: FormatVersion, dummy_offset: RecordOffset, delete_record: &Record) -> Result<()> {
    let source = StoreSource { store, version };
    let loc = location::search(&source, dummy_offset, &delete_record.key)?;
    let Some(old_offset) = loc.match_offset else {
        // Already gone (e.g. replayed twice); nothing to do. Recovery must
        // be idempotent, so this is not an error.
        return Ok(());
    };
    crate::skiplist::delete(store, version, &loc, old_offset)
}

/// Runs full recovery and returns the repaired, rewritten header.
///
/// # Errors
///
/// Returns `Error::Internal` if the in-order region is corrupt in a way
/// that cannot be attributed to an incomplete WAL tail, or any I/O error
/// along the way.
pub fn recover(store: &FileStore, version: FormatVersion, mut header: FileHeader) -> Result<FileHeader> {
    let dummy_offset = header.dummy_offset();
    rebuild_in_order_region(store, version, dummy_offset, header.log_start)?;

    // First pass: decode only, to find where the last commit marker ends.
    // Nothing is replayed here — an uncommitted Add/Delete must never touch
    // a live predecessor's pointers, since those bytes are about to be
    // truncated away and any record re-stitched against them would dangle.
    let last_commit_end = last_commit_boundary(store, version, header.log_start)?;

    if last_commit_end.get() < store.len() {
        info!(
            truncate_to = last_commit_end.get(),
            was = store.len(),
            "discarding uncommitted WAL tail"
        );
        store.truncate(last_commit_end.get())?;
    }

    // Second pass: replay every Add/Delete strictly within the now-
    // guaranteed-committed region, re-deriving each stitch fresh rather
    // than trusting whatever pointers are already on disk.
    let mut pos = header.log_start;
    let mut max_level_seen = 0u8;
    while pos.get() < last_commit_end.get() {
        let remaining = (last_commit_end.get() - pos.get()) as usize;
        let slice_owned = store.read_at(pos, remaining)?;
        let (rec, len) = record::decode(&slice_owned, version)?;

        match rec.kind {
            RecordKind::Commit => {}
            RecordKind::Add | RecordKind::InOrder => {
                replay_add(store, version, dummy_offset, pos, &rec)?;
                max_level_seen = max_level_seen.max(rec.level());
            }
            RecordKind::Delete => {
                replay_delete(store, version, dummy_offset, &rec)?;
            }
            RecordKind::Dummy => {
                return Err(Error::internal("unexpected DUMMY record inside WAL region"));
            }
        }
        pos = RecordOffset(pos.get() + len as u64);
    }

    header.cur_level = header.cur_level.max(max_level_seen);
    header.last_recovery_timestamp = now_unix();
    let header_bytes = header.encode();
    store.write_at(RecordOffset(0), &header_bytes)?;
    store.sync()?;
    Ok(header)
}

/// Scans forward from `start` decoding records without replaying any of
/// them, returning the offset just past the last Commit marker found. A
/// record that fails to decode ends the scan at whatever commit boundary
/// was last seen, exactly as an intentionally truncated crash tail would.
fn last_commit_boundary(store: &FileStore, version: FormatVersion, start: RecordOffset) -> Result<RecordOffset> {
    let mut pos = start;
    let mut last_commit_end = start;
    loop {
        let file_len = store.len();
        if pos.get() >= file_len {
            break;
        }
        let remaining = (file_len - pos.get()) as usize;
        let slice_owned = store.read_at(pos, remaining)?;
        let (rec, len) = match record::decode(&slice_owned, version) {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, offset = pos.get(), "WAL tail failed to decode, truncating");
                break;
            }
        };
        if matches!(rec.kind, RecordKind::Commit) {
            last_commit_end = RecordOffset(pos.get() + len as u64);
        }
        pos = RecordOffset(pos.get() + len as u64);
    }
    Ok(last_commit_end)
}

/// Whether recovery should run: a forced request, a stale
/// `last_recovery_timestamp` relative to the sibling stamp file (meaning
/// another process booted since this file was last recovered), or a
/// `log_start` that isn't immediately followed by a clean decode run
/// ending on a commit boundary.
#[must_use]
pub fn should_recover(forced: bool, header_timestamp: u64, stamp_timestamp: u64) -> bool {
    forced || header_timestamp < stamp_timestamp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::Txn;

    fn new_store() -> (tempfile::TempDir, FileStore, FileHeader) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store.db"), true, 4096, false).unwrap();
        let version = FormatVersion::Current;
        let header = FileHeader::new(version, 0);
        store.write_at(RecordOffset(0), &header.encode()).unwrap();
        let dummy_bytes = record::encode(&Record::dummy(header.max_level), version);
        store.write_at(header.dummy_offset(), &dummy_bytes).unwrap();
        (dir, store, header)
    }

    #[test]
    fn recovery_truncates_uncommitted_tail() {
        let (_dir, store, header) = new_store();
        let version = FormatVersion::Current;
        let dummy_offset = header.dummy_offset();
        let dummy_len = record::encode(&Record::dummy(header.max_level), version).len();
        let cursor = RecordOffset(dummy_offset.get() + dummy_len as u64);

        let mut rng = rand::thread_rng();
        let mut txn = Txn::begin(&store, version, dummy_offset, cursor);
        txn.create(&mut rng, header.max_level, b"a", b"1".to_vec()).unwrap();
        let committed_at = txn.commit().unwrap();
        let after_commit_len = store.len();

        // Simulate a half-written second transaction: append a record with
        // no following commit marker.
        let mut txn2 = Txn::begin(&store, version, dummy_offset, RecordOffset(after_commit_len));
        txn2.create(&mut rng, header.max_level, b"b", b"2".to_vec()).unwrap();
        // Deliberately forget to commit or let it Drop-abort: leak it by
        // mem::forget so the bytes stay on disk uncommitted.
        std::mem::forget(txn2);

        let mut header = header;
        header.log_start = RecordOffset(dummy_offset.get() + dummy_len as u64);
        let recovered = recover(&store, version, header).unwrap();

        let source = StoreSource { store: &store, version };
        let found_a = location::search(&source, dummy_offset, b"a").unwrap();
        assert!(found_a.exact_match);
        let found_b = location::search(&source, dummy_offset, b"b").unwrap();
        assert!(!found_b.exact_match);
        assert!(recovered.last_recovery_timestamp > 0);
        let _ = committed_at;
    }

    #[test]
    fn recovery_rebuilds_corrupted_in_order_pointers() {
        // Produces an in-order region via a real checkpoint, then corrupts
        // one record's forward pointer directly (simulating a crash
        // mid-stitch from a *previous* life of the file, before this
        // checkpoint's own crash-safety applied). Phase A must not trust
        // that pointer: it rebuilds every forward pointer in the region
        // from scratch by walking file offsets in order.
        let (_dir, store, header) = new_store();
        let version = FormatVersion::Current;
        let dummy_offset = header.dummy_offset();
        let dummy_len = record::encode(&Record::dummy(header.max_level), version).len();
        let cursor = RecordOffset(dummy_offset.get() + dummy_len as u64);

        let mut rng = rand::thread_rng();
        let mut txn = Txn::begin(&store, version, dummy_offset, cursor);
        for (k, v) in [(b"a".as_slice(), b"1".as_slice()), (b"b", b"2"), (b"c", b"3")] {
            txn.create(&mut rng, header.max_level, k, v.to_vec()).unwrap();
        }
        txn.commit().unwrap();

        let mut header = header;
        header.log_start = RecordOffset(dummy_offset.get() + dummy_len as u64);
        let after_checkpoint = crate::checkpoint::run(&store, version, &header).unwrap();

        // Corrupt "a"'s forward[0] pointer in place, leaving its key/value
        // bytes untouched.
        let source = StoreSource { store: &store, version };
        let loc = location::search(&source, after_checkpoint.dummy_offset(), b"a").unwrap();
        let a_offset = loc.match_offset.unwrap();
        let (mut a_record, _) = crate::skiplist::read_record_at(&store, version, a_offset).unwrap();
        a_record.forward[0] = RecordOffset(999_999);
        store.write_at(a_offset, &record::encode(&a_record, version)).unwrap();

        let recovered = recover(&store, version, after_checkpoint).unwrap();

        let source = StoreSource { store: &store, version };
        for key in [b"a".as_slice(), b"b", b"c"] {
            let found = location::search(&source, recovered.dummy_offset(), key).unwrap();
            assert!(found.exact_match, "key {key:?} missing after rebuilding corrupted pointers");
        }
    }

    #[test]
    fn recovery_is_idempotent() {
        let (_dir, store, header) = new_store();
        let version = FormatVersion::Current;
        let dummy_offset = header.dummy_offset();
        let dummy_len = record::encode(&Record::dummy(header.max_level), version).len();
        let cursor = RecordOffset(dummy_offset.get() + dummy_len as u64);

        let mut rng = rand::thread_rng();
        let mut txn = Txn::begin(&store, version, dummy_offset, cursor);
        txn.create(&mut rng, header.max_level, b"k", b"v".to_vec()).unwrap();
        txn.commit().unwrap();

        let mut header = header;
        header.log_start = RecordOffset(dummy_offset.get() + dummy_len as u64);
        let once = recover(&store, version, header).unwrap();
        let twice = recover(&store, version, once).unwrap();

        let source = StoreSource { store: &store, version };
        let found = location::search(&source, dummy_offset, b"k").unwrap();
        assert!(found.exact_match);
        assert_eq!(once.cur_level, twice.cur_level);
        assert_eq!(once.num_records, twice.num_records);
    }
}
