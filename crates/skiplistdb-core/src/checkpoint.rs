//! Checkpoint / compaction: rewrite the live key set into a sibling
//! `.NEW` file in ascending key order, then atomically rename it over the
//! original. This both reclaims space consumed by superseded REPLACEs and
//! dead DELETEs, and shrinks the WAL region back to empty (`log_start`
//! moves to just past the freshly written in-order region).

use crate::consistency;
use crate::error::Result;
use crate::file_io::FileStore;
use crate::header::{FileHeader, FormatVersion};
use crate::location::RecordSource;
use crate::offset::RecordOffset;
use crate::record::{self, Record, RecordKind};
use crate::skiplist::StoreSource;
use std::path::{Path, PathBuf};
use tracing::info;

/// The sibling path a checkpoint rewrites into before the atomic rename.
#[must_use]
pub fn new_path(store_path: &Path) -> PathBuf {
    let mut os = store_path.as_os_str().to_owned();
    os.push(".NEW");
    PathBuf::from(os)
}

/// Rewrites every live record from `old_store` into a fresh file at
/// `new_path(old_store.path())`, then atomically renames it over the
/// original. Returns the rewritten header.
///
/// # Errors
///
/// Returns any I/O error from creating, writing, or renaming the new file,
/// or `Error::Internal` if the consistency check fails before rename.
pub fn run(old_store: &FileStore, version: FormatVersion, old_header: &FileHeader) -> Result<FileHeader> {
    let target = new_path(old_store.path());
    if target.exists() {
        std::fs::remove_file(&target)?;
    }
    let new_store = FileStore::open(&target, true, 64 * 1024, false)?;

    let mut header = FileHeader::new(version, old_header.flags);
    new_store.write_at(RecordOffset(0), &header.encode())?;
    let dummy_offset = header.dummy_offset();
    let max_level = header.max_level;
    let dummy = Record::dummy(max_level);
    new_store.write_at(dummy_offset, &record::encode(&dummy, version))?;

    let mut last_at_level = vec![dummy_offset; usize::from(max_level) + 1];
    let mut cursor = RecordOffset(dummy_offset.get() + record::encode(&dummy, version).len() as u64);
    let mut num_records = 0u64;
    let mut cur_level_seen = 0u8;

    let old_source = StoreSource { store: old_store, version };
    let old_dummy_offset = old_header.dummy_offset();
    let mut walk = old_source.get(old_dummy_offset)?.forward.first().copied().unwrap_or(RecordOffset::NULL);

    while !walk.is_null() {
        let live = old_source.get(walk)?;
        let level = live.level();
        cur_level_seen = cur_level_seen.max(level);

        let placeholder = Record {
            kind: RecordKind::Add,
            forward: vec![RecordOffset::NULL; usize::from(level) + 1],
            delete_pointer: None,
            key: live.key.clone(),
            value: live.value.clone(),
            compressed: live.compressed,
        };
        let at = cursor;
        let bytes = record::encode(&placeholder, version);
        new_store.write_at(at, &bytes)?;
        cursor = RecordOffset(at.get() + bytes.len() as u64);
        num_records += 1;

        for l in 0..=usize::from(level) {
            let pred_offset = last_at_level[l];
            let (mut pred, _) = crate::skiplist::read_record_at(&new_store, version, pred_offset)?;
            pred.forward[l] = at;
            let pred_bytes = record::encode(&pred, version);
            new_store.write_at(pred_offset, &pred_bytes)?;
            last_at_level[l] = at;
        }

        walk = live.forward.first().copied().unwrap_or(RecordOffset::NULL);
    }

    let commit_at = cursor;
    let commit_bytes = record::encode(&Record::commit(), version);
    new_store.write_at(commit_at, &commit_bytes)?;
    cursor = RecordOffset(commit_at.get() + commit_bytes.len() as u64);
    new_store.sync()?;

    header.log_start = cursor;
    header.num_records = num_records;
    header.cur_level = cur_level_seen;
    header.last_recovery_timestamp = old_header.last_recovery_timestamp;
    new_store.write_at(RecordOffset(0), &header.encode())?;
    new_store.sync()?;

    consistency::check(&new_store, version, dummy_offset)?;

    std::fs::rename(&target, old_store.path())?;
    // `old_store`'s file descriptor and mapping still point at the inode we
    // just renamed away; every handle sharing it must pick up the new file
    // before touching the store again.
    old_store.reopen()?;
    info!(records = num_records, "checkpoint rewrite complete");
    Ok(header)
}

/// Called on open: if a stray `.NEW` file is left from a checkpoint that
/// crashed after finishing the rewrite but before (or during) the rename,
/// finish the rename now. If the main file is missing entirely, the `.NEW`
/// file *is* the store. If both exist, the `.NEW` file is presumed stale
/// (the rename already happened or never got far enough to be trusted)
/// and is discarded.
///
/// # Errors
///
/// Returns any I/O error encountered while inspecting or renaming.
pub fn recover_stray_new(store_path: &Path) -> Result<()> {
    let stray = new_path(store_path);
    if !stray.exists() {
        return Ok(());
    }
    if store_path.exists() {
        std::fs::remove_file(&stray)?;
    } else {
        std::fs::rename(&stray, store_path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location;
    use crate::wal::Txn;

    fn store_with_entries(entries: &[(&[u8], &[u8])]) -> (tempfile::TempDir, PathBuf, FileHeader, FormatVersion) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let store = FileStore::open(&path, true, 4096, false).unwrap();
        let version = FormatVersion::Current;
        let header = FileHeader::new(version, 0);
        store.write_at(RecordOffset(0), &header.encode()).unwrap();
        let dummy_bytes = record::encode(&Record::dummy(header.max_level), version);
        let dummy_offset = header.dummy_offset();
        store.write_at(dummy_offset, &dummy_bytes).unwrap();
        let cursor = RecordOffset(dummy_offset.get() + dummy_bytes.len() as u64);

        let mut rng = rand::thread_rng();
        let mut txn = Txn::begin(&store, version, dummy_offset, cursor);
        for (k, v) in entries {
            txn.create(&mut rng, header.max_level, k, v.to_vec()).unwrap();
        }
        txn.commit().unwrap();
        drop(store);
        (dir, path, header, version)
    }

    #[test]
    fn checkpoint_preserves_all_live_keys() {
        let (_dir, path, mut header, version) = store_with_entries(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
        header.log_start = RecordOffset(
            header.dummy_offset().get() + record::encode(&Record::dummy(header.max_level), version).len() as u64,
        );
        let store = FileStore::open(&path, false, 4096, false).unwrap();
        let new_header = run(&store, version, &header).unwrap();
        drop(store);

        let reopened = FileStore::open(&path, false, 4096, false).unwrap();
        let source = StoreSource { store: &reopened, version };
        for key in [b"a".as_slice(), b"b", b"c"] {
            let found = location::search(&source, new_header.dummy_offset(), key).unwrap();
            assert!(found.exact_match, "key {key:?} missing after checkpoint");
        }
        assert_eq!(new_header.num_records, 3);
    }

    #[test]
    fn recover_stray_new_completes_interrupted_rename() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("store.db");
        let stray = new_path(&main);
        std::fs::write(&stray, b"new contents").unwrap();
        recover_stray_new(&main).unwrap();
        assert!(main.exists());
        assert!(!stray.exists());
    }

    #[test]
    fn recover_stray_new_discards_when_main_exists() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("store.db");
        std::fs::write(&main, b"main contents").unwrap();
        let stray = new_path(&main);
        std::fs::write(&stray, b"stray contents").unwrap();
        recover_stray_new(&main).unwrap();
        assert!(main.exists());
        assert!(!stray.exists());
        assert_eq!(std::fs::read(&main).unwrap(), b"main contents");
    }
}
