//! End-to-end scenarios exercising `Database`/`Transaction` against a real
//! file on disk: empty-store iteration, reopen durability, ordered
//! iteration, abort round-tripping, crash-tail truncation, checkpoint
//! rewrite, mixed-height consistency, and legacy-format interop.

use skiplistdb_core::consistency;
use skiplistdb_core::header::{FileHeader, FormatVersion};
use skiplistdb_core::offset::RecordOffset;
use skiplistdb_core::record::{self, Record};
use skiplistdb_core::skiplist::StoreSource;
use skiplistdb_core::wal::Txn;
use skiplistdb_core::{Database, FileStore, OpenFlags, StoreFactory, StoreOptions};
use std::path::Path;

fn open(path: &Path, options: StoreOptions) -> Database {
    let factory = StoreFactory::new();
    Database::open(&factory, path, OpenFlags::CREATE, options).expect("open")
}

/// S1. Empty store: foreach yields nothing, num_records is zero.
#[test]
fn s1_empty_create_and_iterate() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir.path().join("s1.db"), StoreOptions::default());

    let mut seen = Vec::new();
    db.foreach(None, |k, v| {
        seen.push((k.to_vec(), v.to_vec()));
        Ok(true)
    })
    .unwrap();
    assert!(seen.is_empty());
    db.close().unwrap();
}

/// S2. A single committed insert survives a close/reopen cycle.
#[test]
fn s2_single_insert_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s2.db");

    let db = open(&path, StoreOptions::default());
    db.create(b"k", b"v".to_vec()).unwrap();
    db.close().unwrap();

    let factory = StoreFactory::new();
    let reopened = Database::open(&factory, &path, OpenFlags::empty(), StoreOptions::default()).unwrap();
    assert_eq!(reopened.fetch(b"k").unwrap(), Some(b"v".to_vec()));

    let mut seen = Vec::new();
    reopened
        .foreach(None, |k, v| {
            seen.push((k.to_vec(), v.to_vec()));
            Ok(true)
        })
        .unwrap();
    assert_eq!(seen, vec![(b"k".to_vec(), b"v".to_vec())]);
}

/// S3. Inserting out of order still yields ascending-key iteration.
#[test]
fn s3_ordered_inserts_ascending_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir.path().join("s3.db"), StoreOptions::default());

    db.create(b"a", b"1".to_vec()).unwrap();
    db.create(b"c", b"3".to_vec()).unwrap();
    db.create(b"b", b"2".to_vec()).unwrap();

    let mut seen = Vec::new();
    db.foreach(None, |k, v| {
        seen.push((k.to_vec(), v.to_vec()));
        Ok(true)
    })
    .unwrap();
    assert_eq!(
        seen,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ]
    );
}

/// S4. A replace inside an aborted transaction leaves the prior value
/// untouched.
#[test]
fn s4_replace_and_abort() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir.path().join("s4.db"), StoreOptions::default());
    db.create(b"k", b"v1".to_vec()).unwrap();

    let mut txn = db.begin().unwrap();
    txn.store(b"k", b"v2".to_vec()).unwrap();
    txn.abort().unwrap();

    assert_eq!(db.fetch(b"k").unwrap(), Some(b"v1".to_vec()));
}

/// S5. A transaction that writes a delete but never reaches a commit
/// marker (simulating a crash) leaves the deleted key intact after
/// recovery truncates the uncommitted tail.
#[test]
fn s5_delete_and_crash_before_commit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s5.db");

    {
        let db = open(&path, StoreOptions::default());
        db.create(b"k", b"v".to_vec()).unwrap();
        db.close().unwrap();
    }

    // Drive the WAL directly so the transaction's own `Drop`-aborts-if-
    // uncommitted guard doesn't run: `mem::forget` stands in for the
    // process simply being killed mid-transaction, leaving an uncommitted
    // delete appended to the file with no trailing commit marker.
    {
        let store = FileStore::open(&path, false, 4096, false).unwrap();
        let probe = store.read_at(RecordOffset(0), skiplistdb_core::header::HEADER_SIZE_V2).unwrap();
        let header = FileHeader::decode(&probe).unwrap();
        let version = header.version;
        let dummy_offset = header.dummy_offset();
        let cursor = RecordOffset(store.len());

        let mut txn = Txn::begin(&store, version, dummy_offset, cursor);
        txn.delete(b"k", false).unwrap();
        std::mem::forget(txn);
    }

    let factory = StoreFactory::new();
    let reopened = Database::open(&factory, &path, OpenFlags::empty(), StoreOptions::default()).unwrap();
    assert_eq!(reopened.fetch(b"k").unwrap(), Some(b"v".to_vec()));
}

/// S6. Enough commits to cross the checkpoint threshold trigger a rewrite;
/// every key is still resolvable afterward and the file has shrunk back
/// toward the live data size.
#[test]
fn s6_checkpoint_and_rename() {
    let dir = tempfile::tempdir().unwrap();
    let options = StoreOptions { checkpoint_threshold_multiplier: 0.5, ..StoreOptions::default() };
    let db = open(&dir.path().join("s6.db"), options);

    let mut keys = Vec::new();
    for batch in 0..10u32 {
        let mut txn = db.begin().unwrap();
        for i in 0..1000u32 {
            let key = format!("key-{batch:04}-{i:04}").into_bytes();
            txn.create(&key, b"value".to_vec()).unwrap();
            keys.push(key);
        }
        txn.commit().unwrap();
    }

    for key in &keys {
        assert!(db.fetch(key).unwrap().is_some(), "key {key:?} missing after checkpoint cadence");
    }

    db.checkpoint().unwrap();
    for key in &keys {
        assert!(db.fetch(key).unwrap().is_some(), "key {key:?} missing after explicit checkpoint");
    }
}

/// S7. Insert keys drawing a spread of skip-list heights; the P1
/// consistency walk must hold after every insert and after an abort.
#[test]
fn s7_mixed_height_stitch_under_paranoid_checks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s7.db");
    let store = FileStore::open(&path, true, 4096, false).unwrap();
    let version = FormatVersion::Current;
    let header = FileHeader::new(version, 0);
    store.write_at(RecordOffset(0), &header.encode()).unwrap();
    let dummy_offset = header.dummy_offset();
    let dummy_bytes = record::encode(&Record::dummy(header.max_level), version);
    store.write_at(dummy_offset, &dummy_bytes).unwrap();
    let mut cursor = RecordOffset(dummy_offset.get() + dummy_bytes.len() as u64);

    let mut rng = rand::thread_rng();
    for i in 0..200u32 {
        let key = format!("k{i:04}").into_bytes();
        let mut txn = Txn::begin(&store, version, dummy_offset, cursor);
        txn.create(&mut rng, header.max_level, &key, b"v".to_vec()).unwrap();
        let marker = txn.commit().unwrap();
        let commit_len = record::encode(&Record::commit(), version).len();
        cursor = RecordOffset(marker.get() + commit_len as u64);

        consistency::check(&store, version, dummy_offset).expect("P1 holds after insert");
    }

    let mut txn = Txn::begin(&store, version, dummy_offset, cursor);
    txn.delete(b"k0100", false).unwrap();
    txn.abort().unwrap();
    consistency::check(&store, version, dummy_offset).expect("P1 holds after abort");

    let source = StoreSource { store: &store, version };
    let found = skiplistdb_core::location::search(&source, dummy_offset, b"k0100").unwrap();
    assert!(found.exact_match, "aborted delete must not have removed the key");
}

/// S8. A store created in the legacy format stays legacy through a
/// checkpoint: the rewritten file is still openable and every key still
/// resolves.
#[test]
fn s8_legacy_read_current_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s8.db");
    let legacy_options = StoreOptions { create_version: FormatVersion::Legacy, ..StoreOptions::default() };
    let db = open(&path, legacy_options);

    db.create(b"a", b"1".to_vec()).unwrap();
    db.create(b"b", b"2".to_vec()).unwrap();
    db.create(b"c", b"3".to_vec()).unwrap();

    let mut seen = Vec::new();
    db.foreach(None, |k, v| {
        seen.push((k.to_vec(), v.to_vec()));
        Ok(true)
    })
    .unwrap();
    assert_eq!(seen.len(), 3);

    db.checkpoint().unwrap();
    db.close().unwrap();

    let factory = StoreFactory::new();
    let reopened = Database::open(&factory, &path, OpenFlags::empty(), StoreOptions::default()).unwrap();
    assert_eq!(reopened.fetch(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(reopened.fetch(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(reopened.fetch(b"c").unwrap(), Some(b"3".to_vec()));
}
