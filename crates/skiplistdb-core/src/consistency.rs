//! The P1 consistency walk: for every live forward pointer from X to Y at
//! level L, Y must itself have level >= L and key(Y) must be greater than
//! key(X) (or X must be the DUMMY). Runs unconditionally around every
//! checkpoint, and after every mutation when the `paranoid` feature is on.

use crate::error::{Error, Result};
use crate::file_io::FileStore;
use crate::header::FormatVersion;
use crate::offset::RecordOffset;
use crate::skiplist::read_record_at;

/// Walks every level of the list starting at `dummy_offset`, verifying the
/// P1 invariant at each forward pointer.
///
/// # Errors
///
/// Returns `Error::Internal` describing the first violation found.
pub fn check(store: &FileStore, version: FormatVersion, dummy_offset: RecordOffset) -> Result<()> {
    let (dummy, _) = read_record_at(store, version, dummy_offset)?;
    let top_level = dummy.level();

    for level in 0..=top_level {
        let mut prev_offset = dummy_offset;
        let mut prev_key: Option<Vec<u8>> = None;
        let mut cursor = dummy.forward[usize::from(level)];

        while !cursor.is_null() {
            let (record, _) = read_record_at(store, version, cursor)?;
            if record.level() < level {
                return Err(Error::internal(format!(
                    "P1 violation: record at {cursor} has level {} but is linked at level {level}",
                    record.level()
                )));
            }
            if let Some(prev) = &prev_key {
                if &record.key <= prev {
                    return Err(Error::internal(format!(
                        "P1 violation: key at {cursor} does not exceed predecessor {prev_offset}'s key"
                    )));
                }
            }
            prev_offset = cursor;
            prev_key = Some(record.key.clone());
            cursor = record.forward[usize::from(level)];
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::FileHeader;
    use crate::record::{self, Record};
    use crate::wal::Txn;

    #[test]
    fn freshly_built_list_passes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store.db"), true, 4096, false).unwrap();
        let version = FormatVersion::Current;
        let header = FileHeader::new(version, 0);
        store.write_at(RecordOffset(0), &header.encode()).unwrap();
        let dummy_offset = header.dummy_offset();
        let dummy_bytes = record::encode(&Record::dummy(header.max_level), version);
        store.write_at(dummy_offset, &dummy_bytes).unwrap();
        let cursor = RecordOffset(dummy_offset.get() + dummy_bytes.len() as u64);

        let mut rng = rand::thread_rng();
        let mut txn = Txn::begin(&store, version, dummy_offset, cursor);
        for key in [b"a".as_slice(), b"b", b"c", b"d"] {
            txn.create(&mut rng, header.max_level, key, b"v".to_vec()).unwrap();
        }
        txn.commit().unwrap();

        check(&store, version, dummy_offset).unwrap();
    }
}
