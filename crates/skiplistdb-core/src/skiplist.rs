//! The skip-list stitch algorithms: drawing a record's height, splicing a
//! new record in (bottom-up), splicing an existing one out (top-down), and
//! REPLACE, which reuses an existing record's exact position rather than
//! drawing a fresh height.
//!
//! Per-key lifecycle invariant this module upholds:
//! `(ADD | REPLACE) . (REPLACE)* . (DELETE)?` — a key starts with a single
//! ADD or REPLACE-of-nothing, may be REPLACEd any number of times, and may
//! end with one DELETE. Nothing in this module allows two live chains to
//! exist for the same key at once; REPLACE always fully supersedes the
//! record it targets in the same stitch operation that links the new one
//! in.

use crate::error::{Error, Result};
use crate::file_io::FileStore;
use crate::header::FormatVersion;
use crate::location::{Location, RecordSource};
use crate::offset::RecordOffset;
use crate::record::{self, Record, RecordKind};
use rand::Rng;

/// Draws a record height the classic way: level 0 always, each additional
/// level with probability 1/2, capped at `max_level`.
pub fn draw_height(rng: &mut impl Rng, max_level: u8) -> u8 {
    let mut level = 0u8;
    while level < max_level && rng.gen_bool(0.5) {
        level += 1;
    }
    level
}

/// A [`FileStore`] paired with the format version it holds, adapted to
/// [`RecordSource`] so [`crate::location::search`] can read through it.
pub struct StoreSource<'a> {
    pub(crate) store: &'a FileStore,
    pub(crate) version: FormatVersion,
}

impl RecordSource for StoreSource<'_> {
    fn get(&self, offset: RecordOffset) -> Result<Record> {
        read_record_at(self.store, self.version, offset).map(|(record, _)| record)
    }
}

/// Reads and decodes the record at `offset`, returning it along with its
/// encoded length.
///
/// # Errors
///
/// Propagates any decode error (truncation, bad CRC, unknown type), or
/// `Error::Internal` if `offset` lies past the end of the store (a
/// dangling pointer, which a corrupted or pre-rebuild in-order region can
/// produce).
pub fn read_record_at(store: &FileStore, version: FormatVersion, offset: RecordOffset) -> Result<(Record, usize)> {
    let len = store.len();
    if offset.get() > len {
        return Err(Error::internal(format!("record offset {} past end of store ({len} bytes)", offset.get())));
    }
    let remaining = (len - offset.get()) as usize;
    let guard = store.read_guard(offset, remaining)?;
    let slice = guard.as_slice()?;
    record::decode(slice, version)
}

/// Re-encodes `record` and overwrites it in place at `offset`. Only valid
/// when the new encoding is the same length as what's already there —
/// true whenever only pointer *values* change, never a length or a level.
fn rewrite_in_place(store: &FileStore, version: FormatVersion, offset: RecordOffset, record: &Record) -> Result<()> {
    let bytes = record::encode(record, version);
    store.write_at(offset, &bytes)
}

/// Writes a brand-new record at the caller-chosen offset `at` (the WAL
/// append cursor; see the `wal` module). The file's physical mapping may
/// be larger than the logical end of data, so the append position is
/// always handed in rather than derived from `FileStore::len`.
fn write_new(store: &FileStore, version: FormatVersion, at: RecordOffset, record: &Record) -> Result<usize> {
    let bytes = record::encode(record, version);
    let len = bytes.len();
    store.write_at(at, &bytes)?;
    Ok(len)
}

/// Splices a brand-new key in at append position `at`. `loc` must be the
/// result of searching for `key` with `loc.exact_match == false`. Stitches
/// bottom-up: the new record is written first, then each predecessor from
/// level 0 upward is patched to point at it.
///
/// Returns the number of bytes the new record occupies, so the caller
/// (the WAL append cursor owner) can advance past it.
///
/// # Errors
///
/// Propagates I/O or codec errors from any read/write along the way.
pub fn insert(
    store: &FileStore,
    version: FormatVersion,
    loc: &Location,
    level: u8,
    at: RecordOffset,
    key: &[u8],
    value: Vec<u8>,
    compressed: bool,
) -> Result<usize> {
    let forward = loc.forward_pointers[0..=usize::from(level)].to_vec();
    let new_record = Record {
        kind: RecordKind::Add,
        forward,
        delete_pointer: None,
        key: key.to_vec(),
        value: Some(value),
        compressed,
    };
    let written = write_new(store, version, at, &new_record)?;

    for l in 0..=usize::from(level) {
        let pred_offset = loc.back_pointers[l];
        let (mut pred, _) = read_record_at(store, version, pred_offset)?;
        pred.forward[l] = at;
        rewrite_in_place(store, version, pred_offset, &pred)?;
    }

    Ok(written)
}

/// Replaces the record at `old_offset` (already located by `loc`, with
/// `loc.exact_match == true` and `loc.match_offset == Some(old_offset)`)
/// with a new value, reusing the old record's exact position: the new
/// record's forward pointers are copied verbatim from the old one, so only
/// the predecessors up to the old record's own level need to be patched,
/// bottom-up, exactly as in `insert`.
///
/// # Errors
///
/// Propagates I/O or codec errors from any read/write along the way.
pub fn replace(
    store: &FileStore,
    version: FormatVersion,
    loc: &Location,
    old_offset: RecordOffset,
    at: RecordOffset,
    key: &[u8],
    value: Vec<u8>,
    compressed: bool,
) -> Result<usize> {
    let (old_record, _) = read_record_at(store, version, old_offset)?;
    let new_record = Record {
        kind: RecordKind::Add,
        forward: old_record.forward.clone(),
        delete_pointer: Some(old_offset),
        key: key.to_vec(),
        value: Some(value),
        compressed,
    };
    let written = write_new(store, version, at, &new_record)?;

    for l in 0..=usize::from(old_record.level()) {
        let pred_offset = loc.back_pointers[l];
        let (mut pred, _) = read_record_at(store, version, pred_offset)?;
        pred.forward[l] = at;
        rewrite_in_place(store, version, pred_offset, &pred)?;
    }

    Ok(written)
}

/// Unstitches the record at `old_offset` (already located by `loc`, with
/// `loc.exact_match == true`), top-down: each predecessor from the
/// record's own top level down to level 0 is patched to skip over it,
/// pointing instead at whatever it pointed to.
///
/// # Errors
///
/// Propagates I/O or codec errors from any read/write along the way.
pub fn delete(store: &FileStore, version: FormatVersion, loc: &Location, old_offset: RecordOffset) -> Result<()> {
    let (old_record, _) = read_record_at(store, version, old_offset)?;

    for l in (0..=usize::from(old_record.level())).rev() {
        let pred_offset = loc.back_pointers[l];
        let (mut pred, _) = read_record_at(store, version, pred_offset)?;
        pred.forward[l] = old_record.forward[l];
        rewrite_in_place(store, version, pred_offset, &pred)?;
    }

    Ok(())
}
