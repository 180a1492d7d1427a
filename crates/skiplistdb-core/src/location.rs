//! Locating a key in the skip list: the position a search converges on,
//! and the per-level predecessor/successor trail needed to stitch a new
//! record in or unstitch an existing one out.

use crate::offset::RecordOffset;
use crate::record::Record;
use std::cmp::Ordering;

/// The result of searching for a key: the per-level trail of predecessor
/// offsets (`back_pointers`) and the successor each predecessor currently
/// points to at that level (`forward_pointers`), plus whether the search
/// landed exactly on the key.
#[derive(Clone, Debug, Default)]
pub struct Location {
    /// `back_pointers[level]` is the offset of the last record at `level`
    /// whose key is `< target` (or the DUMMY offset if none).
    pub back_pointers: Vec<RecordOffset>,
    /// `forward_pointers[level]` is whatever `back_pointers[level]`'s
    /// forward pointer at that level currently is (the record a new entry
    /// at that level would be stitched in front of).
    pub forward_pointers: Vec<RecordOffset>,
    /// Set when the record at `forward_pointers[0]` has a key exactly
    /// equal to the search target.
    pub exact_match: bool,
    /// The offset of the exact match, if any.
    pub match_offset: Option<RecordOffset>,
}

impl Location {
    /// Number of levels this location spans (equal to `dummy.level() + 1`,
    /// i.e. every level the skip list currently has).
    #[must_use]
    pub fn num_levels(&self) -> usize {
        self.back_pointers.len()
    }
}

/// Anything that can fetch a record by offset during a search. Kept
/// trait-bound rather than concretely tied to `FileStore` so unit tests can
/// search an in-memory fixture.
pub trait RecordSource {
    /// Fetches and decodes the record at `offset`.
    fn get(&self, offset: RecordOffset) -> crate::error::Result<Record>;
}

/// Searches for `key` starting at `dummy_offset`, the offset of the
/// permanent DUMMY record. Builds the full per-level trail top-down, as
/// spec.md's search/advance algorithm describes: at each level, advance
/// forward while the next key compares less than `key`, then drop a level.
///
/// # Errors
///
/// Propagates any error from `source.get`.
pub fn search(
    source: &impl RecordSource,
    dummy_offset: RecordOffset,
    key: &[u8],
) -> crate::error::Result<Location> {
    let dummy = source.get(dummy_offset)?;
    let top_level = dummy.level();
    let mut back_pointers = vec![RecordOffset::NULL; usize::from(top_level) + 1];
    let mut forward_pointers = vec![RecordOffset::NULL; usize::from(top_level) + 1];

    let mut current_offset = dummy_offset;
    let mut current_forward = dummy.forward.clone();

    for level in (0..=top_level).rev() {
        loop {
            let candidate = current_forward[usize::from(level)];
            if candidate.is_null() {
                break;
            }
            let candidate_record = source.get(candidate)?;
            match candidate_record.key.as_slice().cmp(key) {
                Ordering::Less => {
                    current_offset = candidate;
                    current_forward = candidate_record.forward;
                }
                _ => break,
            }
        }
        back_pointers[usize::from(level)] = current_offset;
        forward_pointers[usize::from(level)] = current_forward[usize::from(level)];
    }

    let (exact_match, match_offset) = match forward_pointers.first() {
        Some(candidate) if !candidate.is_null() => {
            let record = source.get(*candidate)?;
            if record.key == key {
                (true, Some(*candidate))
            } else {
                (false, None)
            }
        }
        _ => (false, None),
    };

    Ok(Location {
        back_pointers,
        forward_pointers,
        exact_match,
        match_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;
    use std::collections::HashMap;

    struct MemSource(HashMap<u64, Record>);

    impl RecordSource for MemSource {
        fn get(&self, offset: RecordOffset) -> crate::error::Result<Record> {
            self.0
                .get(&offset.get())
                .cloned()
                .ok_or_else(|| crate::error::Error::internal("missing record in fixture"))
        }
    }

    fn record(kind: RecordKind, key: &[u8], forward: Vec<RecordOffset>) -> Record {
        Record {
            kind,
            forward,
            delete_pointer: None,
            key: key.to_vec(),
            value: Some(b"v".to_vec()),
            compressed: false,
        }
    }

    #[test]
    fn search_finds_exact_match_and_trail() {
        // dummy(@0) -> b(@16) -> d(@32), two levels.
        let dummy = record(RecordKind::Dummy, b"", vec![RecordOffset(32), RecordOffset(16)]);
        let b = record(RecordKind::Add, b"b", vec![RecordOffset::NULL]);
        let d = record(RecordKind::Add, b"d", vec![RecordOffset::NULL, RecordOffset::NULL]);

        let mut map = HashMap::new();
        map.insert(0, dummy);
        map.insert(16, b);
        map.insert(32, d);
        let source = MemSource(map);

        let loc = search(&source, RecordOffset(0), b"d").unwrap();
        assert!(loc.exact_match);
        assert_eq!(loc.match_offset, Some(RecordOffset(32)));
        assert_eq!(loc.back_pointers[1], RecordOffset(0));
        assert_eq!(loc.back_pointers[0], RecordOffset(16));
    }

    #[test]
    fn search_miss_points_at_insertion_spot() {
        let dummy = record(RecordKind::Dummy, b"", vec![RecordOffset(16)]);
        let b = record(RecordKind::Add, b"b", vec![RecordOffset::NULL]);
        let mut map = HashMap::new();
        map.insert(0, dummy);
        map.insert(16, b);
        let source = MemSource(map);

        let loc = search(&source, RecordOffset(0), b"a").unwrap();
        assert!(!loc.exact_match);
        assert_eq!(loc.back_pointers[0], RecordOffset(0));
        assert_eq!(loc.forward_pointers[0], RecordOffset(16));
    }
}
