//! Typed file offsets.
//!
//! The on-disk format is a graph of records linked by byte offsets. Using a
//! raw `u64` for both offsets and lengths everywhere invites the usual bug
//! of adding a length to the wrong base or comparing an offset against a
//! count. `RecordOffset` exists purely to make that class of mistake a type
//! error instead of a 3am debugging session.

use std::fmt;

/// A byte offset into the store file, pointing at the start of a record.
///
/// `RecordOffset(0)` is reserved: it means "no record" (end of a forward
/// chain, or an unset back-pointer before a search has run). Offset 0 is
/// never a valid record position because the file header always precedes
/// the first record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordOffset(pub u64);

impl RecordOffset {
    /// The sentinel meaning "no record" / "end of list at this level".
    pub const NULL: RecordOffset = RecordOffset(0);

    /// Whether this offset is the null sentinel.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The raw byte offset.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// As a `usize`, for indexing into a mapped slice.
    ///
    /// # Panics
    ///
    /// Panics if the offset does not fit in a `usize` (32-bit targets with
    /// files over 4 GiB). This store is not expected to run on such targets.
    #[must_use]
    pub fn as_usize(self) -> usize {
        usize::try_from(self.0).expect("record offset exceeds usize::MAX on this platform")
    }
}

impl From<u64> for RecordOffset {
    fn from(value: u64) -> Self {
        RecordOffset(value)
    }
}

impl From<RecordOffset> for u64 {
    fn from(value: RecordOffset) -> Self {
        value.0
    }
}

impl fmt::Display for RecordOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_zero() {
        assert!(RecordOffset::NULL.is_null());
        assert!(RecordOffset(0).is_null());
        assert!(!RecordOffset(8).is_null());
    }

    #[test]
    fn ordering_matches_raw_offset() {
        assert!(RecordOffset(8) < RecordOffset(16));
    }
}
