//! Caller-facing configuration: flags passed to `open`, and the tunables a
//! host may override.

use crate::header::{FormatVersion, FLAG_COMPRESS, FLAG_ORDERED_BYTES};

/// Flags passed to [`crate::handle::open`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags {
    bits: u32,
}

impl OpenFlags {
    /// Create the file if it does not exist.
    pub const CREATE: OpenFlags = OpenFlags { bits: 1 << 0 };
    /// Use a plain bytewise key comparator (the only comparator this crate
    /// ships; the flag exists because it is persisted in the header so a
    /// later open can tell which ordering a file was built under).
    pub const ORDERED_BYTES: OpenFlags = OpenFlags { bits: 1 << 1 };
    /// Permit compressed value records (requires the `compress` feature).
    pub const COMPRESS: OpenFlags = OpenFlags { bits: 1 << 2 };

    /// Empty flag set.
    #[must_use]
    pub const fn empty() -> Self {
        OpenFlags { bits: 0 }
    }

    /// Bitwise union.
    #[must_use]
    pub const fn union(self, other: OpenFlags) -> Self {
        OpenFlags { bits: self.bits | other.bits }
    }

    /// Whether `flag` is set.
    #[must_use]
    pub const fn contains(self, flag: OpenFlags) -> bool {
        self.bits & flag.bits == flag.bits
    }

    /// Converts to the bits persisted in the file header.
    #[must_use]
    pub fn to_header_flags(self) -> u32 {
        let mut flags = 0;
        if self.contains(OpenFlags::ORDERED_BYTES) {
            flags |= FLAG_ORDERED_BYTES;
        }
        if self.contains(OpenFlags::COMPRESS) {
            flags |= FLAG_COMPRESS;
        }
        flags
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = OpenFlags;
    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        self.union(rhs)
    }
}

/// Tunables controlling growth and checkpoint cadence. Mirrors the
/// teacher's pattern of `pub` constants with an overridable struct rather
/// than a config file: this crate has no host-facing configuration layer
/// of its own (that belongs to whatever embeds it).
#[derive(Clone, Copy, Debug)]
pub struct StoreOptions {
    /// Initial file size in bytes for a newly created store.
    pub initial_size: u64,
    /// Minimum growth increment when the mapped region must be extended.
    pub min_growth: u64,
    /// Multiplicative growth factor applied to the current size.
    pub growth_factor: f64,
    /// Checkpoint is triggered once the WAL region exceeds this multiple
    /// of the in-order (post-checkpoint) region's size.
    pub checkpoint_threshold_multiplier: f64,
    /// Skip all threshold-triggered fsyncs (still fsyncs on explicit
    /// commit of a durable transaction). Matches spec.md's "unsafe mode".
    pub unsafe_no_fsync: bool,
    /// On-disk format a brand-new file is created in. Has no effect when
    /// opening an existing file — that file's actual version is always read
    /// back from its own header instead. Exposed mainly for
    /// `skiplistdb-convert`, which needs to produce a legacy-format file on
    /// request rather than always writing the current one.
    pub create_version: FormatVersion,
}

impl StoreOptions {
    /// Default initial file size: 64 KiB.
    pub const DEFAULT_INITIAL_SIZE: u64 = 64 * 1024;
    /// Default minimum growth increment: 1 MiB.
    pub const DEFAULT_MIN_GROWTH: u64 = 1024 * 1024;
    /// Default growth factor: double the file each time it must grow.
    pub const DEFAULT_GROWTH_FACTOR: f64 = 2.0;
    /// Default checkpoint threshold: checkpoint once the WAL region is as
    /// large as the in-order region.
    pub const DEFAULT_CHECKPOINT_THRESHOLD_MULTIPLIER: f64 = 1.0;
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            initial_size: Self::DEFAULT_INITIAL_SIZE,
            min_growth: Self::DEFAULT_MIN_GROWTH,
            growth_factor: Self::DEFAULT_GROWTH_FACTOR,
            checkpoint_threshold_multiplier: Self::DEFAULT_CHECKPOINT_THRESHOLD_MULTIPLIER,
            unsafe_no_fsync: false,
            create_version: FormatVersion::Current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_union_and_contains() {
        let flags = OpenFlags::CREATE | OpenFlags::ORDERED_BYTES;
        assert!(flags.contains(OpenFlags::CREATE));
        assert!(flags.contains(OpenFlags::ORDERED_BYTES));
        assert!(!flags.contains(OpenFlags::COMPRESS));
    }

    #[test]
    fn header_flags_roundtrip_relevant_bits() {
        let flags = OpenFlags::ORDERED_BYTES | OpenFlags::COMPRESS;
        let header_flags = flags.to_header_flags();
        assert_eq!(header_flags, FLAG_ORDERED_BYTES | FLAG_COMPRESS);
    }

    #[test]
    fn default_options_are_sane() {
        let opts = StoreOptions::default();
        assert!(opts.initial_size > 0);
        assert!(opts.growth_factor > 1.0);
        assert!(!opts.unsafe_no_fsync);
    }
}
