//! The file header: the fixed-size block at offset 0 that identifies the
//! format version, the skip-list ceiling, and where the write-ahead log
//! region begins.
//!
//! Two on-disk flavors are supported side by side: legacy (v1, 32-bit
//! offsets, 4-byte aligned, no header CRC) and current (v2, 64-bit offsets,
//! 8-byte aligned, CRC-protected header).

use crate::error::{Error, Result};
use crate::offset::RecordOffset;

/// Fixed 20-byte sentinel at the start of every store file, both versions.
pub const MAGIC: &[u8; 20] = b"skiplistdb-fmt-v001\0";

/// Skip-list level ceiling for the legacy format.
pub const MAX_LEVEL_V1: u8 = 20;

/// Skip-list level ceiling for the current format.
pub const MAX_LEVEL_V2: u8 = 24;

/// On-disk byte size of the legacy (v1) header.
pub const HEADER_SIZE_V1: usize = 40;

/// On-disk byte size of the current (v2) header.
pub const HEADER_SIZE_V2: usize = 56;

/// Persisted header flag: the store was created with a bytewise comparator.
pub const FLAG_ORDERED_BYTES: u32 = 1 << 0;

/// Persisted header flag: compressed records may appear in this file.
pub const FLAG_COMPRESS: u32 = 1 << 1;

/// The on-disk format flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatVersion {
    /// Legacy: 32-bit offsets, no per-record CRC, no header CRC.
    Legacy,
    /// Current: 64-bit offsets, per-record CRC, header CRC.
    Current,
}

impl FormatVersion {
    /// The skip-list level ceiling compiled in for this version.
    #[must_use]
    pub const fn max_level(self) -> u8 {
        match self {
            FormatVersion::Legacy => MAX_LEVEL_V1,
            FormatVersion::Current => MAX_LEVEL_V2,
        }
    }

    /// The on-disk alignment records must start/end on.
    #[must_use]
    pub const fn alignment(self) -> usize {
        match self {
            FormatVersion::Legacy => 4,
            FormatVersion::Current => 8,
        }
    }

    /// The fixed on-disk size of the header itself.
    #[must_use]
    pub const fn header_size(self) -> usize {
        match self {
            FormatVersion::Legacy => HEADER_SIZE_V1,
            FormatVersion::Current => HEADER_SIZE_V2,
        }
    }
}

/// The decoded file header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHeader {
    /// Which codec this file uses.
    pub version: FormatVersion,
    /// Compiled skip-list ceiling for this file (redundant with
    /// `version.max_level()`, but persisted so a future raised ceiling
    /// doesn't silently reinterpret an old file).
    pub max_level: u8,
    /// Highest level actually observed among live records.
    pub cur_level: u8,
    /// Advisory live-record count; not load-bearing for correctness.
    pub num_records: u64,
    /// File offset where the write-ahead log region begins (just past the
    /// in-order region written by the last checkpoint, or past the dummy
    /// on a freshly created file).
    pub log_start: RecordOffset,
    /// Seconds-since-epoch timestamp of the last successful recovery.
    pub last_recovery_timestamp: u64,
    /// Persisted flags (`FLAG_ORDERED_BYTES`, `FLAG_COMPRESS`).
    pub flags: u32,
}

impl FileHeader {
    /// Builds a fresh header for a newly created, empty store.
    #[must_use]
    pub fn new(version: FormatVersion, flags: u32) -> Self {
        let max_level = version.max_level();
        let log_start = RecordOffset(
            u64::try_from(version.header_size()).expect("header size fits in u64")
                + dummy_record_reserved_size(version, max_level),
        );
        FileHeader {
            version,
            max_level,
            cur_level: 0,
            num_records: 0,
            log_start,
            last_recovery_timestamp: 0,
            flags,
        }
    }

    /// True if the store was opened/created with a bytewise comparator.
    #[must_use]
    pub fn ordered_bytes(&self) -> bool {
        self.flags & FLAG_ORDERED_BYTES != 0
    }

    /// True if compressed records are permitted in this file.
    #[must_use]
    pub fn compress_enabled(&self) -> bool {
        self.flags & FLAG_COMPRESS != 0
    }

    /// Offset immediately following the header, where the permanent DUMMY
    /// record lives.
    #[must_use]
    pub fn dummy_offset(&self) -> RecordOffset {
        RecordOffset(u64::try_from(self.version.header_size()).expect("fits in u64"))
    }

    /// Encodes the header. For the current version this also computes and
    /// appends the header CRC.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self.version {
            FormatVersion::Legacy => self.encode_v1(),
            FormatVersion::Current => self.encode_v2(),
        }
    }

    fn encode_v1(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE_V1);
        buf.extend_from_slice(MAGIC);
        buf.push(1); // version_major
        buf.push(0); // version_minor
        buf.push(self.max_level);
        buf.push(self.cur_level);
        buf.extend_from_slice(&truncate_u32(self.num_records).to_le_bytes());
        buf.extend_from_slice(&truncate_u32(self.log_start.get()).to_le_bytes());
        buf.extend_from_slice(&truncate_u32(self.last_recovery_timestamp).to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        debug_assert_eq!(buf.len(), HEADER_SIZE_V1);
        buf
    }

    fn encode_v2(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE_V2);
        buf.extend_from_slice(MAGIC);
        buf.push(2); // version_major
        buf.push(0); // version_minor
        buf.push(self.max_level);
        buf.push(self.cur_level);
        buf.extend_from_slice(&self.num_records.to_le_bytes());
        buf.extend_from_slice(&self.log_start.get().to_le_bytes());
        buf.extend_from_slice(&self.last_recovery_timestamp.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        debug_assert_eq!(buf.len(), HEADER_SIZE_V2);
        buf
    }

    /// Decodes a header from the start of `data`. Picks the codec by
    /// reading `version_major` after verifying the magic.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` on bad magic, unsupported version, a
    /// `max_level` beyond the compiled ceiling, or (current version) a
    /// header CRC mismatch.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 24 || &data[0..20] != MAGIC {
            return Err(Error::internal("bad file magic"));
        }
        match data[20] {
            1 => Self::decode_v1(data),
            2 => Self::decode_v2(data),
            other => Err(Error::internal(format!("unsupported version {other}"))),
        }
    }

    fn decode_v1(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE_V1 {
            return Err(Error::internal("truncated v1 header"));
        }
        let max_level = data[22];
        if max_level > MAX_LEVEL_V1 {
            return Err(Error::internal("max_level exceeds compiled v1 ceiling"));
        }
        let cur_level = data[23];
        let num_records = u64::from(u32::from_le_bytes(data[24..28].try_into().unwrap()));
        let log_start = u64::from(u32::from_le_bytes(data[28..32].try_into().unwrap()));
        let last_recovery_timestamp =
            u64::from(u32::from_le_bytes(data[32..36].try_into().unwrap()));
        let flags = u32::from_le_bytes(data[36..40].try_into().unwrap());
        Ok(FileHeader {
            version: FormatVersion::Legacy,
            max_level,
            cur_level,
            num_records,
            log_start: RecordOffset(log_start),
            last_recovery_timestamp,
            flags,
        })
    }

    fn decode_v2(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE_V2 {
            return Err(Error::internal("truncated v2 header"));
        }
        let body = &data[0..HEADER_SIZE_V2 - 4];
        let stored_crc = u32::from_le_bytes(data[HEADER_SIZE_V2 - 4..HEADER_SIZE_V2].try_into().unwrap());
        let computed_crc = crc32fast::hash(body);
        if stored_crc != computed_crc {
            return Err(Error::internal("header CRC mismatch"));
        }
        let max_level = data[22];
        if max_level > MAX_LEVEL_V2 {
            return Err(Error::internal("max_level exceeds compiled v2 ceiling"));
        }
        let cur_level = data[23];
        let num_records = u64::from_le_bytes(data[24..32].try_into().unwrap());
        let log_start = u64::from_le_bytes(data[32..40].try_into().unwrap());
        let last_recovery_timestamp = u64::from_le_bytes(data[40..48].try_into().unwrap());
        let flags = u32::from_le_bytes(data[48..52].try_into().unwrap());
        Ok(FileHeader {
            version: FormatVersion::Current,
            max_level,
            cur_level,
            num_records,
            log_start: RecordOffset(log_start),
            last_recovery_timestamp,
            flags,
        })
    }
}

/// Reserved size of the permanent DUMMY record immediately following the
/// header, used only to compute the initial `log_start` for a brand-new
/// file (the dummy is written separately by the caller; this just needs to
/// agree with `record::encoded_dummy_size`).
fn dummy_record_reserved_size(version: FormatVersion, max_level: u8) -> u64 {
    crate::record::dummy_record_size(version, max_level) as u64
}

fn truncate_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_is_twenty_bytes() {
        assert_eq!(MAGIC.len(), 20);
    }

    #[test]
    fn v2_roundtrip() {
        let header = FileHeader::new(FormatVersion::Current, FLAG_ORDERED_BYTES);
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_SIZE_V2);
        let decoded = FileHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn v1_roundtrip() {
        let header = FileHeader::new(FormatVersion::Legacy, 0);
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_SIZE_V1);
        let decoded = FileHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut encoded = FileHeader::new(FormatVersion::Current, 0).encode();
        encoded[0] = b'X';
        assert!(FileHeader::decode(&encoded).is_err());
    }

    #[test]
    fn corrupted_crc_rejected() {
        let mut encoded = FileHeader::new(FormatVersion::Current, 0).encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(FileHeader::decode(&encoded).is_err());
    }

    #[test]
    fn max_level_beyond_ceiling_rejected() {
        let mut header = FileHeader::new(FormatVersion::Current, 0);
        header.max_level = MAX_LEVEL_V2 + 1;
        let encoded = header.encode();
        assert!(FileHeader::decode(&encoded).is_err());
    }
}
