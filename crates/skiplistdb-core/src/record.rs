//! The record codec: every record type (DUMMY, ADD, DELETE, COMMIT, and the
//! legacy-only INORDER) for both the legacy and current on-disk formats.
//!
//! The current format collapses legacy's INORDER/ADD distinction (legacy
//! used separate markers for "written by a checkpoint rewrite" vs "appended
//! by a transaction"; nothing downstream actually needed the distinction)
//! and replaces legacy's fixed per-kind shape with a small type bitmap, so a
//! record only carries the fields it needs: level/forward pointers, a
//! delete pointer (for REPLACE), a value, and whether that value is
//! compressed.

use crate::error::{Error, Result};
use crate::header::FormatVersion;
use crate::offset::RecordOffset;

/// The semantic kind of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    /// The permanent head-of-list sentinel, one per file, immediately after
    /// the header.
    Dummy,
    /// A live key/value entry (or, with a delete pointer set, a REPLACE of
    /// an earlier version of the same key).
    Add,
    /// A tombstone: unstitches a key without allocating a level/value body.
    Delete,
    /// A transaction commit marker in the WAL region.
    Commit,
    /// Legacy-only: a record rewritten into the in-order region by a
    /// checkpoint. Functionally identical to `Add`; collapsed into `Add`
    /// when read from or written to the current format.
    InOrder,
}

impl RecordKind {
    /// Whether this kind carries a level + forward-pointer array.
    fn has_level(self) -> bool {
        matches!(self, RecordKind::Dummy | RecordKind::Add | RecordKind::InOrder)
    }

    /// Whether this kind carries a key.
    fn has_key(self) -> bool {
        matches!(self, RecordKind::Add | RecordKind::Delete | RecordKind::InOrder)
    }
}

const LEGACY_DUMMY: u8 = 0;
const LEGACY_INORDER: u8 = 1;
const LEGACY_ADD: u8 = 2;
const LEGACY_COMMIT: u8 = 3;
const LEGACY_DELETE: u8 = 4;

const CURRENT_KIND_MASK: u8 = 0b0000_0111;
const CURRENT_DUMMY: u8 = 0;
const CURRENT_ADD: u8 = 1;
const CURRENT_DELETE: u8 = 2;
const CURRENT_COMMIT: u8 = 3;

const FLAG_HAS_LEVEL: u8 = 1 << 3;
const FLAG_HAS_VALUE: u8 = 1 << 4;
const FLAG_HAS_DELETE_PTR: u8 = 1 << 5;
const FLAG_HAS_COMPRESS: u8 = 1 << 6;

/// A decoded record, version-agnostic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// The record's semantic kind.
    pub kind: RecordKind,
    /// Forward pointers, index 0 is level 0. Empty for kinds without a
    /// level (`Delete`, `Commit`).
    pub forward: Vec<RecordOffset>,
    /// For an `Add` record that REPLACEs an earlier version of the same
    /// key: the offset of the record being superseded, so an aborted
    /// transaction can unstitch this one and restitch that one.
    pub delete_pointer: Option<RecordOffset>,
    /// The key. Empty for `Dummy`/`Commit`.
    pub key: Vec<u8>,
    /// The value, if any. `Delete`/`Commit`/`Dummy` never carry one.
    pub value: Option<Vec<u8>>,
    /// Whether `value` is stored compressed on disk.
    pub compressed: bool,
}

impl Record {
    /// Builds the permanent DUMMY record for a freshly created file.
    #[must_use]
    pub fn dummy(max_level: u8) -> Self {
        Record {
            kind: RecordKind::Dummy,
            forward: vec![RecordOffset::NULL; usize::from(max_level) + 1],
            delete_pointer: None,
            key: Vec::new(),
            value: None,
            compressed: false,
        }
    }

    /// Builds a tombstone record naming `key`. Carries no level or value —
    /// the unstitch it represents is derived fresh from a search at replay
    /// time, not from anything stored here.
    #[must_use]
    pub fn delete(key: &[u8]) -> Self {
        Record {
            kind: RecordKind::Delete,
            forward: Vec::new(),
            delete_pointer: None,
            key: key.to_vec(),
            value: None,
            compressed: false,
        }
    }

    /// Builds a commit marker record.
    #[must_use]
    pub fn commit() -> Self {
        Record {
            kind: RecordKind::Commit,
            forward: Vec::new(),
            delete_pointer: None,
            key: Vec::new(),
            value: None,
            compressed: false,
        }
    }

    /// The record's level: the index of its highest populated forward
    /// pointer. `0` for records without a level.
    #[must_use]
    pub fn level(&self) -> u8 {
        self.forward.len().saturating_sub(1) as u8
    }
}

/// Size in bytes of a freshly-built DUMMY record for `version`/`max_level`,
/// used by [`crate::header::FileHeader::new`] to compute the initial
/// `log_start` without having to round-trip an actual encode.
#[must_use]
pub fn dummy_record_size(version: FormatVersion, max_level: u8) -> usize {
    encode(&Record::dummy(max_level), version).len()
}

fn offset_width(version: FormatVersion) -> usize {
    match version {
        FormatVersion::Legacy => 4,
        FormatVersion::Current => 8,
    }
}

fn write_offset(buf: &mut Vec<u8>, version: FormatVersion, offset: RecordOffset) {
    match version {
        FormatVersion::Legacy => {
            let truncated = u32::try_from(offset.get()).unwrap_or(u32::MAX);
            buf.extend_from_slice(&truncated.to_le_bytes());
        }
        FormatVersion::Current => buf.extend_from_slice(&offset.get().to_le_bytes()),
    }
}

fn read_offset(data: &[u8], pos: &mut usize, version: FormatVersion) -> Result<RecordOffset> {
    let width = offset_width(version);
    let slice = data
        .get(*pos..*pos + width)
        .ok_or_else(|| Error::internal("truncated record: offset"))?;
    *pos += width;
    let value = match version {
        FormatVersion::Legacy => u64::from(u32::from_le_bytes(slice.try_into().unwrap())),
        FormatVersion::Current => u64::from_le_bytes(slice.try_into().unwrap()),
    };
    Ok(RecordOffset(value))
}

/// Legacy (v1) length field: flat 32-bit, no extension scheme.
fn write_len_legacy(buf: &mut Vec<u8>, len: usize) {
    let truncated = u32::try_from(len).unwrap_or(u32::MAX);
    buf.extend_from_slice(&truncated.to_le_bytes());
}

fn read_len_legacy(data: &[u8], pos: &mut usize) -> Result<usize> {
    let slice = data
        .get(*pos..*pos + 4)
        .ok_or_else(|| Error::internal("truncated record: length"))?;
    *pos += 4;
    let value = u32::from_le_bytes(slice.try_into().unwrap());
    usize::try_from(value).map_err(|_| Error::internal("record length exceeds usize::MAX"))
}

const KEYLEN_SENTINEL: u16 = 0xFFFF;
const VALLEN_SENTINEL: u32 = 0xFFFF_FFFF;

/// Writes the 2-byte inline keylen. Returns whether the 8-byte extension
/// word must follow (the keylen is too large to fit inline).
fn write_keylen_inline(buf: &mut Vec<u8>, len: usize) -> bool {
    if len >= usize::from(KEYLEN_SENTINEL) {
        buf.extend_from_slice(&KEYLEN_SENTINEL.to_le_bytes());
        true
    } else {
        buf.extend_from_slice(&(len as u16).to_le_bytes());
        false
    }
}

/// Writes the 4-byte inline vallen. Returns whether the 8-byte extension
/// word must follow.
fn write_vallen_inline(buf: &mut Vec<u8>, len: usize) -> bool {
    if len >= VALLEN_SENTINEL as usize {
        buf.extend_from_slice(&VALLEN_SENTINEL.to_le_bytes());
        true
    } else {
        buf.extend_from_slice(&(len as u32).to_le_bytes());
        false
    }
}

fn read_keylen_inline(data: &[u8], pos: &mut usize) -> Result<(usize, bool)> {
    let slice = data
        .get(*pos..*pos + 2)
        .ok_or_else(|| Error::internal("truncated record: keylen"))?;
    *pos += 2;
    let raw = u16::from_le_bytes(slice.try_into().unwrap());
    Ok((usize::from(raw), raw == KEYLEN_SENTINEL))
}

fn read_vallen_inline(data: &[u8], pos: &mut usize) -> Result<(usize, bool)> {
    let slice = data
        .get(*pos..*pos + 4)
        .ok_or_else(|| Error::internal("truncated record: vallen"))?;
    *pos += 4;
    let raw = u32::from_le_bytes(slice.try_into().unwrap());
    usize::try_from(raw).map(|v| (v, raw == VALLEN_SENTINEL)).map_err(|_| Error::internal("vallen overflow"))
}

fn read_len_ext(data: &[u8], pos: &mut usize) -> Result<usize> {
    let slice = data
        .get(*pos..*pos + 8)
        .ok_or_else(|| Error::internal("truncated record: length extension"))?;
    *pos += 8;
    let value = u64::from_le_bytes(slice.try_into().unwrap());
    usize::try_from(value).map_err(|_| Error::internal("record length exceeds usize::MAX"))
}

fn legacy_type_byte(kind: RecordKind) -> Result<u8> {
    Ok(match kind {
        RecordKind::Dummy => LEGACY_DUMMY,
        RecordKind::InOrder => LEGACY_INORDER,
        RecordKind::Add => LEGACY_ADD,
        RecordKind::Commit => LEGACY_COMMIT,
        RecordKind::Delete => LEGACY_DELETE,
    })
}

fn legacy_kind_from_byte(byte: u8) -> Result<RecordKind> {
    Ok(match byte {
        LEGACY_DUMMY => RecordKind::Dummy,
        LEGACY_INORDER => RecordKind::InOrder,
        LEGACY_ADD => RecordKind::Add,
        LEGACY_COMMIT => RecordKind::Commit,
        LEGACY_DELETE => RecordKind::Delete,
        other => return Err(Error::internal(format!("unknown legacy record type {other}"))),
    })
}

/// Maps a legacy record onto current-format semantics: INORDER collapses
/// into ADD (spec: "nothing downstream needs the distinction").
#[must_use]
pub fn collapse_legacy_kind(kind: RecordKind) -> RecordKind {
    if matches!(kind, RecordKind::InOrder) {
        RecordKind::Add
    } else {
        kind
    }
}

/// Encodes a record for the given on-disk version.
///
/// # Panics
///
/// Panics if `record.compressed` is set but the `compress` feature is not
/// compiled in; callers must check `cfg!(feature = "compress")` (or just
/// the feature-gated compression helpers in this module) before setting
/// that flag.
#[must_use]
pub fn encode(record: &Record, version: FormatVersion) -> Vec<u8> {
    match version {
        FormatVersion::Legacy => encode_legacy(record),
        FormatVersion::Current => encode_current(record),
    }
}

fn encode_legacy(record: &Record) -> Vec<u8> {
    let kind = record.kind;
    let mut head = Vec::new();
    head.push(legacy_type_byte(kind).expect("valid legacy kind"));

    if kind.has_level() {
        head.push(record.level());
        for ptr in &record.forward {
            write_offset(&mut head, FormatVersion::Legacy, *ptr);
        }
    }
    if let Some(ptr) = record.delete_pointer {
        write_offset(&mut head, FormatVersion::Legacy, ptr);
    }
    if kind.has_key() {
        write_len_legacy(&mut head, record.key.len());
    }
    if let Some(value) = &record.value {
        write_len_legacy(&mut head, value.len());
    }

    let mut buf = head;
    if kind.has_key() {
        buf.extend_from_slice(&record.key);
    }
    if let Some(value) = &record.value {
        buf.extend_from_slice(value);
    }

    let alignment = FormatVersion::Legacy.alignment();
    let padded_len = buf.len().div_ceil(alignment) * alignment;
    buf.resize(padded_len, 0);
    buf
}

/// Encodes a record in the current (v2) format, following the field order
/// of the on-disk layout: type, level, keylen(+ext), vallen(+ext),
/// delete_pointer, forward pointers, then the combined head/tail CRC pair
/// immediately before the key/value body.
///
/// # Panics
///
/// Panics if `record.compressed` is set but the `compress` feature is not
/// compiled in; callers must check `cfg!(feature = "compress")` (or just
/// the feature-gated compression helpers in this module) before setting
/// that flag.
fn encode_current(record: &Record) -> Vec<u8> {
    let kind = collapse_legacy_kind(record.kind);

    let mut type_byte = match kind {
        RecordKind::Dummy => CURRENT_DUMMY,
        RecordKind::Add | RecordKind::InOrder => CURRENT_ADD,
        RecordKind::Delete => CURRENT_DELETE,
        RecordKind::Commit => CURRENT_COMMIT,
    };
    if kind.has_level() {
        type_byte |= FLAG_HAS_LEVEL;
    }
    if record.value.is_some() {
        type_byte |= FLAG_HAS_VALUE;
    }
    if record.delete_pointer.is_some() {
        type_byte |= FLAG_HAS_DELETE_PTR;
    }
    if record.compressed {
        assert!(cfg!(feature = "compress"), "compressed record written without the compress feature");
        type_byte |= FLAG_HAS_COMPRESS;
    }

    let mut head = vec![type_byte];
    if kind.has_level() {
        head.push(record.level());
    }

    let keylen_needs_ext = if kind.has_key() { write_keylen_inline(&mut head, record.key.len()) } else { false };
    let vallen_needs_ext = if let Some(value) = &record.value {
        write_vallen_inline(&mut head, value.len())
    } else {
        false
    };
    if keylen_needs_ext {
        head.extend_from_slice(&(record.key.len() as u64).to_le_bytes());
    }
    if vallen_needs_ext {
        head.extend_from_slice(&(record.value.as_ref().map_or(0, Vec::len) as u64).to_le_bytes());
    }

    if let Some(ptr) = record.delete_pointer {
        write_offset(&mut head, FormatVersion::Current, ptr);
    }
    if kind.has_level() {
        for ptr in &record.forward {
            write_offset(&mut head, FormatVersion::Current, *ptr);
        }
    }

    let head_crc = crc32fast::hash(&head);

    let mut body = Vec::new();
    if kind.has_key() {
        body.extend_from_slice(&record.key);
    }
    if let Some(value) = &record.value {
        body.extend_from_slice(value);
    }

    let alignment = FormatVersion::Current.alignment();
    let unpadded_total = head.len() + 8 + body.len();
    let padded_total = unpadded_total.div_ceil(alignment) * alignment;
    body.resize(body.len() + (padded_total - unpadded_total), 0);
    let tail_crc = crc32fast::hash(&body);

    let mut buf = head;
    buf.extend_from_slice(&head_crc.to_le_bytes());
    buf.extend_from_slice(&tail_crc.to_le_bytes());
    buf.extend_from_slice(&body);
    buf
}

/// Decodes one record starting at the front of `data`. Returns the record
/// and the number of bytes it (including alignment padding) occupies, so
/// the caller can advance to the next record.
///
/// # Errors
///
/// Returns `Error::Internal` on truncation, an unknown type byte, a CRC
/// mismatch (current version only), or a compressed value encountered
/// without the `compress` feature compiled in.
pub fn decode(data: &[u8], version: FormatVersion) -> Result<(Record, usize)> {
    match version {
        FormatVersion::Legacy => decode_legacy(data),
        FormatVersion::Current => decode_current(data),
    }
}

fn decode_legacy(data: &[u8]) -> Result<(Record, usize)> {
    let mut pos = 0usize;
    let type_byte = *data.first().ok_or_else(|| Error::internal("empty record"))?;
    pos += 1;
    let kind = legacy_kind_from_byte(type_byte)?;

    let mut forward = Vec::new();
    if kind.has_level() {
        let level = *data
            .get(pos)
            .ok_or_else(|| Error::internal("truncated record: level"))?;
        pos += 1;
        for _ in 0..=level {
            forward.push(read_offset(data, &mut pos, FormatVersion::Legacy)?);
        }
    }

    let key_len = if kind.has_key() { read_len_legacy(data, &mut pos)? } else { 0 };
    let has_value = matches!(kind, RecordKind::Add | RecordKind::InOrder);
    let val_len = if has_value { read_len_legacy(data, &mut pos)? } else { 0 };

    let key = data
        .get(pos..pos + key_len)
        .ok_or_else(|| Error::internal("truncated record: key"))?
        .to_vec();
    pos += key_len;
    let value = if has_value {
        let v = data
            .get(pos..pos + val_len)
            .ok_or_else(|| Error::internal("truncated record: value"))?
            .to_vec();
        pos += val_len;
        Some(v)
    } else {
        None
    };

    let alignment = FormatVersion::Legacy.alignment();
    let total = pos.div_ceil(alignment) * alignment;
    if data.len() < total {
        return Err(Error::internal("truncated record: padding"));
    }

    Ok((
        Record {
            kind,
            forward,
            delete_pointer: None,
            key,
            value,
            compressed: false,
        },
        total,
    ))
}

fn decode_current(data: &[u8]) -> Result<(Record, usize)> {
    let mut pos = 0usize;
    let type_byte = *data.first().ok_or_else(|| Error::internal("empty record"))?;
    pos += 1;

    let kind = match type_byte & CURRENT_KIND_MASK {
        CURRENT_DUMMY => RecordKind::Dummy,
        CURRENT_ADD => RecordKind::Add,
        CURRENT_DELETE => RecordKind::Delete,
        CURRENT_COMMIT => RecordKind::Commit,
        other => return Err(Error::internal(format!("unknown current record kind {other}"))),
    };
    let has_level = type_byte & FLAG_HAS_LEVEL != 0;
    let has_value = type_byte & FLAG_HAS_VALUE != 0;
    let has_delete_ptr = type_byte & FLAG_HAS_DELETE_PTR != 0;
    let compressed = type_byte & FLAG_HAS_COMPRESS != 0;

    let level = if has_level {
        let l = *data
            .get(pos)
            .ok_or_else(|| Error::internal("truncated record: level"))?;
        pos += 1;
        l
    } else {
        0
    };

    let (key_len_inline, key_needs_ext) = if kind.has_key() { read_keylen_inline(data, &mut pos)? } else { (0, false) };
    let (val_len_inline, val_needs_ext) = if has_value { read_vallen_inline(data, &mut pos)? } else { (0, false) };
    let key_len = if key_needs_ext { read_len_ext(data, &mut pos)? } else { key_len_inline };
    let val_len = if val_needs_ext { read_len_ext(data, &mut pos)? } else { val_len_inline };

    let delete_pointer = if has_delete_ptr {
        Some(read_offset(data, &mut pos, FormatVersion::Current)?)
    } else {
        None
    };

    let mut forward = Vec::new();
    if has_level {
        for _ in 0..=level {
            forward.push(read_offset(data, &mut pos, FormatVersion::Current)?);
        }
    }

    let crc_pair = data
        .get(pos..pos + 8)
        .ok_or_else(|| Error::internal("truncated record: crc"))?;
    let stored_head_crc = u32::from_le_bytes(crc_pair[0..4].try_into().unwrap());
    let stored_tail_crc = u32::from_le_bytes(crc_pair[4..8].try_into().unwrap());
    let computed_head_crc = crc32fast::hash(&data[0..pos]);
    if stored_head_crc != computed_head_crc {
        return Err(Error::internal("record head CRC mismatch"));
    }
    pos += 8;

    let alignment = FormatVersion::Current.alignment();
    let unpadded_total = pos + key_len + val_len;
    let padded_total = unpadded_total.div_ceil(alignment) * alignment;
    let body_and_padding = data
        .get(pos..padded_total)
        .ok_or_else(|| Error::internal("truncated record: body"))?;
    let computed_tail_crc = crc32fast::hash(body_and_padding);
    if stored_tail_crc != computed_tail_crc {
        return Err(Error::internal("record tail CRC mismatch"));
    }

    let key = body_and_padding[0..key_len].to_vec();
    let raw_value = if has_value { Some(body_and_padding[key_len..key_len + val_len].to_vec()) } else { None };
    pos = padded_total;

    if compressed && !cfg!(feature = "compress") {
        return Err(Error::internal(
            "compressed record but this build has no compression support",
        ));
    }
    let value = match (raw_value, compressed) {
        (Some(bytes), true) => Some(decompress_value(&bytes)?),
        (Some(bytes), false) => Some(bytes),
        (None, _) => None,
    };

    Ok((
        Record {
            kind,
            forward,
            delete_pointer,
            key,
            value,
            compressed,
        },
        pos,
    ))
}

/// Compresses `value` with zstd. Only meaningful above a small size
/// threshold; below it the framing overhead isn't worth paying, so callers
/// (the skip-list insert path) should only compress when
/// `value.len() >= COMPRESS_MIN_SIZE`.
#[cfg(feature = "compress")]
pub const COMPRESS_MIN_SIZE: usize = 64;

#[cfg(feature = "compress")]
pub fn compress_value(value: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::encode_all(value, 0).map_err(Error::Io)
}

#[cfg(feature = "compress")]
fn decompress_value(bytes: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(bytes).map_err(Error::Io)
}

#[cfg(not(feature = "compress"))]
fn decompress_value(_bytes: &[u8]) -> Result<Vec<u8>> {
    Err(Error::internal(
        "compressed record but this build has no compression support",
    ))
}
