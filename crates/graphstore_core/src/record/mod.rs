//! Binary entity records.
//!
//! Every persisted object version is one self-describing record:
//!
//! ```text
//! | length (8) | type id (8) | object id (8) | body (length - 24) |
//! ```
//!
//! `length` counts the whole record including the header. Data files are
//! plain concatenations of records. A length with the sign bit set is a
//! gap: `|length|` bytes of dead space that replay skips.
//!
//! Field byte order is fixed per database (see [`ByteOrder`]). All
//! accessors here are bounds checked and return `None` instead of
//! panicking on short input.

mod chunk;

pub use chunk::{ChunkBuffer, ChunkRecords};

use crate::types::{ObjectId, TypeId};

/// Length of the fixed record header.
pub const RECORD_HEADER_LENGTH: usize = 24;

/// Smallest gap that can be encoded: the length field alone.
pub const MINIMUM_GAP_LENGTH: u64 = 8;

/// Byte order of record header and body fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Least significant byte first.
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

impl ByteOrder {
    /// Reads a `u64` at `offset`, or `None` if fewer than 8 bytes remain.
    #[must_use]
    pub fn read_u64(self, bytes: &[u8], offset: usize) -> Option<u64> {
        let end = offset.checked_add(8)?;
        let raw: [u8; 8] = bytes.get(offset..end)?.try_into().ok()?;
        Some(match self {
            Self::Little => u64::from_le_bytes(raw),
            Self::Big => u64::from_be_bytes(raw),
        })
    }

    /// Encodes a `u64`.
    #[must_use]
    pub fn encode_u64(self, value: u64) -> [u8; 8] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    /// Stable one-byte code used in the manifest.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Little => 0,
            Self::Big => 1,
        }
    }

    /// Decodes [`ByteOrder::as_byte`].
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Little),
            1 => Some(Self::Big),
            _ => None,
        }
    }
}

/// A borrowed, header-validated entity record.
#[derive(Debug, Clone, Copy)]
pub struct EntityRecord<'a> {
    bytes: &'a [u8],
    order: ByteOrder,
}

impl<'a> EntityRecord<'a> {
    /// Views `bytes` as exactly one record.
    ///
    /// Returns `None` if the slice is shorter than a header or its length
    /// field does not equal the slice length.
    #[must_use]
    pub fn parse(bytes: &'a [u8], order: ByteOrder) -> Option<Self> {
        if bytes.len() < RECORD_HEADER_LENGTH {
            return None;
        }
        let length = order.read_u64(bytes, 0)?;
        if length != bytes.len() as u64 {
            return None;
        }
        Some(Self { bytes, order })
    }

    /// Total record length including the header.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// The record's type.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        TypeId(self.order.read_u64(self.bytes, 8).unwrap_or_default())
    }

    /// The record's object id.
    #[must_use]
    pub fn object_id(&self) -> ObjectId {
        ObjectId(self.order.read_u64(self.bytes, 16).unwrap_or_default())
    }

    /// Field data after the header.
    #[must_use]
    pub fn body(&self) -> &'a [u8] {
        &self.bytes[RECORD_HEADER_LENGTH..]
    }

    /// Reads a `u64` body field at `offset` (relative to the body).
    #[must_use]
    pub fn body_u64(&self, offset: usize) -> Option<u64> {
        self.order.read_u64(self.body(), offset)
    }

    /// The complete record bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Byte order the record was read with.
    #[must_use]
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }
}

/// One slot of a data file: a record or a gap.
#[derive(Debug, Clone, Copy)]
pub enum FileSlot<'a> {
    /// A live-or-superseded entity record.
    Entity(EntityRecord<'a>),
    /// Dead space of the given length.
    Gap(u64),
}

/// Why a data file could not be scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// A record claims zero length.
    ZeroLength {
        /// Offset of the record.
        offset: u64,
    },
    /// A record is shorter than its header or runs past the end.
    Malformed {
        /// Offset of the record.
        offset: u64,
        /// The decoded length.
        length: u64,
    },
}

/// Walks the slots of a data file image in file order.
///
/// Yields `(offset, slot)` pairs and stops after the first error.
pub fn scan_file(bytes: &[u8], order: ByteOrder) -> FileScanner<'_> {
    FileScanner {
        bytes,
        order,
        offset: 0,
        failed: false,
    }
}

/// Iterator returned by [`scan_file`].
#[derive(Debug)]
pub struct FileScanner<'a> {
    bytes: &'a [u8],
    order: ByteOrder,
    offset: usize,
    failed: bool,
}

impl<'a> Iterator for FileScanner<'a> {
    type Item = Result<(u64, FileSlot<'a>), ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.bytes.len() {
            return None;
        }
        let offset = self.offset as u64;
        let remaining = (self.bytes.len() - self.offset) as u64;
        let Some(raw) = self.order.read_u64(self.bytes, self.offset) else {
            self.failed = true;
            return Some(Err(ScanError::Malformed {
                offset,
                length: remaining,
            }));
        };

        let signed = raw as i64;
        if signed == 0 {
            self.failed = true;
            return Some(Err(ScanError::ZeroLength { offset }));
        }
        if signed < 0 {
            let length = signed.unsigned_abs();
            if length < MINIMUM_GAP_LENGTH || length > remaining {
                self.failed = true;
                return Some(Err(ScanError::Malformed { offset, length }));
            }
            self.offset += length as usize;
            return Some(Ok((offset, FileSlot::Gap(length))));
        }

        let length = raw;
        if length < RECORD_HEADER_LENGTH as u64 || length > remaining {
            self.failed = true;
            return Some(Err(ScanError::Malformed { offset, length }));
        }
        let end = self.offset + length as usize;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        match EntityRecord::parse(slice, self.order) {
            Some(record) => Some(Ok((offset, FileSlot::Entity(record)))),
            None => {
                self.failed = true;
                Some(Err(ScanError::Malformed { offset, length }))
            }
        }
    }
}

/// Encodes a gap of `length` bytes (at least [`MINIMUM_GAP_LENGTH`]).
#[must_use]
pub fn encode_gap(length: u64, order: ByteOrder) -> Vec<u8> {
    let length = length.max(MINIMUM_GAP_LENGTH);
    let mut bytes = vec![0u8; length as usize];
    let marker = (length as i64).wrapping_neg() as u64;
    bytes[..8].copy_from_slice(&order.encode_u64(marker));
    bytes
}

/// Builds owned entity records.
///
/// ```rust
/// use graphstore_core::{ByteOrder, EntityRecord, ObjectId, RecordBuilder, TypeId};
///
/// let bytes = RecordBuilder::new(TypeId(7), ObjectId(42))
///     .raw(&[1, 2, 3])
///     .build(ByteOrder::Little);
/// let record = EntityRecord::parse(&bytes, ByteOrder::Little).unwrap();
/// assert_eq!(record.body(), &[1, 2, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    type_id: TypeId,
    object_id: ObjectId,
    body: Vec<FieldPart>,
}

#[derive(Debug, Clone)]
enum FieldPart {
    Word(u64),
    Raw(Vec<u8>),
}

impl RecordBuilder {
    /// Starts a record for `object_id` of type `type_id`.
    #[must_use]
    pub fn new(type_id: TypeId, object_id: ObjectId) -> Self {
        Self {
            type_id,
            object_id,
            body: Vec::new(),
        }
    }

    /// Appends a `u64` field.
    #[must_use]
    pub fn word(mut self, value: u64) -> Self {
        self.body.push(FieldPart::Word(value));
        self
    }

    /// Appends a reference field.
    #[must_use]
    pub fn reference(self, oid: ObjectId) -> Self {
        self.word(oid.0)
    }

    /// Appends a variable reference list: a count followed by the ids.
    #[must_use]
    pub fn references(mut self, oids: &[ObjectId]) -> Self {
        self.body.push(FieldPart::Word(oids.len() as u64));
        for oid in oids {
            self.body.push(FieldPart::Word(oid.0));
        }
        self
    }

    /// Appends raw bytes.
    #[must_use]
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.body.push(FieldPart::Raw(bytes.to_vec()));
        self
    }

    /// Encodes the record.
    #[must_use]
    pub fn build(&self, order: ByteOrder) -> Vec<u8> {
        let body_length: usize = self
            .body
            .iter()
            .map(|part| match part {
                FieldPart::Word(_) => 8,
                FieldPart::Raw(bytes) => bytes.len(),
            })
            .sum();
        let length = RECORD_HEADER_LENGTH + body_length;

        let mut bytes = Vec::with_capacity(length);
        bytes.extend_from_slice(&order.encode_u64(length as u64));
        bytes.extend_from_slice(&order.encode_u64(self.type_id.0));
        bytes.extend_from_slice(&order.encode_u64(self.object_id.0));
        for part in &self.body {
            match part {
                FieldPart::Word(value) => bytes.extend_from_slice(&order.encode_u64(*value)),
                FieldPart::Raw(raw) => bytes.extend_from_slice(raw),
            }
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_in_both_orders() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let bytes = RecordBuilder::new(TypeId(7), ObjectId(42))
                .word(99)
                .build(order);
            let record = EntityRecord::parse(&bytes, order).unwrap();
            assert_eq!(record.length(), 32);
            assert_eq!(record.type_id(), TypeId(7));
            assert_eq!(record.object_id(), ObjectId(42));
            assert_eq!(record.body_u64(0), Some(99));
            assert_eq!(record.body_u64(1), None);
        }
    }

    #[test]
    fn parse_rejects_length_mismatch() {
        let mut bytes = RecordBuilder::new(TypeId(1), ObjectId(1)).build(ByteOrder::Little);
        assert!(EntityRecord::parse(&bytes[..20], ByteOrder::Little).is_none());
        bytes.push(0);
        assert!(EntityRecord::parse(&bytes, ByteOrder::Little).is_none());
    }

    #[test]
    fn scan_skips_gaps() {
        let order = ByteOrder::Big;
        let mut image = RecordBuilder::new(TypeId(1), ObjectId(4)).build(order);
        image.extend(encode_gap(40, order));
        image.extend(RecordBuilder::new(TypeId(1), ObjectId(8)).raw(&[9]).build(order));

        let slots: Vec<_> = scan_file(&image, order).collect::<Result<_, _>>().unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].0, 0);
        assert!(matches!(slots[1], (24, FileSlot::Gap(40))));
        match slots[2] {
            (64, FileSlot::Entity(record)) => assert_eq!(record.object_id(), ObjectId(8)),
            other => panic!("unexpected slot {other:?}"),
        }
    }

    #[test]
    fn scan_reports_zero_length() {
        let image = vec![0u8; 24];
        let result: Vec<_> = scan_file(&image, ByteOrder::Little).collect();
        assert!(matches!(
            result.as_slice(),
            [Err(ScanError::ZeroLength { offset: 0 })]
        ));
    }

    #[test]
    fn scan_reports_overrun() {
        let mut image = RecordBuilder::new(TypeId(1), ObjectId(4))
            .raw(&[1; 16])
            .build(ByteOrder::Little);
        image.truncate(30);
        let result: Vec<_> = scan_file(&image, ByteOrder::Little).collect();
        assert!(matches!(
            result.as_slice(),
            [Err(ScanError::Malformed { offset: 0, length: 40 })]
        ));
    }

    #[test]
    fn byte_order_codes_round_trip() {
        assert_eq!(ByteOrder::from_byte(ByteOrder::Big.as_byte()), Some(ByteOrder::Big));
        assert_eq!(ByteOrder::from_byte(7), None);
    }
}
