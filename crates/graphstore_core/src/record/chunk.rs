//! Validated sequences of entity records.

use super::{ByteOrder, EntityRecord, RECORD_HEADER_LENGTH};
use crate::error::{CoreError, CoreResult};
use crate::types::ChannelLayout;

/// An owned concatenation of entity records.
///
/// Chunks are the unit of exchange with callers: stores take one, loads
/// return one. Construction validates every record header, so iteration
/// cannot fail.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkBuffer {
    bytes: Vec<u8>,
    order: ByteOrder,
    record_count: usize,
}

impl ChunkBuffer {
    /// Creates an empty chunk.
    #[must_use]
    pub fn new(order: ByteOrder) -> Self {
        Self {
            bytes: Vec::new(),
            order,
            record_count: 0,
        }
    }

    /// Validates `bytes` as a sequence of records.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecord`] for a record whose length is
    /// smaller than the header or runs past the end, or for a null object id.
    pub fn from_bytes(bytes: Vec<u8>, order: ByteOrder) -> CoreResult<Self> {
        let mut offset = 0;
        let mut record_count = 0;
        while offset < bytes.len() {
            let length = order
                .read_u64(&bytes, offset)
                .ok_or_else(|| CoreError::invalid_record(offset, "truncated length field"))?;
            let remaining = (bytes.len() - offset) as u64;
            if length < RECORD_HEADER_LENGTH as u64 || length > remaining {
                return Err(CoreError::invalid_record(
                    offset,
                    format!("record length {length} outside 24..={remaining}"),
                ));
            }
            let end = offset + length as usize;
            let record = EntityRecord::parse(&bytes[offset..end], order)
                .ok_or_else(|| CoreError::invalid_record(offset, "malformed header"))?;
            if record.object_id().is_null() {
                return Err(CoreError::invalid_record(offset, "null object id"));
            }
            offset = end;
            record_count += 1;
        }
        Ok(Self {
            bytes,
            order,
            record_count,
        })
    }

    /// Appends one record that is already known to be well formed.
    pub(crate) fn push(&mut self, record: EntityRecord<'_>) {
        self.bytes.extend_from_slice(record.as_bytes());
        self.record_count += 1;
    }

    /// Appends all records of `other`.
    pub fn extend(&mut self, other: &ChunkBuffer) {
        self.bytes.extend_from_slice(&other.bytes);
        self.record_count += other.record_count;
    }

    /// Iterates the records in order.
    #[must_use]
    pub fn records(&self) -> ChunkRecords<'_> {
        ChunkRecords {
            bytes: &self.bytes,
            order: self.order,
            offset: 0,
        }
    }

    /// Number of records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Total byte length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` when the chunk holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Field byte order.
    #[must_use]
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// The raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the chunk, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Partitions the records by owning channel, preserving order within
    /// each channel.
    #[must_use]
    pub fn split_by_channel(&self, layout: ChannelLayout) -> Vec<ChunkBuffer> {
        let mut parts: Vec<ChunkBuffer> = layout
            .channels()
            .map(|_| ChunkBuffer::new(self.order))
            .collect();
        for record in self.records() {
            let channel = layout.channel_of(record.object_id());
            parts[channel.as_usize()].push(record);
        }
        parts
    }
}

/// Iterator over the records of a [`ChunkBuffer`].
#[derive(Debug, Clone)]
pub struct ChunkRecords<'a> {
    bytes: &'a [u8],
    order: ByteOrder,
    offset: usize,
}

impl<'a> Iterator for ChunkRecords<'a> {
    type Item = EntityRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let length = self.order.read_u64(self.bytes, self.offset)? as usize;
        let end = self.offset.checked_add(length)?;
        let record = EntityRecord::parse(self.bytes.get(self.offset..end)?, self.order)?;
        self.offset = end;
        Some(record)
    }
}
