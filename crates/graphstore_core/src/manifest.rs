//! Database manifest: the settings fixed when a database is created.

use crate::error::{CoreError, CoreResult};
use crate::record::ByteOrder;
use crate::types::ChannelLayout;

/// Magic bytes for manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"GSMF";

/// Current manifest version.
pub const MANIFEST_VERSION: u16 = 1;

const ENCODED_LENGTH: usize = 4 + 2 + 2 + 2 + 4 + 1;

/// Database manifest.
///
/// ```text
/// | magic (4) | version (2) | format major (2) | format minor (2) |
/// | channel count (4) | byte order (1) |
/// ```
///
/// All integers are little endian regardless of the record byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Manifest {
    /// Format version (major, minor).
    pub format_version: (u16, u16),
    /// Number of channels, fixed for the database's lifetime.
    pub channel_count: u32,
    /// Byte order of record fields.
    pub byte_order: ByteOrder,
}

impl Manifest {
    /// Creates a manifest for a new database.
    #[must_use]
    pub fn new(channel_count: u32, byte_order: ByteOrder) -> Self {
        Self {
            format_version: (1, 0),
            channel_count,
            byte_order,
        }
    }

    /// The channel layout described by the manifest.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] if the stored count is not a
    /// power of two.
    pub fn layout(&self) -> CoreResult<ChannelLayout> {
        ChannelLayout::new(self.channel_count).ok_or_else(|| {
            CoreError::invalid_format(format!(
                "manifest channel count {} is not a power of two",
                self.channel_count
            ))
        })
    }

    /// Encodes the manifest to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENCODED_LENGTH);
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.format_version.0.to_le_bytes());
        buf.extend_from_slice(&self.format_version.1.to_le_bytes());
        buf.extend_from_slice(&self.channel_count.to_le_bytes());
        buf.push(self.byte_order.as_byte());
        buf
    }

    /// Decodes a manifest from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] for a wrong magic, a newer
    /// version, a short buffer or an unknown byte order.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < 4 || data[0..4] != MANIFEST_MAGIC {
            return Err(CoreError::invalid_format("invalid manifest magic"));
        }
        if data.len() < ENCODED_LENGTH {
            return Err(CoreError::invalid_format("manifest too short"));
        }
        let u16_at = |at: usize| u16::from_le_bytes([data[at], data[at + 1]]);

        let version = u16_at(4);
        if version > MANIFEST_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported manifest version: {version}"
            )));
        }
        let format_version = (u16_at(6), u16_at(8));
        let channel_count = u32::from_le_bytes([data[10], data[11], data[12], data[13]]);
        let byte_order = ByteOrder::from_byte(data[14]).ok_or_else(|| {
            CoreError::invalid_format(format!("unknown byte order code {}", data[14]))
        })?;

        let manifest = Self {
            format_version,
            channel_count,
            byte_order,
        };
        manifest.layout()?;
        Ok(manifest)
    }
}
