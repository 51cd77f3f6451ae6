//! Transactions log entry format.

use std::fmt;

/// Entry kinds, as stored in the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryKind {
    /// A data file was created.
    FileCreation = 0,
    /// A store appended to the head file.
    Store = 1,
    /// Live entities were copied into the head file.
    Transfer = 2,
    /// A data file was cut back.
    FileTruncation = 3,
    /// A data file was deleted.
    FileDeletion = 4,
}

impl EntryKind {
    /// Decodes a type byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::FileCreation),
            1 => Some(Self::Store),
            2 => Some(Self::Transfer),
            3 => Some(Self::FileTruncation),
            4 => Some(Self::FileDeletion),
            _ => None,
        }
    }

    /// Encoded entry length for this kind, including the two prefix bytes.
    #[must_use]
    pub const fn encoded_length(self) -> usize {
        match self {
            Self::Store => 18,
            Self::FileCreation | Self::FileDeletion => 26,
            Self::Transfer | Self::FileTruncation => 34,
        }
    }

    /// Lower-case name used in dumps.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::FileCreation => "file-creation",
            Self::Store => "store",
            Self::Transfer => "transfer",
            Self::FileTruncation => "file-truncation",
            Self::FileDeletion => "file-deletion",
        }
    }
}

/// One record of a channel's transactions log.
///
/// Encoded little-endian as
///
/// ```text
/// | length (1) | kind (1) | timestamp (8) | file length (8) | file number (8) | extra (8) |
/// ```
///
/// where each kind stores only the fields it uses: a store omits the file
/// number (it always targets the head file), and only transfers (source
/// offset) and truncations (old length) carry the extra word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEntry {
    /// A new, empty or pre-filled, data file became the head file.
    FileCreation {
        /// When it happened.
        timestamp: u64,
        /// The new file's number.
        file_number: u64,
        /// Its length at creation.
        length: u64,
    },
    /// A store made the head file this long.
    Store {
        /// The store's timestamp, shared by all channels.
        timestamp: u64,
        /// Head file length after the store.
        head_length: u64,
    },
    /// A contiguous run was copied from a source file into the head file.
    Transfer {
        /// When it happened.
        timestamp: u64,
        /// Head file length after the copy.
        head_length: u64,
        /// File the run was copied from.
        source_file: u64,
        /// Offset of the run in the source file.
        source_offset: u64,
    },
    /// A data file was cut back to `new_length`.
    FileTruncation {
        /// When it happened.
        timestamp: u64,
        /// The truncated file.
        file_number: u64,
        /// Length after truncation.
        new_length: u64,
        /// Length before truncation.
        old_length: u64,
    },
    /// A data file is about to be physically deleted.
    FileDeletion {
        /// When it happened.
        timestamp: u64,
        /// The deleted file.
        file_number: u64,
        /// Its length at deletion.
        final_length: u64,
    },
}

/// Why bytes could not be decoded as an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryError {
    /// Fewer bytes remain than the entry needs. Tolerated at the log tail.
    Truncated,
    /// The length byte is zero.
    ZeroLength,
    /// The kind byte is unknown.
    UnknownKind(u8),
    /// The length byte does not match the kind.
    LengthMismatch {
        /// Kind found.
        kind: EntryKind,
        /// Length byte found.
        length: u8,
    },
}

impl fmt::Display for EntryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated entry"),
            Self::ZeroLength => write!(f, "entry length is zero"),
            Self::UnknownKind(byte) => write!(f, "unknown entry kind {byte}"),
            Self::LengthMismatch { kind, length } => write!(
                f,
                "{} entry has length {length}, expected {}",
                kind.name(),
                kind.encoded_length()
            ),
        }
    }
}

impl TransactionEntry {
    /// The entry's kind.
    #[must_use]
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::FileCreation { .. } => EntryKind::FileCreation,
            Self::Store { .. } => EntryKind::Store,
            Self::Transfer { .. } => EntryKind::Transfer,
            Self::FileTruncation { .. } => EntryKind::FileTruncation,
            Self::FileDeletion { .. } => EntryKind::FileDeletion,
        }
    }

    /// The entry's timestamp.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        match *self {
            Self::FileCreation { timestamp, .. }
            | Self::Store { timestamp, .. }
            | Self::Transfer { timestamp, .. }
            | Self::FileTruncation { timestamp, .. }
            | Self::FileDeletion { timestamp, .. } => timestamp,
        }
    }

    /// Appends the encoded entry to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let kind = self.kind();
        buf.push(kind.encoded_length() as u8);
        buf.push(kind as u8);
        let mut word = |value: u64| buf.extend_from_slice(&value.to_le_bytes());
        match *self {
            Self::FileCreation {
                timestamp,
                file_number,
                length,
            } => {
                word(timestamp);
                word(length);
                word(file_number);
            }
            Self::Store {
                timestamp,
                head_length,
            } => {
                word(timestamp);
                word(head_length);
            }
            Self::Transfer {
                timestamp,
                head_length,
                source_file,
                source_offset,
            } => {
                word(timestamp);
                word(head_length);
                word(source_file);
                word(source_offset);
            }
            Self::FileTruncation {
                timestamp,
                file_number,
                new_length,
                old_length,
            } => {
                word(timestamp);
                word(new_length);
                word(file_number);
                word(old_length);
            }
            Self::FileDeletion {
                timestamp,
                file_number,
                final_length,
            } => {
                word(timestamp);
                word(final_length);
                word(file_number);
            }
        }
    }

    /// Encodes the entry.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.kind().encoded_length());
        self.encode_into(&mut buf);
        buf
    }

    /// Decodes the entry at the start of `bytes`, returning it and its
    /// encoded length.
    ///
    /// # Errors
    ///
    /// Returns [`EntryError::Truncated`] if `bytes` ends inside the entry,
    /// and a structural error otherwise.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), EntryError> {
        let (&length, rest) = bytes.split_first().ok_or(EntryError::Truncated)?;
        if length == 0 {
            return Err(EntryError::ZeroLength);
        }
        let &kind_byte = rest.first().ok_or(EntryError::Truncated)?;
        let kind = EntryKind::from_byte(kind_byte).ok_or(EntryError::UnknownKind(kind_byte))?;
        if usize::from(length) != kind.encoded_length() {
            return Err(EntryError::LengthMismatch { kind, length });
        }
        let body = bytes
            .get(2..usize::from(length))
            .ok_or(EntryError::Truncated)?;
        let word = |index: usize| -> u64 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&body[index * 8..index * 8 + 8]);
            u64::from_le_bytes(raw)
        };

        let entry = match kind {
            EntryKind::FileCreation => Self::FileCreation {
                timestamp: word(0),
                length: word(1),
                file_number: word(2),
            },
            EntryKind::Store => Self::Store {
                timestamp: word(0),
                head_length: word(1),
            },
            EntryKind::Transfer => Self::Transfer {
                timestamp: word(0),
                head_length: word(1),
                source_file: word(2),
                source_offset: word(3),
            },
            EntryKind::FileTruncation => Self::FileTruncation {
                timestamp: word(0),
                new_length: word(1),
                file_number: word(2),
                old_length: word(3),
            },
            EntryKind::FileDeletion => Self::FileDeletion {
                timestamp: word(0),
                final_length: word(1),
                file_number: word(2),
            },
        };
        Ok((entry, usize::from(length)))
    }
}

impl fmt::Display for TransactionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::FileCreation {
                timestamp,
                file_number,
                length,
            } => write!(f, "{timestamp} file-creation file={file_number} length={length}"),
            Self::Store {
                timestamp,
                head_length,
            } => write!(f, "{timestamp} store head-length={head_length}"),
            Self::Transfer {
                timestamp,
                head_length,
                source_file,
                source_offset,
            } => write!(
                f,
                "{timestamp} transfer head-length={head_length} source={source_file}@{source_offset}"
            ),
            Self::FileTruncation {
                timestamp,
                file_number,
                new_length,
                old_length,
            } => write!(
                f,
                "{timestamp} file-truncation file={file_number} {old_length}->{new_length}"
            ),
            Self::FileDeletion {
                timestamp,
                file_number,
                final_length,
            } => write!(f, "{timestamp} file-deletion file={file_number} length={final_length}"),
        }
    }
}
