//! Error types for the storage engine.

use crate::types::{ChannelIndex, ObjectId, TypeId};
use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the storage engine.
///
/// Timeouts and unfinished incremental work are not errors; those are
/// reported through `bool` return values.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Byte-store failure.
    #[error("storage error: {0}")]
    Storage(#[from] graphstore_storage::StorageError),

    /// I/O failure outside a byte store (directories, manifest, export).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Persistent or in-memory state contradicts itself. Fatal for the
    /// channel that detects it.
    #[error("consistency violation in {channel}: {message}")]
    Consistency {
        /// Channel that detected the violation.
        channel: ChannelIndex,
        /// Description of the violation.
        message: String,
    },

    /// Marking reached an object id that no channel holds, and the zombie
    /// policy escalates that.
    #[error("zombie object id {oid} referenced during marking")]
    ZombieObjectId {
        /// The unresolvable id.
        oid: ObjectId,
    },

    /// A record names a type without a registered descriptor.
    #[error("unknown type {type_id}")]
    UnknownType {
        /// The unregistered type.
        type_id: TypeId,
    },

    /// A caller-supplied chunk is not a sequence of well-formed records.
    #[error("invalid entity record at offset {offset}: {message}")]
    InvalidRecord {
        /// Offset of the bad record within the chunk.
        offset: usize,
        /// What is wrong with it.
        message: String,
    },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Which setting is wrong.
        message: String,
    },

    /// Manifest or directory does not look like a graphstore database.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Another process holds the directory lock.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// A channel stopped after a fatal error and accepts no more work.
    #[error("{channel} stopped after a fatal error")]
    ChannelStopped {
        /// The stopped channel.
        channel: ChannelIndex,
    },

    /// The database is shutting down or already closed.
    #[error("database is shut down")]
    Shutdown,
}

impl CoreError {
    /// Creates a consistency violation.
    pub fn consistency(channel: ChannelIndex, message: impl Into<String>) -> Self {
        Self::Consistency {
            channel,
            message: message.into(),
        }
    }

    /// Creates an invalid record error.
    pub fn invalid_record(offset: usize, message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            offset,
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Returns `true` for errors after which a channel must not continue:
    /// consistency violations and escalated zombies.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Consistency { .. } | Self::ZombieObjectId { .. } | Self::ChannelStopped { .. }
        )
    }
}
