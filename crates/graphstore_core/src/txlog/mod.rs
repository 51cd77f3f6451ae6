//! Per-channel transactions log.
//!
//! Every change to a channel's data-file chain is described by an entry in
//! its transactions log before (or, for appends, right after) the change
//! reaches the files. Recovery replays the log into a
//! [`TransactionsAnalysis`] and cuts the files back to what the log vouches
//! for.
//!
//! ## Entry Format
//!
//! ```text
//! | length (1) | kind (1) | timestamp (8) | file length (8) | file number (8) | extra (8) |
//! ```
//!
//! Entries are fixed-size per kind and little-endian regardless of the
//! data files' byte order.
//!
//! ## Recovery Policy
//!
//! - **Truncated tail**: an entry cut short at the end of the log is a crash
//!   mid-append. It is dropped and the log is truncated to the last whole
//!   entry.
//! - **Zero length, unknown kind, wrong length**: corruption. Opening fails.
//!
//! ## Invariants
//!
//! - the log is append-only except for tail repair and compaction
//! - a file is logged deleted before it disappears from disk
//! - a truncation is logged before the file is cut

mod analysis;
mod entry;

pub use analysis::{LoggedFile, StoreMark, TransactionsAnalysis};
pub use entry::{EntryError, EntryKind, TransactionEntry};

use crate::error::{CoreError, CoreResult};
use graphstore_storage::StorageBackend;

/// Entries parsed from a log image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogContents {
    /// Whole entries in log order.
    pub entries: Vec<TransactionEntry>,
    /// Byte length covered by `entries`.
    pub valid_length: u64,
    /// Bytes after `valid_length`, belonging to a torn entry.
    pub torn_bytes: u64,
}

/// Parses a log image.
///
/// # Errors
///
/// Returns [`CoreError::InvalidFormat`] for a structurally corrupt entry.
/// A torn final entry is not an error.
pub fn parse_log(bytes: &[u8]) -> CoreResult<LogContents> {
    let mut contents = LogContents::default();
    let mut offset = 0usize;
    while offset < bytes.len() {
        match TransactionEntry::decode(&bytes[offset..]) {
            Ok((entry, length)) => {
                contents.entries.push(entry);
                offset += length;
            }
            Err(EntryError::Truncated) => break,
            Err(err) => {
                return Err(CoreError::invalid_format(format!(
                    "transactions log entry at offset {offset}: {err}"
                )))
            }
        }
    }
    contents.valid_length = offset as u64;
    contents.torn_bytes = (bytes.len() - offset) as u64;
    Ok(contents)
}

/// Encodes `entries` back to back.
#[must_use]
pub fn encode_log(entries: &[TransactionEntry]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(entries.iter().map(|e| e.kind().encoded_length()).sum());
    for entry in entries {
        entry.encode_into(&mut bytes);
    }
    bytes
}

/// Appends entries to one channel's transactions log.
pub struct TransactionLog {
    backend: Box<dyn StorageBackend>,
    sync_on_write: bool,
    entry_count: usize,
}

impl std::fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLog")
            .field("sync_on_write", &self.sync_on_write)
            .field("entry_count", &self.entry_count)
            .finish_non_exhaustive()
    }
}

impl TransactionLog {
    /// Wraps an empty or freshly compacted log.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_write: bool, entry_count: usize) -> Self {
        Self {
            backend,
            sync_on_write,
            entry_count,
        }
    }

    /// Opens an existing log, dropping a torn tail entry.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors and on corrupt entries.
    pub fn open(
        mut backend: Box<dyn StorageBackend>,
        sync_on_write: bool,
    ) -> CoreResult<(Self, Vec<TransactionEntry>)> {
        let contents = parse_log(&backend.read_all()?)?;
        if contents.torn_bytes > 0 {
            tracing::warn!(
                valid_length = contents.valid_length,
                torn_bytes = contents.torn_bytes,
                "dropping torn transactions log tail"
            );
            backend.truncate(contents.valid_length)?;
        }
        let log = Self::new(backend, sync_on_write, contents.entries.len());
        Ok((log, contents.entries))
    }

    /// Appends one entry, syncing it if configured.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn append(&mut self, entry: &TransactionEntry) -> CoreResult<()> {
        self.backend.append(&entry.encode())?;
        if self.sync_on_write {
            self.backend.sync()?;
        } else {
            self.backend.flush()?;
        }
        self.entry_count += 1;
        tracing::trace!(%entry, "logged");
        Ok(())
    }

    /// Current log length in bytes.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Entries written since the log was opened or compacted, plus those
    /// read at open.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Reads back every entry.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors and on corrupt entries.
    pub fn read_entries(&self) -> CoreResult<Vec<TransactionEntry>> {
        Ok(parse_log(&self.backend.read_all()?)?.entries)
    }

    /// Forces the log to durable storage.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn sync(&mut self) -> CoreResult<()> {
        self.backend.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphstore_storage::InMemoryBackend;

    fn store(timestamp: u64, head_length: u64) -> TransactionEntry {
        TransactionEntry::Store {
            timestamp,
            head_length,
        }
    }

    #[test]
    fn append_then_reopen() {
        let backend = InMemoryBackend::new();
        let buffer = backend.buffer();
        let (mut log, entries) = TransactionLog::open(Box::new(backend), false).unwrap();
        assert!(entries.is_empty());
        log.append(&store(1, 10)).unwrap();
        log.append(&store(2, 20)).unwrap();
        assert_eq!(log.size().unwrap(), 36);

        let (log, entries) =
            TransactionLog::open(Box::new(InMemoryBackend::shared(buffer)), false).unwrap();
        assert_eq!(entries, vec![store(1, 10), store(2, 20)]);
        assert_eq!(log.entry_count(), 2);
    }

    #[test]
    fn torn_tail_is_cut() {
        let mut bytes = encode_log(&[store(1, 10), store(2, 20)]);
        bytes.truncate(bytes.len() - 5);
        let backend = InMemoryBackend::with_data(bytes);
        let buffer = backend.buffer();

        let (_, entries) = TransactionLog::open(Box::new(backend), true).unwrap();
        assert_eq!(entries, vec![store(1, 10)]);
        assert_eq!(buffer.read().len(), 18);
    }

    #[test]
    fn corrupt_entry_fails_open() {
        let mut bytes = encode_log(&[store(1, 10)]);
        bytes.extend_from_slice(&[18, 7, 0, 0]);
        let result = TransactionLog::open(Box::new(InMemoryBackend::with_data(bytes)), false);
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn parse_reports_lengths() {
        let mut bytes = encode_log(&[store(1, 10)]);
        bytes.push(26);
        let contents = parse_log(&bytes).unwrap();
        assert_eq!(contents.valid_length, 18);
        assert_eq!(contents.torn_bytes, 1);
    }
}
