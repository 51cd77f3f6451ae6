//! Folding a transactions log into the file inventory it describes.

use super::entry::TransactionEntry;
use crate::error::{CoreError, CoreResult};
use crate::types::ChannelIndex;
use std::collections::BTreeMap;

/// What the log says about one data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggedFile {
    /// Length after the last entry touching the file.
    pub length: u64,
    /// Whether a deletion entry was logged.
    pub deleted: bool,
}

/// A head file length together with the store timestamp it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreMark {
    /// Head file length.
    pub length: u64,
    /// Store timestamp, `0` before the first store.
    pub timestamp: u64,
}

/// The state a transactions log replays to.
///
/// `latest` is the head file as of the last store; `last_consistent` is
/// the head file as of the store before it. Recovery picks one of the two
/// depending on which stores completed on every channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionsAnalysis {
    /// Every file the log mentions, by number.
    pub files: BTreeMap<u64, LoggedFile>,
    /// Number of the most recently created file.
    pub head_file: Option<u64>,
    /// Head file after the most recent store.
    pub latest: StoreMark,
    /// Head file after the store before that.
    pub last_consistent: StoreMark,
    /// Largest timestamp of any entry.
    pub max_timestamp: u64,
    /// Number of entries folded.
    pub entry_count: usize,
}

impl TransactionsAnalysis {
    /// Folds `entries` in log order.
    ///
    /// # Errors
    ///
    /// Returns a consistency violation for entries that contradict the
    /// state built so far: non-increasing file numbers, shrinking or
    /// timestamp-regressing stores, and entries naming unknown files.
    pub fn from_entries<'a>(
        channel: ChannelIndex,
        entries: impl IntoIterator<Item = &'a TransactionEntry>,
    ) -> CoreResult<Self> {
        let mut analysis = Self::default();
        for entry in entries {
            analysis.accept(channel, entry)?;
        }
        Ok(analysis)
    }

    fn head_entry(&mut self, channel: ChannelIndex, entry: &TransactionEntry) -> CoreResult<(u64, &mut LoggedFile)> {
        let number = self.head_file.ok_or_else(|| {
            CoreError::consistency(channel, format!("{} entry before any file creation", entry.kind().name()))
        })?;
        let file = self
            .files
            .get_mut(&number)
            .ok_or_else(|| CoreError::consistency(channel, format!("head file {number} not registered")))?;
        Ok((number, file))
    }

    fn accept(&mut self, channel: ChannelIndex, entry: &TransactionEntry) -> CoreResult<()> {
        self.entry_count += 1;
        self.max_timestamp = self.max_timestamp.max(entry.timestamp());

        match *entry {
            TransactionEntry::FileCreation {
                file_number,
                length,
                ..
            } => {
                if self.head_file.is_some_and(|head| head >= file_number) {
                    return Err(CoreError::consistency(
                        channel,
                        format!(
                            "file {file_number} created after file {}",
                            self.head_file.unwrap_or_default()
                        ),
                    ));
                }
                self.files.insert(
                    file_number,
                    LoggedFile {
                        length,
                        deleted: false,
                    },
                );
                self.head_file = Some(file_number);
                self.latest.length = length;
                self.last_consistent = self.latest;
            }
            TransactionEntry::Store {
                timestamp,
                head_length,
            } => {
                let previous = self.latest;
                let (number, file) = self.head_entry(channel, entry)?;
                if head_length < file.length {
                    return Err(CoreError::consistency(
                        channel,
                        format!(
                            "store shrinks file {number} from {} to {head_length}",
                            file.length
                        ),
                    ));
                }
                if timestamp <= previous.timestamp {
                    return Err(CoreError::consistency(
                        channel,
                        format!(
                            "store timestamp {timestamp} not after {}",
                            previous.timestamp
                        ),
                    ));
                }
                file.length = head_length;
                self.last_consistent = previous;
                self.latest = StoreMark {
                    length: head_length,
                    timestamp,
                };
            }
            TransactionEntry::Transfer {
                head_length,
                source_file,
                ..
            } => {
                if !self.files.get(&source_file).is_some_and(|f| !f.deleted) {
                    return Err(CoreError::consistency(
                        channel,
                        format!("transfer from unknown file {source_file}"),
                    ));
                }
                let (number, file) = self.head_entry(channel, entry)?;
                if head_length < file.length {
                    return Err(CoreError::consistency(
                        channel,
                        format!(
                            "transfer shrinks file {number} from {} to {head_length}",
                            file.length
                        ),
                    ));
                }
                file.length = head_length;
                self.latest.length = head_length;
                self.last_consistent.length = head_length;
            }
            TransactionEntry::FileTruncation {
                file_number,
                new_length,
                ..
            } => {
                let (number, file) = self.head_entry(channel, entry)?;
                if number != file_number || new_length > file.length {
                    return Err(CoreError::consistency(
                        channel,
                        format!(
                            "truncation of file {file_number} to {new_length} does not fit head file {number} of length {}",
                            file.length
                        ),
                    ));
                }
                file.length = new_length;
                // A truncation reverts the head file to its last consistent store.
                self.latest = StoreMark {
                    length: new_length,
                    timestamp: self.last_consistent.timestamp,
                };
                self.last_consistent.length = self.last_consistent.length.min(new_length);
            }
            TransactionEntry::FileDeletion { file_number, .. } => {
                if self.head_file == Some(file_number) {
                    return Err(CoreError::consistency(
                        channel,
                        format!("deletion of head file {file_number}"),
                    ));
                }
                match self.files.get_mut(&file_number) {
                    Some(file) if !file.deleted => file.deleted = true,
                    _ => {
                        return Err(CoreError::consistency(
                            channel,
                            format!("deletion of unknown file {file_number}"),
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    /// Head file length to recover, given the newest store timestamp that
    /// every channel logged.
    ///
    /// Returns `None` if this log has neither its latest nor its previous
    /// store at that timestamp.
    #[must_use]
    pub fn head_length_at(&self, consistent_timestamp: u64) -> Option<u64> {
        if self.latest.timestamp == consistent_timestamp {
            Some(self.latest.length)
        } else if self.last_consistent.timestamp == consistent_timestamp {
            Some(self.last_consistent.length)
        } else {
            None
        }
    }

    /// Files not marked deleted, by number.
    pub fn live_files(&self) -> impl Iterator<Item = (u64, &LoggedFile)> {
        self.files
            .iter()
            .filter(|(_, file)| !file.deleted)
            .map(|(&number, file)| (number, file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CH: ChannelIndex = ChannelIndex(0);

    fn creation(file_number: u64, timestamp: u64) -> TransactionEntry {
        TransactionEntry::FileCreation {
            timestamp,
            file_number,
            length: 0,
        }
    }

    fn store(head_length: u64, timestamp: u64) -> TransactionEntry {
        TransactionEntry::Store {
            timestamp,
            head_length,
        }
    }

    #[test]
    fn stores_shift_latest_to_consistent() {
        let entries = [creation(1, 1), store(100, 10), store(250, 20)];
        let analysis = TransactionsAnalysis::from_entries(CH, &entries).unwrap();
        assert_eq!(analysis.head_file, Some(1));
        assert_eq!(analysis.latest, StoreMark { length: 250, timestamp: 20 });
        assert_eq!(analysis.last_consistent, StoreMark { length: 100, timestamp: 10 });
        assert_eq!(analysis.head_length_at(20), Some(250));
        assert_eq!(analysis.head_length_at(10), Some(100));
        assert_eq!(analysis.head_length_at(5), None);
        assert_eq!(analysis.max_timestamp, 20);
    }

    #[test]
    fn new_head_file_inherits_store_timestamp() {
        let entries = [creation(1, 1), store(100, 10), creation(2, 11), store(40, 20)];
        let analysis = TransactionsAnalysis::from_entries(CH, &entries).unwrap();
        assert_eq!(analysis.files[&1].length, 100);
        assert_eq!(analysis.head_length_at(20), Some(40));
        // rolling back the last store leaves the new file empty
        assert_eq!(analysis.head_length_at(10), Some(0));
    }

    #[test]
    fn truncation_reverts_to_consistent_store() {
        let entries = [
            creation(1, 1),
            store(100, 10),
            store(180, 20),
            TransactionEntry::FileTruncation {
                timestamp: 21,
                file_number: 1,
                new_length: 100,
                old_length: 180,
            },
            store(150, 30),
        ];
        let analysis = TransactionsAnalysis::from_entries(CH, &entries).unwrap();
        assert_eq!(analysis.latest, StoreMark { length: 150, timestamp: 30 });
        assert_eq!(analysis.last_consistent, StoreMark { length: 100, timestamp: 10 });
    }

    #[test]
    fn transfer_moves_both_marks() {
        let entries = [
            creation(1, 1),
            store(100, 10),
            creation(2, 11),
            TransactionEntry::Transfer {
                timestamp: 12,
                head_length: 60,
                source_file: 1,
                source_offset: 0,
            },
            TransactionEntry::FileDeletion {
                timestamp: 13,
                file_number: 1,
                final_length: 100,
            },
        ];
        let analysis = TransactionsAnalysis::from_entries(CH, &entries).unwrap();
        assert_eq!(analysis.head_length_at(10), Some(60));
        assert!(analysis.files[&1].deleted);
        assert_eq!(analysis.live_files().map(|(n, _)| n).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn rejects_contradictions() {
        let cases: Vec<Vec<TransactionEntry>> = vec![
            vec![store(10, 1)],
            vec![creation(2, 1), creation(1, 2)],
            vec![creation(1, 1), store(10, 5), store(5, 6)],
            vec![creation(1, 1), store(10, 5), store(20, 5)],
            vec![creation(1, 1), TransactionEntry::FileDeletion {
                timestamp: 2,
                file_number: 1,
                final_length: 0,
            }],
            vec![creation(1, 1), TransactionEntry::FileDeletion {
                timestamp: 2,
                file_number: 7,
                final_length: 0,
            }],
            vec![creation(1, 1), TransactionEntry::FileTruncation {
                timestamp: 2,
                file_number: 1,
                new_length: 5,
                old_length: 0,
            }],
        ];
        for entries in cases {
            let result = TransactionsAnalysis::from_entries(CH, &entries);
            assert!(
                matches!(result, Err(CoreError::Consistency { .. })),
                "accepted {entries:?}"
            );
        }
    }
}
