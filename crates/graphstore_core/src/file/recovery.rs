//! Startup recovery of a channel's files.
//!
//! Recovery runs in two steps. First every channel reads its inventory:
//! the data files present and its transactions log. The database then
//! picks the newest store timestamp that every channel logged, and each
//! channel restores its files to that store and registers the entities
//! they hold.

use super::data_file::DataFile;
use super::manager::{FileContext, FileManager};
use super::provider::FileProvider;
use crate::cache::{EntitySlot, StoragePosition};
use crate::error::{CoreError, CoreResult};
use crate::record::{scan_file, ByteOrder, EntityRecord, FileSlot};
use crate::txlog::{encode_log, parse_log, TransactionEntry, TransactionLog, TransactionsAnalysis};
use crate::types::ChannelIndex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// What recovery did to one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// The recovered channel.
    pub channel: ChannelIndex,
    /// Data files in the chain afterwards.
    pub files: usize,
    /// Entities registered.
    pub entities: u64,
    /// Bytes cut off the head file.
    pub truncated_bytes: u64,
    /// Logged deletions that had not reached the disk.
    pub finished_deletions: usize,
    /// Whether the transactions log had to be rebuilt from the files.
    pub derived_log: bool,
}

/// The files and log of one channel before recovery.
#[derive(Debug)]
pub struct ChannelInventory {
    channel: ChannelIndex,
    log: Option<TransactionLog>,
    analysis: TransactionsAnalysis,
    derived: bool,
    present: BTreeSet<u64>,
}

/// The newest store timestamp logged by every channel.
///
/// Channels without a usable log do not take part.
#[must_use]
pub fn consistent_timestamp(inventories: &[ChannelInventory]) -> u64 {
    inventories
        .iter()
        .filter_map(ChannelInventory::latest_store_timestamp)
        .min()
        .unwrap_or(0)
}

impl ChannelInventory {
    /// Lists the data files of the context's channel and replays its log.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors and on corrupt or contradictory log entries.
    pub fn read(context: &FileContext) -> CoreResult<Self> {
        let channel = context.channel;
        let present: BTreeSet<u64> = context
            .provider
            .list_data_files(channel)?
            .into_iter()
            .collect();

        let (log, analysis) = if context.provider.has_transactions_log(channel)? {
            let (log, entries) = TransactionLog::open(
                context.provider.open_transactions_log(channel)?,
                context.sync_on_write,
            )?;
            let analysis = TransactionsAnalysis::from_entries(channel, &entries)?;
            (Some(log), analysis)
        } else {
            (None, TransactionsAnalysis::default())
        };
        let derived = analysis.head_file.is_none() && !present.is_empty();

        Ok(Self {
            channel,
            log,
            analysis,
            derived,
            present,
        })
    }

    /// Timestamp of the latest store in the log, if the log is usable.
    #[must_use]
    pub fn latest_store_timestamp(&self) -> Option<u64> {
        (!self.derived && self.analysis.head_file.is_some()).then_some(self.analysis.latest.timestamp)
    }

    /// Largest timestamp of any log entry.
    #[must_use]
    pub fn max_timestamp(&self) -> u64 {
        self.analysis.max_timestamp
    }

    /// Restores the files to the store at `consistent_timestamp` and hands
    /// every live record to `register`.
    ///
    /// Files are read newest first and each file back to front, so the
    /// first record seen for an object id is its current version.
    /// `register` returns the new slot, or `None` for a superseded version.
    ///
    /// # Errors
    ///
    /// Returns a consistency violation if a file contradicts the log, a
    /// logged non-empty file is missing, or a file holds malformed
    /// records.
    pub fn recover<F>(
        self,
        context: FileContext,
        consistent_timestamp: u64,
        mut register: F,
    ) -> CoreResult<(FileManager, RecoverySummary)>
    where
        F: FnMut(EntityRecord<'_>, StoragePosition) -> CoreResult<Option<EntitySlot>>,
    {
        let channel = self.channel;
        let provider = &context.provider;
        let mut summary = RecoverySummary {
            channel,
            derived_log: self.derived,
            ..RecoverySummary::default()
        };

        if self.analysis.head_file.is_none() && self.present.is_empty() {
            return Self::initialize(context, self.log, summary);
        }

        let (mut log, analysis) = if self.derived {
            let mut entries = Vec::with_capacity(self.present.len());
            for &number in &self.present {
                let length = provider.open_data_file(channel, number, false)?.size()?;
                entries.push(TransactionEntry::FileCreation {
                    timestamp: 0,
                    file_number: number,
                    length,
                });
            }
            warn!(%channel, files = entries.len(), "rebuilding transactions log from data files");
            let backend = provider.replace_transactions_log(channel, &encode_log(&entries))?;
            let analysis = TransactionsAnalysis::from_entries(channel, &entries)?;
            (
                TransactionLog::new(backend, context.sync_on_write, entries.len()),
                analysis,
            )
        } else {
            let log = match self.log {
                Some(log) => log,
                None => return Err(CoreError::consistency(channel, "transactions log vanished")),
            };
            (log, self.analysis)
        };

        let Some(head) = analysis.head_file else {
            return Err(CoreError::consistency(channel, "no head file after replay"));
        };
        let head_length = if self.derived {
            analysis.latest.length
        } else {
            analysis.head_length_at(consistent_timestamp).ok_or_else(|| {
                CoreError::consistency(
                    channel,
                    format!(
                        "no store at timestamp {consistent_timestamp} (latest {}, previous {})",
                        analysis.latest.timestamp, analysis.last_consistent.timestamp
                    ),
                )
            })?
        };

        let mut files = BTreeMap::new();
        for (&number, logged) in &analysis.files {
            let present = self.present.contains(&number);
            if logged.deleted {
                if present {
                    provider.delete_data_file(channel, number)?;
                    summary.finished_deletions += 1;
                    info!(%channel, file = number, "finished logged file deletion");
                }
                continue;
            }

            let is_head = number == head;
            let expected = if is_head { head_length } else { logged.length };
            if !present && expected > 0 {
                return Err(CoreError::consistency(
                    channel,
                    format!("data file {number} of length {expected} is missing"),
                ));
            }
            let mut backend = provider.open_data_file(channel, number, !present)?;
            let actual = backend.size()?;

            if is_head {
                if actual < expected {
                    return Err(CoreError::consistency(
                        channel,
                        format!("head file {number} has {actual} bytes, log requires {expected}"),
                    ));
                }
                if expected < logged.length {
                    log.append(&TransactionEntry::FileTruncation {
                        timestamp: context.timestamps.next(),
                        file_number: number,
                        new_length: expected,
                        old_length: logged.length,
                    })?;
                }
                if actual > expected {
                    warn!(%channel, file = number, from = actual, to = expected, "truncating head file tail");
                    backend.truncate(expected)?;
                    summary.truncated_bytes += actual - expected;
                }
            } else if actual != expected {
                return Err(CoreError::consistency(
                    channel,
                    format!("data file {number} has {actual} bytes, log says {expected}"),
                ));
            }
            files.insert(number, DataFile::new(number, backend, expected));
        }

        for &number in self.present.difference(&analysis.files.keys().copied().collect()) {
            let empty = provider.open_data_file(channel, number, false)?.size()? == 0;
            if number > head && empty {
                provider.delete_data_file(channel, number)?;
                continue;
            }
            return Err(CoreError::consistency(
                channel,
                format!("data file {number} is not in the transactions log"),
            ));
        }

        for file in files.values_mut().rev() {
            summary.entities += register_file(channel, file, context.byte_order, &mut register)?;
        }

        let latest_store_timestamp = if self.derived {
            analysis.latest.timestamp
        } else {
            consistent_timestamp
        };
        summary.files = files.len();
        let mut manager = FileManager::assemble(context, files, head, log, latest_store_timestamp);
        manager.check_for_new_file()?;
        summary.files = manager.files.len();
        info!(
            %channel,
            files = summary.files,
            entities = summary.entities,
            truncated_bytes = summary.truncated_bytes,
            "recovered channel"
        );
        Ok((manager, summary))
    }

    fn initialize(
        context: FileContext,
        log: Option<TransactionLog>,
        mut summary: RecoverySummary,
    ) -> CoreResult<(FileManager, RecoverySummary)> {
        let channel = context.channel;
        let mut log = match log {
            Some(log) => log,
            None => TransactionLog::new(
                context.provider.open_transactions_log(channel)?,
                context.sync_on_write,
                0,
            ),
        };
        let backend = context.provider.open_data_file(channel, 1, true)?;
        log.append(&TransactionEntry::FileCreation {
            timestamp: context.timestamps.next(),
            file_number: 1,
            length: 0,
        })?;
        context.stats.record_file_created();
        let mut files = BTreeMap::new();
        files.insert(1, DataFile::new(1, backend, 0));
        summary.files = 1;
        info!(%channel, "initialized empty channel");
        Ok((FileManager::assemble(context, files, 1, log, 0), summary))
    }
}

fn register_file<F>(
    channel: ChannelIndex,
    file: &mut DataFile,
    order: ByteOrder,
    register: &mut F,
) -> CoreResult<u64>
where
    F: FnMut(EntityRecord<'_>, StoragePosition) -> CoreResult<Option<EntitySlot>>,
{
    let bytes = file.read(0, file.total_length)?;
    let mut records = Vec::new();
    for slot in scan_file(&bytes, order) {
        match slot {
            Ok((offset, FileSlot::Entity(record))) => records.push((offset, record)),
            Ok((_, FileSlot::Gap(_))) => {}
            Err(err) => {
                return Err(CoreError::consistency(
                    channel,
                    format!("data file {}: {err:?}", file.number),
                ))
            }
        }
    }

    let mut registered = 0;
    for (offset, record) in records.into_iter().rev() {
        let position = StoragePosition {
            file: file.number,
            offset,
        };
        if let Some(slot) = register(record, position)? {
            file.attach(offset, record.length(), slot);
            registered += 1;
        }
    }
    Ok(registered)
}

/// Read-only findings about one data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    /// File number.
    pub number: u64,
    /// Length according to the log, if logged.
    pub logged_length: Option<u64>,
    /// Length on disk, if present.
    pub actual_length: Option<u64>,
    /// Entity records found.
    pub records: u64,
    /// Gaps found.
    pub gaps: u64,
}

/// Read-only findings about one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReport {
    /// The channel.
    pub channel: ChannelIndex,
    /// Whole log entries.
    pub log_entries: usize,
    /// Bytes of a torn final entry.
    pub torn_log_bytes: u64,
    /// Latest logged store timestamp.
    pub latest_store_timestamp: u64,
    /// Per file findings, by number.
    pub files: Vec<FileReport>,
    /// Everything recovery would reject or repair.
    pub problems: Vec<String>,
}

/// Checks a channel's log and files without modifying anything.
///
/// # Errors
///
/// Fails on I/O errors and on a structurally corrupt log.
pub fn verify_channel(
    provider: &dyn FileProvider,
    channel: ChannelIndex,
    order: ByteOrder,
) -> CoreResult<ChannelReport> {
    let contents = if provider.has_transactions_log(channel)? {
        parse_log(&provider.open_transactions_log(channel)?.read_all()?)?
    } else {
        Default::default()
    };
    let mut problems = Vec::new();
    if contents.torn_bytes > 0 {
        problems.push(format!("{} torn bytes at log end", contents.torn_bytes));
    }
    let analysis = match TransactionsAnalysis::from_entries(channel, &contents.entries) {
        Ok(analysis) => analysis,
        Err(err) => {
            problems.push(err.to_string());
            TransactionsAnalysis::default()
        }
    };

    let mut numbers: BTreeSet<u64> = provider.list_data_files(channel)?.into_iter().collect();
    let present = numbers.clone();
    numbers.extend(analysis.live_files().map(|(number, _)| number));

    let mut files = Vec::new();
    for number in numbers {
        let logged_length = analysis
            .files
            .get(&number)
            .filter(|file| !file.deleted)
            .map(|file| file.length);
        let mut report = FileReport {
            number,
            logged_length,
            actual_length: None,
            records: 0,
            gaps: 0,
        };
        if present.contains(&number) {
            let bytes = provider.open_data_file(channel, number, false)?.read_all()?;
            report.actual_length = Some(bytes.len() as u64);
            let scanned = logged_length.map_or(bytes.len(), |l| (l as usize).min(bytes.len()));
            for slot in scan_file(&bytes[..scanned], order) {
                match slot {
                    Ok((_, FileSlot::Entity(_))) => report.records += 1,
                    Ok((_, FileSlot::Gap(_))) => report.gaps += 1,
                    Err(err) => {
                        problems.push(format!("file {number}: {err:?}"));
                        break;
                    }
                }
            }
        }
        match (logged_length, report.actual_length) {
            (Some(logged), None) if logged > 0 => {
                problems.push(format!("file {number} missing, logged with {logged} bytes"));
            }
            (None, Some(actual)) if actual > 0 => {
                problems.push(format!("file {number} not in the log"));
            }
            (Some(logged), Some(actual)) if actual < logged => {
                problems.push(format!("file {number} has {actual} of {logged} logged bytes"));
            }
            (Some(logged), Some(actual))
                if actual > logged && Some(number) != analysis.head_file =>
            {
                problems.push(format!("file {number} has {actual} bytes, log says {logged}"));
            }
            _ => {}
        }
        files.push(report);
    }

    Ok(ChannelReport {
        channel,
        log_entries: contents.entries.len(),
        torn_log_bytes: contents.torn_bytes,
        latest_store_timestamp: analysis.latest.timestamp,
        files,
        problems,
    })
}
