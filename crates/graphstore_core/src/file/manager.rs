//! The data-file chain of one channel.

use super::data_file::DataFile;
use super::provider::FileProvider;
use crate::cache::{EntitySlot, StoragePosition};
use crate::error::{CoreError, CoreResult};
use crate::export::ExportSink;
use crate::policy::DataFileEvaluator;
use crate::record::{ByteOrder, ChunkBuffer};
use crate::stats::StorageStats;
use crate::txlog::{encode_log, TransactionEntry, TransactionLog};
use crate::types::{ChannelIndex, TimestampProvider};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Shared collaborators of a channel's file manager.
#[derive(Debug, Clone)]
pub struct FileContext {
    /// The owning channel.
    pub channel: ChannelIndex,
    /// Where files live.
    pub provider: Arc<dyn FileProvider>,
    /// Retirement and compaction policy.
    pub evaluator: Arc<dyn DataFileEvaluator>,
    /// Timestamps for log entries not tied to a store.
    pub timestamps: Arc<TimestampProvider>,
    /// Counters.
    pub stats: Arc<StorageStats>,
    /// Record byte order.
    pub byte_order: ByteOrder,
    /// Whether data is synced before its log entry.
    pub sync_on_write: bool,
}

/// Size and usage of one data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStatistics {
    /// File number.
    pub number: u64,
    /// Committed length.
    pub total_length: u64,
    /// Bytes held by live entities.
    pub data_length: u64,
    /// Live entities.
    pub entity_count: u64,
    /// Whether this is the write target.
    pub is_head: bool,
}

#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    file: u64,
    committed_length: u64,
    new_length: u64,
    logged: bool,
    truncation_logged: bool,
    previous_store_timestamp: u64,
}

/// Owns a channel's data files and transactions log.
///
/// Writes follow two rules: data bytes reach the file before the log entry
/// describing them, and a deletion or truncation is logged before it
/// happens. A crash therefore leaves at most unlogged tail bytes, which
/// recovery cuts off.
#[derive(Debug)]
pub struct FileManager {
    pub(crate) context: FileContext,
    pub(crate) files: BTreeMap<u64, DataFile>,
    pub(crate) head: u64,
    pub(crate) log: TransactionLog,
    pending: Option<PendingWrite>,
    pub(crate) latest_store_timestamp: u64,
    cleanup_cursor: Option<u64>,
}

impl FileManager {
    pub(crate) fn assemble(
        context: FileContext,
        files: BTreeMap<u64, DataFile>,
        head: u64,
        log: TransactionLog,
        latest_store_timestamp: u64,
    ) -> Self {
        Self {
            context,
            files,
            head,
            log,
            pending: None,
            latest_store_timestamp,
            cleanup_cursor: None,
        }
    }

    /// The owning channel.
    #[must_use]
    pub fn channel(&self) -> ChannelIndex {
        self.context.channel
    }

    /// Number of the current write target.
    #[must_use]
    pub fn head_file(&self) -> u64 {
        self.head
    }

    /// Timestamp of the latest store this channel logged.
    #[must_use]
    pub fn latest_store_timestamp(&self) -> u64 {
        self.latest_store_timestamp
    }

    fn consistency(&self, message: impl Into<String>) -> CoreError {
        CoreError::consistency(self.context.channel, message)
    }

    fn file(&self, number: u64) -> CoreResult<&DataFile> {
        self.files
            .get(&number)
            .ok_or_else(|| self.consistency(format!("data file {number} is not registered")))
    }

    fn file_mut(&mut self, number: u64) -> CoreResult<&mut DataFile> {
        let channel = self.context.channel;
        self.files
            .get_mut(&number)
            .ok_or_else(|| CoreError::consistency(channel, format!("data file {number} is not registered")))
    }

    fn sync_or_flush(&mut self, number: u64) -> CoreResult<()> {
        let sync = self.context.sync_on_write;
        let file = self.file_mut(number)?;
        if sync {
            file.backend.sync()?;
        } else {
            file.backend.flush()?;
        }
        Ok(())
    }

    /// Appends `chunk` to the head file and logs the store.
    ///
    /// The head file retires first if it is full or the chunk would push
    /// it past the maximum size. The write stays tentative until
    /// [`commit_write`](Self::commit_write) or
    /// [`rollback_write`](Self::rollback_write). A store entry is logged
    /// even for an empty chunk, so every channel's log carries every store
    /// timestamp.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, including those of a rollback left unfinished
    /// by an earlier failure, which is retried first.
    pub fn store_chunks(
        &mut self,
        timestamp: u64,
        chunk: &ChunkBuffer,
    ) -> CoreResult<Vec<StoragePosition>> {
        self.rollback_write()?;
        let length = chunk.len() as u64;
        let head_length = self.file(self.head)?.total_length;
        if length > 0
            && (self.context.evaluator.needs_retirement(head_length)
                || (head_length > 0
                    && head_length + length > self.context.evaluator.maximum_file_size()))
        {
            self.create_head_file()?;
        }

        let head = self.head;
        let start = self.file(head)?.total_length;
        self.pending = Some(PendingWrite {
            file: head,
            committed_length: start,
            new_length: start,
            logged: false,
            truncation_logged: false,
            previous_store_timestamp: self.latest_store_timestamp,
        });

        if length > 0 {
            self.file_mut(head)?.backend.append(chunk.as_bytes())?;
            self.sync_or_flush(head)?;
        }
        let new_length = start + length;
        if let Some(pending) = self.pending.as_mut() {
            pending.new_length = new_length;
        }

        self.log.append(&TransactionEntry::Store {
            timestamp,
            head_length: new_length,
        })?;
        if let Some(pending) = self.pending.as_mut() {
            pending.logged = true;
        }
        self.latest_store_timestamp = timestamp;

        let mut positions = Vec::with_capacity(chunk.record_count());
        let mut offset = start;
        for record in chunk.records() {
            positions.push(StoragePosition { file: head, offset });
            offset += record.length();
        }
        debug!(channel = %self.context.channel, file = head, bytes = length, "stored chunk");
        Ok(positions)
    }

    /// Makes the pending write part of the committed file length.
    ///
    /// # Errors
    ///
    /// Fails if the written file vanished from the chain.
    pub fn commit_write(&mut self) -> CoreResult<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        self.file_mut(pending.file)?.total_length = pending.new_length;
        Ok(())
    }

    /// Cuts the head file back to its last committed length.
    ///
    /// A truncation entry is logged first if the store entry made it into
    /// the log; unlogged tail bytes are simply cut. The write stays pending
    /// until the cut succeeds, so a failed rollback is retried by the next
    /// store or housekeeping round instead of leaving the tracked length
    /// out of step with the file.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn rollback_write(&mut self) -> CoreResult<()> {
        let Some(pending) = self.pending else {
            return Ok(());
        };
        let actual = self.file(pending.file)?.backend.size()?;
        if pending.logged && !pending.truncation_logged {
            self.log.append(&TransactionEntry::FileTruncation {
                timestamp: self.context.timestamps.next(),
                file_number: pending.file,
                new_length: pending.committed_length,
                old_length: pending.new_length.max(actual),
            })?;
            if let Some(pending) = self.pending.as_mut() {
                pending.truncation_logged = true;
            }
        }
        if actual > pending.committed_length {
            let file = self.file_mut(pending.file)?;
            file.backend.truncate(pending.committed_length)?;
        }
        self.pending = None;
        self.latest_store_timestamp = pending.previous_store_timestamp;
        info!(
            channel = %self.context.channel,
            file = pending.file,
            length = pending.committed_length,
            "rolled back store"
        );
        Ok(())
    }

    /// Whether a store is awaiting commit or rollback.
    #[must_use]
    pub fn has_pending_write(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn attach(&mut self, position: StoragePosition, length: u64, slot: EntitySlot) -> CoreResult<()> {
        self.file_mut(position.file)?
            .attach(position.offset, length, slot);
        Ok(())
    }

    pub(crate) fn detach(&mut self, position: StoragePosition) -> CoreResult<()> {
        let file = self.file_mut(position.file)?;
        if file.detach(position.offset).is_none() {
            return Err(self.consistency(format!(
                "no entity registered at {}:{}",
                position.file, position.offset
            )));
        }
        Ok(())
    }

    /// Reads an entity's record bytes.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or if the file is not part of the chain.
    pub fn read_entity(&self, position: StoragePosition, length: u64) -> CoreResult<Vec<u8>> {
        self.file(position.file)?.read(position.offset, length)
    }

    /// Starts a new, empty head file.
    pub(crate) fn create_head_file(&mut self) -> CoreResult<()> {
        let number = self.head + 1;
        let channel = self.context.channel;
        let backend = self.context.provider.open_data_file(channel, number, true)?;
        self.log.append(&TransactionEntry::FileCreation {
            timestamp: self.context.timestamps.next(),
            file_number: number,
            length: 0,
        })?;
        self.files.insert(number, DataFile::new(number, backend, 0));
        self.head = number;
        self.context.stats.record_file_created();
        info!(%channel, file = number, "created data file");
        Ok(())
    }

    /// Retires the head file if it reached the maximum size.
    pub(crate) fn check_for_new_file(&mut self) -> CoreResult<()> {
        let total = self.file(self.head)?.total_length;
        if self.context.evaluator.needs_retirement(total) {
            self.create_head_file()?;
        }
        Ok(())
    }

    fn delete_file(&mut self, number: u64) -> CoreResult<()> {
        let file = self.file(number)?;
        if number == self.head || file.has_users() {
            return Err(self.consistency(format!(
                "data file {number} cannot be deleted with {} users",
                file.user_count()
            )));
        }
        let final_length = file.total_length;
        self.log.append(&TransactionEntry::FileDeletion {
            timestamp: self.context.timestamps.next(),
            file_number: number,
            final_length,
        })?;
        self.files.remove(&number);
        self.context
            .provider
            .delete_data_file(self.context.channel, number)?;
        self.context.stats.record_file_deleted();
        info!(channel = %self.context.channel, file = number, "deleted data file");
        Ok(())
    }

    /// Copies the first contiguous run of live entities of `source` into
    /// the head file and logs it as one transfer.
    fn transfer_run(
        &mut self,
        source: u64,
        relocate: &mut dyn FnMut(EntitySlot, StoragePosition),
    ) -> CoreResult<()> {
        let head_length = self.file(self.head)?.total_length;
        let free = self
            .context
            .evaluator
            .maximum_file_size()
            .saturating_sub(head_length);
        let source_file = self.file(source)?;
        let (mut start, mut length, mut offsets) = source_file.first_contiguous_run(free);
        if offsets.is_empty() {
            if head_length > 0 {
                return self.create_head_file();
            }
            // An entity larger than a whole file moves on its own.
            let Some((&offset, extent)) = source_file.entities.iter().next() else {
                return Ok(());
            };
            (start, length, offsets) = (offset, extent.length, vec![offset]);
        }

        let bytes = source_file.read(start, length)?;
        let head = self.head;
        let target = self.file_mut(head)?;
        let target_start = target.total_length;
        target.backend.append(&bytes)?;
        self.sync_or_flush(head)?;
        let target = self.file_mut(head)?;
        target.total_length += length;
        let head_length = target.total_length;

        self.log.append(&TransactionEntry::Transfer {
            timestamp: self.context.timestamps.next(),
            head_length,
            source_file: source,
            source_offset: start,
        })?;

        for offset in offsets {
            let Some(extent) = self.file_mut(source)?.detach(offset) else {
                continue;
            };
            let position = StoragePosition {
                file: head,
                offset: target_start + (offset - start),
            };
            self.file_mut(head)?
                .attach(position.offset, extent.length, extent.slot);
            relocate(extent.slot, position);
        }
        self.context.stats.record_transfer(length);
        debug!(
            channel = %self.context.channel,
            source,
            offset = start,
            bytes = length,
            target = head,
            "transferred run"
        );
        Ok(())
    }

    /// Handles one file of the cleanup pass. Returns `true` when the pass
    /// can move on to the next file.
    fn cleanup_file(
        &mut self,
        number: u64,
        relocate: &mut dyn FnMut(EntitySlot, StoragePosition),
    ) -> CoreResult<bool> {
        let is_head = number == self.head;
        let file = self.file(number)?;
        if !is_head && !file.has_users() {
            self.delete_file(number)?;
            return Ok(true);
        }
        if !self.context.evaluator.needs_dissolving(&file.usage(is_head)) {
            return Ok(true);
        }
        if is_head {
            self.create_head_file()?;
        } else {
            self.transfer_run(number, relocate)?;
        }
        Ok(false)
    }

    /// Runs the file cleanup pass until it completes or `deadline` passes.
    ///
    /// Files without users are deleted; files the evaluator wants
    /// dissolved have their live entities transferred into the head file
    /// run by run. `relocate` is told about every moved entity. Returns
    /// `true` if the pass finished; the next call starts a new one.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn incremental_file_cleanup(
        &mut self,
        deadline: Instant,
        mut relocate: impl FnMut(EntitySlot, StoragePosition),
    ) -> CoreResult<bool> {
        self.check_log_compaction()?;
        let mut cursor = self.cleanup_cursor.unwrap_or(0);
        loop {
            let Some(number) = self.files.range(cursor..).next().map(|(&n, _)| n) else {
                self.cleanup_cursor = None;
                return Ok(true);
            };
            if self.cleanup_file(number, &mut relocate)? {
                cursor = number + 1;
            }
            if Instant::now() >= deadline {
                self.cleanup_cursor = Some(cursor);
                return Ok(false);
            }
        }
    }

    fn check_log_compaction(&mut self) -> CoreResult<()> {
        if self.log.size()? > self.context.evaluator.transaction_file_maximum_size() {
            self.compact_log()?;
        }
        Ok(())
    }

    /// Rewrites the transactions log as one creation entry per live file
    /// plus the latest store.
    pub(crate) fn compact_log(&mut self) -> CoreResult<()> {
        let timestamp = self.latest_store_timestamp;
        let mut entries: Vec<TransactionEntry> = self
            .files
            .values()
            .map(|file| TransactionEntry::FileCreation {
                timestamp,
                file_number: file.number,
                length: file.total_length,
            })
            .collect();
        if timestamp > 0 {
            entries.push(TransactionEntry::Store {
                timestamp,
                head_length: self.file(self.head)?.total_length,
            });
        }
        let previous = self.log.size()?;
        let backend = self
            .context
            .provider
            .replace_transactions_log(self.context.channel, &encode_log(&entries))?;
        self.log = TransactionLog::new(backend, self.context.sync_on_write, entries.len());
        info!(
            channel = %self.context.channel,
            previous_size = previous,
            entries = entries.len(),
            "compacted transactions log"
        );
        Ok(())
    }

    /// Streams the transactions log and then every data file to `sink`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or if the sink fails.
    pub fn export_data(&self, sink: &mut dyn ExportSink) -> CoreResult<()> {
        if self.pending.is_some() {
            return Err(self.consistency("export started while a write is pending"));
        }
        let channel = self.context.channel;
        sink.export_transactions_log(channel, &encode_log(&self.log.read_entries()?))?;
        for file in self.files.values() {
            let bytes = file.read(0, file.total_length)?;
            sink.export_data_file(channel, file.number, &bytes)?;
        }
        Ok(())
    }

    /// Per-file statistics in file order.
    #[must_use]
    pub fn statistics(&self) -> Vec<FileStatistics> {
        self.files
            .values()
            .map(|file| FileStatistics {
                number: file.number,
                total_length: file.total_length,
                data_length: file.data_length,
                entity_count: file.user_count() as u64,
                is_head: file.number == self.head,
            })
            .collect()
    }
}
