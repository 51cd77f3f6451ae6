//! Dump-log command implementation.

use super::{manifest_at, provider_at};
use graphstore_core::{parse_log, ChannelIndex, FileProvider, TransactionEntry};
use graphstore_storage::StorageBackend;
use serde::Serialize;
use std::path::Path;

/// Transactions log entry representation for output.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct LogEntryInfo {
    /// Position of the entry in the log.
    pub index: usize,
    /// Entry kind.
    pub kind: String,
    /// Entry timestamp.
    pub timestamp: u64,
    /// File the entry is about (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_number: Option<u64>,
    /// File length after the entry (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    /// Source file of a transfer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<u64>,
    /// Source offset of a transfer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_offset: Option<u64>,
    /// Length before a truncation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_length: Option<u64>,
}

/// Runs the dump-log command.
pub fn run(
    path: &Path,
    channel: u32,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = manifest_at(path)?;
    if channel >= manifest.channel_count {
        return Err(format!("channel {channel} does not exist").into());
    }
    let provider = provider_at(path);
    let (entries, torn_bytes) = read_entries(&provider, ChannelIndex(channel), limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            print_text_output(&entries, torn_bytes);
        }
    }

    Ok(())
}

fn read_entries(
    provider: &dyn FileProvider,
    channel: ChannelIndex,
    limit: Option<usize>,
) -> Result<(Vec<LogEntryInfo>, u64), Box<dyn std::error::Error>> {
    if !provider.has_transactions_log(channel)? {
        return Err("Transactions log not found".into());
    }
    let bytes = provider.open_transactions_log(channel)?.read_all()?;
    let contents = parse_log(&bytes)?;
    let entries = contents
        .entries
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .enumerate()
        .map(|(index, entry)| describe(index, entry))
        .collect();
    Ok((entries, contents.torn_bytes))
}

fn describe(index: usize, entry: &TransactionEntry) -> LogEntryInfo {
    let mut info = LogEntryInfo {
        index,
        kind: entry.kind().name().to_string(),
        timestamp: entry.timestamp(),
        file_number: None,
        length: None,
        source_file: None,
        source_offset: None,
        old_length: None,
    };
    match *entry {
        TransactionEntry::FileCreation {
            file_number, length, ..
        } => {
            info.file_number = Some(file_number);
            info.length = Some(length);
        }
        TransactionEntry::Store { head_length, .. } => {
            info.length = Some(head_length);
        }
        TransactionEntry::Transfer {
            head_length,
            source_file,
            source_offset,
            ..
        } => {
            info.length = Some(head_length);
            info.source_file = Some(source_file);
            info.source_offset = Some(source_offset);
        }
        TransactionEntry::FileTruncation {
            file_number,
            new_length,
            old_length,
            ..
        } => {
            info.file_number = Some(file_number);
            info.length = Some(new_length);
            info.old_length = Some(old_length);
        }
        TransactionEntry::FileDeletion {
            file_number,
            final_length,
            ..
        } => {
            info.file_number = Some(file_number);
            info.length = Some(final_length);
        }
    }
    info
}

fn print_text_output(entries: &[LogEntryInfo], torn_bytes: u64) {
    for entry in entries {
        let mut line = format!("#{:<6} {:<16} ts={}", entry.index, entry.kind, entry.timestamp);
        if let Some(number) = entry.file_number {
            line.push_str(&format!(" file={number}"));
        }
        if let Some(length) = entry.length {
            line.push_str(&format!(" length={length}"));
        }
        if let (Some(file), Some(offset)) = (entry.source_file, entry.source_offset) {
            line.push_str(&format!(" from={file}@{offset}"));
        }
        if let Some(old) = entry.old_length {
            line.push_str(&format!(" was={old}"));
        }
        println!("{line}");
    }
    println!();
    println!("{} entries", entries.len());
    if torn_bytes > 0 {
        println!("{} torn bytes at the end of the log", torn_bytes);
    }
}
