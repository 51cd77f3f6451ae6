//! Inspect command implementation.

use super::{manifest_at, provider_at};
use graphstore_core::{verify_channel, ByteOrder, ChannelIndex, FileProvider};
use serde::Serialize;
use std::path::Path;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Manifest format version.
    pub format_version: String,
    /// Byte order of record fields.
    pub byte_order: String,
    /// Channels, in index order.
    pub channels: Vec<ChannelSummary>,
    /// Total size of all data files in bytes.
    pub total_size: u64,
}

/// Statistics for a single channel.
#[derive(Debug, Serialize)]
pub struct ChannelSummary {
    /// Channel index.
    pub index: u32,
    /// Number of data files.
    pub file_count: usize,
    /// Data file bytes on disk.
    pub data_size: u64,
    /// Entity records, superseded versions included.
    pub record_count: u64,
    /// Gap records.
    pub gap_count: u64,
    /// Transactions log entries.
    pub log_entries: usize,
    /// Timestamp of the latest logged store.
    pub latest_store_timestamp: u64,
    /// Data files (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileSummary>>,
}

/// One data file.
#[derive(Debug, Serialize)]
pub struct FileSummary {
    /// File number.
    pub number: u64,
    /// Bytes on disk.
    pub size: u64,
    /// Length according to the log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logged_length: Option<u64>,
    /// Entity records.
    pub records: u64,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_files: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = manifest_at(path)?;
    let provider = provider_at(path);
    let result = inspect(
        path,
        &provider,
        manifest.channel_count,
        manifest.byte_order,
        show_files,
    )?;
    let result = InspectResult {
        format_version: format!("{}.{}", manifest.format_version.0, manifest.format_version.1),
        ..result
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn inspect(
    path: &Path,
    provider: &dyn FileProvider,
    channel_count: u32,
    order: ByteOrder,
    show_files: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let mut channels = Vec::with_capacity(channel_count as usize);
    for index in 0..channel_count {
        let report = verify_channel(provider, ChannelIndex(index), order)?;
        let present: Vec<_> = report
            .files
            .iter()
            .filter_map(|file| {
                file.actual_length.map(|size| FileSummary {
                    number: file.number,
                    size,
                    logged_length: file.logged_length,
                    records: file.records,
                })
            })
            .collect();
        channels.push(ChannelSummary {
            index,
            file_count: present.len(),
            data_size: present.iter().map(|file| file.size).sum(),
            record_count: report.files.iter().map(|file| file.records).sum(),
            gap_count: report.files.iter().map(|file| file.gaps).sum(),
            log_entries: report.log_entries,
            latest_store_timestamp: report.latest_store_timestamp,
            files: show_files.then_some(present),
        });
    }
    let total_size = channels.iter().map(|channel| channel.data_size).sum();
    Ok(InspectResult {
        path: path.display().to_string(),
        format_version: String::new(),
        byte_order: format!("{order:?}").to_lowercase(),
        channels,
        total_size,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("graphstore Database Inspection");
    println!("==============================");
    println!();
    println!("Path:       {}", result.path);
    println!("Format:     {}", result.format_version);
    println!("Byte order: {}", result.byte_order);
    println!("Channels:   {}", result.channels.len());
    println!("Total size: {}", format_size(result.total_size));

    for channel in &result.channels {
        println!();
        println!("Channel {}:", channel.index);
        println!("  Data files:  {}", channel.file_count);
        println!("  Data size:   {}", format_size(channel.data_size));
        println!("  Records:     {} ({} gaps)", channel.record_count, channel.gap_count);
        println!("  Log entries: {}", channel.log_entries);
        println!("  Last store:  {}", channel.latest_store_timestamp);
        if let Some(files) = &channel.files {
            for file in files {
                println!(
                    "    [{}] {}, {} records",
                    file.number,
                    format_size(file.size),
                    file.records
                );
            }
        }
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphstore_core::{
        ChunkBuffer, Config, Database, ObjectId, RecordBuilder, TypeDescriptor, TypeDictionary,
        TypeId,
    };
    use tempfile::tempdir;

    #[test]
    fn counts_records_per_channel() {
        let temp = tempdir().unwrap();
        let types = TypeDictionary::new().with(TypeDescriptor::leaf(TypeId(1), "Blob"));
        {
            let db = Database::open_with_config(
                temp.path(),
                Config::new().channel_count(2).types(types).sync_on_write(false),
            )
            .unwrap();
            let bytes = [
                RecordBuilder::new(TypeId(1), ObjectId(2)).build(ByteOrder::Little),
                RecordBuilder::new(TypeId(1), ObjectId(3)).build(ByteOrder::Little),
                RecordBuilder::new(TypeId(1), ObjectId(5)).build(ByteOrder::Little),
            ]
            .concat();
            db.store(&ChunkBuffer::from_bytes(bytes, ByteOrder::Little).unwrap())
                .unwrap();
        }

        let provider = provider_at(temp.path());
        let result = inspect(temp.path(), &provider, 2, ByteOrder::Little, true).unwrap();
        let records: Vec<_> = result.channels.iter().map(|c| c.record_count).collect();
        assert_eq!(records, vec![1, 2]);
        assert_eq!(result.total_size, 72);
        assert!(result.channels.iter().all(|c| c.files.is_some()));
        assert_eq!(format_size(2048), "2.0 KB");
    }
}
