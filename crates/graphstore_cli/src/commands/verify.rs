//! Verify command implementation.

use super::{manifest_at, provider_at};
use graphstore_core::{verify_channel, ChannelIndex, ChannelReport};
use std::path::Path;

/// Runs the verify command.
pub fn run(path: &Path, only_channel: Option<u32>) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = manifest_at(path)?;
    if let Some(channel) = only_channel {
        if channel >= manifest.channel_count {
            return Err(format!(
                "channel {channel} does not exist; the database has {}",
                manifest.channel_count
            )
            .into());
        }
    }
    println!("Verifying database at {:?}", path);
    println!();

    let provider = provider_at(path);
    let mut failed = false;
    for index in 0..manifest.channel_count {
        if only_channel.is_some_and(|channel| channel != index) {
            continue;
        }
        let report = verify_channel(&provider, ChannelIndex(index), manifest.byte_order)?;
        print_report(&report);
        failed |= !report.problems.is_empty();
    }

    println!();
    if failed {
        println!("✗ Database verification failed");
        Err("Verification failed".into())
    } else {
        println!("✓ Database verification passed");
        Ok(())
    }
}

fn print_report(report: &ChannelReport) {
    let records: u64 = report.files.iter().map(|file| file.records).sum();
    println!(
        "Channel {}: {} log entries, {} files, {} records",
        report.channel.0,
        report.log_entries,
        report.files.len(),
        records
    );
    if report.problems.is_empty() {
        println!("  ✓ OK");
    } else {
        for problem in &report.problems {
            println!("  ✗ {}", problem);
        }
    }
}
