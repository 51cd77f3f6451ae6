//! Export command implementation.

use super::open_database;
use graphstore_core::DirectoryExport;
use std::path::Path;
use tracing::info;

/// Runs the export command.
pub fn run(path: &Path, types: &Path, target: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_database(path, types)?;
    let mut sink = DirectoryExport::create(target)?;
    info!(from = %path.display(), to = %target.display(), "exporting database");
    db.export(&mut sink)?;
    db.close()?;

    println!(
        "Exported {} files ({} bytes) to {}",
        sink.files_written(),
        sink.bytes_written(),
        sink.target().display()
    );
    Ok(())
}
