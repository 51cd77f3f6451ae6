//! Export of a database's files to an external sink.
//!
//! An export streams, per channel, the transactions log followed by every
//! data file at its committed length. Channels are exported one after the
//! other with no store in between, so the result is a consistent copy.
//!
//! ```rust,ignore
//! let mut sink = DirectoryExport::create("backup/")?;
//! db.export(&mut sink)?;
//! // "backup/" now opens as a database of its own.
//! ```

use crate::dir::write_manifest;
use crate::error::{CoreError, CoreResult};
use crate::file::DirectoryFileProvider;
use crate::manifest::Manifest;
use crate::types::ChannelIndex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Receives exported files.
pub trait ExportSink: Send {
    /// Receives the database manifest, before any channel.
    ///
    /// # Errors
    ///
    /// Implementations fail on I/O errors.
    fn export_manifest(&mut self, _manifest: &Manifest) -> CoreResult<()> {
        Ok(())
    }

    /// Receives a channel's transactions log.
    ///
    /// # Errors
    ///
    /// Implementations fail on I/O errors.
    fn export_transactions_log(&mut self, channel: ChannelIndex, bytes: &[u8]) -> CoreResult<()>;

    /// Receives one data file of a channel.
    ///
    /// # Errors
    ///
    /// Implementations fail on I/O errors.
    fn export_data_file(&mut self, channel: ChannelIndex, number: u64, bytes: &[u8])
        -> CoreResult<()>;
}

/// Writes the export as a database directory.
#[derive(Debug)]
pub struct DirectoryExport {
    layout: DirectoryFileProvider,
    files_written: usize,
    bytes_written: u64,
}

impl DirectoryExport {
    /// Creates the target directory, which must not hold a database yet.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or already has a manifest.
    pub fn create(target: impl Into<PathBuf>) -> CoreResult<Self> {
        let target = target.into();
        fs::create_dir_all(&target)?;
        if target.join("MANIFEST").exists() {
            return Err(CoreError::invalid_format(format!(
                "export target already holds a database: {}",
                target.display()
            )));
        }
        Ok(Self {
            layout: DirectoryFileProvider::new(target),
            files_written: 0,
            bytes_written: 0,
        })
    }

    /// The target directory.
    #[must_use]
    pub fn target(&self) -> &Path {
        self.layout.root()
    }

    /// Files written so far.
    #[must_use]
    pub fn files_written(&self) -> usize {
        self.files_written
    }

    /// Bytes written so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn write(&mut self, path: PathBuf, bytes: &[u8]) -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        self.files_written += 1;
        self.bytes_written += bytes.len() as u64;
        debug!(path = %path.display(), bytes = bytes.len(), "exported file");
        Ok(())
    }
}

impl ExportSink for DirectoryExport {
    fn export_manifest(&mut self, manifest: &Manifest) -> CoreResult<()> {
        write_manifest(self.layout.root(), manifest)
    }

    fn export_transactions_log(&mut self, channel: ChannelIndex, bytes: &[u8]) -> CoreResult<()> {
        let path = self.layout.transactions_log_path(channel);
        self.write(path, bytes)
    }

    fn export_data_file(&mut self, channel: ChannelIndex, number: u64, bytes: &[u8]) -> CoreResult<()> {
        let path = self.layout.data_file_path(channel, number);
        self.write(path, bytes)
    }
}

/// Keeps the export in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryExport {
    /// The exported manifest.
    pub manifest: Option<Manifest>,
    /// Transactions log per channel.
    pub logs: BTreeMap<ChannelIndex, Vec<u8>>,
    /// Data files per channel and number.
    pub data_files: BTreeMap<(ChannelIndex, u64), Vec<u8>>,
}

impl MemoryExport {
    /// Creates an empty export.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExportSink for MemoryExport {
    fn export_manifest(&mut self, manifest: &Manifest) -> CoreResult<()> {
        self.manifest = Some(*manifest);
        Ok(())
    }

    fn export_transactions_log(&mut self, channel: ChannelIndex, bytes: &[u8]) -> CoreResult<()> {
        self.logs.insert(channel, bytes.to_vec());
        Ok(())
    }

    fn export_data_file(&mut self, channel: ChannelIndex, number: u64, bytes: &[u8]) -> CoreResult<()> {
        self.data_files.insert((channel, number), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ByteOrder;
    use tempfile::tempdir;

    #[test]
    fn directory_export_uses_provider_layout() {
        let temp = tempdir().unwrap();
        let mut sink = DirectoryExport::create(temp.path().join("out")).unwrap();
        sink.export_manifest(&Manifest::new(2, ByteOrder::Little)).unwrap();
        sink.export_transactions_log(ChannelIndex(1), &[1, 2, 3]).unwrap();
        sink.export_data_file(ChannelIndex(1), 4, &[9; 10]).unwrap();

        assert_eq!(sink.files_written(), 2);
        assert_eq!(sink.bytes_written(), 13);
        let layout = DirectoryFileProvider::new(temp.path().join("out"));
        assert_eq!(fs::read(layout.data_file_path(ChannelIndex(1), 4)).unwrap(), vec![9; 10]);
        assert!(temp.path().join("out").join("MANIFEST").exists());

        assert!(DirectoryExport::create(temp.path().join("out")).is_err());
    }
}
