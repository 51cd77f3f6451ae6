//! Where a channel's data files and transactions log live.

use crate::error::{CoreError, CoreResult};
use crate::types::ChannelIndex;
use graphstore_storage::{FileBackend, InMemoryBackend, SharedBuffer, StorageBackend};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Opens, lists and deletes the files of every channel.
///
/// Data files are identified by a channel-local number that only grows.
pub trait FileProvider: Send + Sync + fmt::Debug {
    /// Numbers of the data files present for `channel`, ascending.
    fn list_data_files(&self, channel: ChannelIndex) -> CoreResult<Vec<u64>>;

    /// Opens a data file, creating it empty if `create` is set.
    fn open_data_file(
        &self,
        channel: ChannelIndex,
        number: u64,
        create: bool,
    ) -> CoreResult<Box<dyn StorageBackend>>;

    /// Physically removes a data file.
    fn delete_data_file(&self, channel: ChannelIndex, number: u64) -> CoreResult<()>;

    /// Whether `channel` has a transactions log.
    fn has_transactions_log(&self, channel: ChannelIndex) -> CoreResult<bool>;

    /// Opens the transactions log of `channel`, creating it if missing.
    fn open_transactions_log(&self, channel: ChannelIndex) -> CoreResult<Box<dyn StorageBackend>>;

    /// Atomically replaces the transactions log with `contents` and opens
    /// the result.
    fn replace_transactions_log(
        &self,
        channel: ChannelIndex,
        contents: &[u8],
    ) -> CoreResult<Box<dyn StorageBackend>>;
}

/// Lays files out below a root directory:
///
/// ```text
/// <root>/
/// ├─ channel_0/
/// │  ├─ channel_0_1.dat
/// │  ├─ channel_0_2.dat
/// │  └─ transactions_0.sft
/// └─ channel_1/
///    └─ ...
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryFileProvider {
    root: PathBuf,
}

impl DirectoryFileProvider {
    /// Creates a provider rooted at `root`. Nothing is touched on disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of `channel`.
    #[must_use]
    pub fn channel_directory(&self, channel: ChannelIndex) -> PathBuf {
        self.root.join(format!("channel_{}", channel.0))
    }

    /// Path of a data file.
    #[must_use]
    pub fn data_file_path(&self, channel: ChannelIndex, number: u64) -> PathBuf {
        self.channel_directory(channel)
            .join(format!("channel_{}_{number}.dat", channel.0))
    }

    /// Path of the transactions log.
    #[must_use]
    pub fn transactions_log_path(&self, channel: ChannelIndex) -> PathBuf {
        self.channel_directory(channel)
            .join(format!("transactions_{}.sft", channel.0))
    }

    fn parse_data_file_name(channel: ChannelIndex, name: &str) -> Option<u64> {
        name.strip_prefix(&format!("channel_{}_", channel.0))?
            .strip_suffix(".dat")?
            .parse()
            .ok()
    }

    #[cfg(unix)]
    fn sync_directory(path: &Path) -> CoreResult<()> {
        File::open(path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(_path: &Path) -> CoreResult<()> {
        Ok(())
    }
}

impl FileProvider for DirectoryFileProvider {
    fn list_data_files(&self, channel: ChannelIndex) -> CoreResult<Vec<u64>> {
        let directory = self.channel_directory(channel);
        if !directory.exists() {
            return Ok(Vec::new());
        }
        let mut numbers = Vec::new();
        for entry in fs::read_dir(&directory)? {
            let entry = entry?;
            if let Some(number) = entry
                .file_name()
                .to_str()
                .and_then(|name| Self::parse_data_file_name(channel, name))
            {
                numbers.push(number);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    fn open_data_file(
        &self,
        channel: ChannelIndex,
        number: u64,
        create: bool,
    ) -> CoreResult<Box<dyn StorageBackend>> {
        let path = self.data_file_path(channel, number);
        if !create && !path.exists() {
            return Err(CoreError::consistency(
                channel,
                format!("data file {} is missing", path.display()),
            ));
        }
        let backend = FileBackend::open_with_create_dirs(&path)?;
        if create {
            Self::sync_directory(&self.channel_directory(channel))?;
        }
        Ok(Box::new(backend))
    }

    fn delete_data_file(&self, channel: ChannelIndex, number: u64) -> CoreResult<()> {
        let path = self.data_file_path(channel, number);
        if path.exists() {
            fs::remove_file(&path)?;
            Self::sync_directory(&self.channel_directory(channel))?;
        }
        Ok(())
    }

    fn has_transactions_log(&self, channel: ChannelIndex) -> CoreResult<bool> {
        Ok(self.transactions_log_path(channel).exists())
    }

    fn open_transactions_log(&self, channel: ChannelIndex) -> CoreResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FileBackend::open_with_create_dirs(
            &self.transactions_log_path(channel),
        )?))
    }

    fn replace_transactions_log(
        &self,
        channel: ChannelIndex,
        contents: &[u8],
    ) -> CoreResult<Box<dyn StorageBackend>> {
        let path = self.transactions_log_path(channel);
        let temp_path = path.with_extension("sft.tmp");

        let mut file = File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &path)?;
        Self::sync_directory(&self.channel_directory(channel))?;
        Ok(Box::new(FileBackend::open(&path)?))
    }
}

#[derive(Debug, Default)]
struct MemoryFiles {
    data: HashMap<ChannelIndex, BTreeMap<u64, SharedBuffer>>,
    logs: HashMap<ChannelIndex, SharedBuffer>,
}

/// Keeps every file in memory.
///
/// Clones share the same files, so a test can drop a database and open
/// a new one over the same provider to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFileProvider {
    files: Arc<Mutex<MemoryFiles>>,
}

impl InMemoryFileProvider {
    /// Creates a provider with no files.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The buffer behind a data file, if it exists.
    #[must_use]
    pub fn data_file_buffer(&self, channel: ChannelIndex, number: u64) -> Option<SharedBuffer> {
        self.files
            .lock()
            .data
            .get(&channel)
            .and_then(|files| files.get(&number))
            .cloned()
    }

    /// The buffer behind a transactions log, if it exists.
    #[must_use]
    pub fn transactions_log_buffer(&self, channel: ChannelIndex) -> Option<SharedBuffer> {
        self.files.lock().logs.get(&channel).cloned()
    }
}

impl FileProvider for InMemoryFileProvider {
    fn list_data_files(&self, channel: ChannelIndex) -> CoreResult<Vec<u64>> {
        Ok(self
            .files
            .lock()
            .data
            .get(&channel)
            .map(|files| files.keys().copied().collect())
            .unwrap_or_default())
    }

    fn open_data_file(
        &self,
        channel: ChannelIndex,
        number: u64,
        create: bool,
    ) -> CoreResult<Box<dyn StorageBackend>> {
        let mut files = self.files.lock();
        let channel_files = files.data.entry(channel).or_default();
        let buffer = match channel_files.get(&number) {
            Some(buffer) => Arc::clone(buffer),
            None if create => Arc::clone(channel_files.entry(number).or_default()),
            None => {
                return Err(CoreError::consistency(
                    channel,
                    format!("data file {number} is missing"),
                ))
            }
        };
        Ok(Box::new(InMemoryBackend::shared(buffer)))
    }

    fn delete_data_file(&self, channel: ChannelIndex, number: u64) -> CoreResult<()> {
        if let Some(files) = self.files.lock().data.get_mut(&channel) {
            files.remove(&number);
        }
        Ok(())
    }

    fn has_transactions_log(&self, channel: ChannelIndex) -> CoreResult<bool> {
        Ok(self.files.lock().logs.contains_key(&channel))
    }

    fn open_transactions_log(&self, channel: ChannelIndex) -> CoreResult<Box<dyn StorageBackend>> {
        let buffer = Arc::clone(self.files.lock().logs.entry(channel).or_default());
        Ok(Box::new(InMemoryBackend::shared(buffer)))
    }

    fn replace_transactions_log(
        &self,
        channel: ChannelIndex,
        contents: &[u8],
    ) -> CoreResult<Box<dyn StorageBackend>> {
        let buffer: SharedBuffer = Arc::new(parking_lot::RwLock::new(contents.to_vec()));
        self.files.lock().logs.insert(channel, Arc::clone(&buffer));
        Ok(Box::new(InMemoryBackend::shared(buffer)))
    }
}
