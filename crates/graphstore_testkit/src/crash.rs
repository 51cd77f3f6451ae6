//! Crash simulation for graphstore.
//!
//! [`CrashingFileProvider`] wraps an [`InMemoryFileProvider`] and lets a
//! fixed number of data-file bytes through. The append that crosses the
//! budget writes only its first part and fails; from then on every
//! mutation through the provider fails, as if the process had died. The
//! inner provider keeps exactly the bytes that "reached the disk", so a
//! new database opened over it shows what recovery makes of the crash.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use graphstore_testkit::crash::CrashingFileProvider;
//!
//! let crashing = CrashingFileProvider::new(InMemoryFileProvider::new(), 100);
//! let db = Database::open_with_provider(Arc::new(crashing.clone()), config.clone())?;
//! assert!(db.store(&large_chunk).is_err());
//! drop(db);
//!
//! let recovered = Database::open_with_provider(Arc::new(crashing.disk()), config)?;
//! ```

use graphstore_core::{ChannelIndex, CoreError, CoreResult, FileProvider, InMemoryFileProvider};
use graphstore_storage::{StorageBackend, StorageError, StorageResult};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct CrashState {
    remaining: AtomicU64,
    crashed: AtomicBool,
}

impl CrashState {
    fn check(&self, what: &str) -> StorageResult<()> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(simulated(what));
        }
        Ok(())
    }

    /// Takes up to `wanted` bytes from the budget. Returns how many may be
    /// written; fewer than `wanted` means the crash happens now.
    fn take(&self, wanted: u64) -> u64 {
        let mut granted = 0;
        let _ = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                granted = remaining.min(wanted);
                Some(remaining - granted)
            });
        if granted < wanted {
            self.crashed.store(true, Ordering::SeqCst);
        }
        granted
    }
}

fn simulated(what: &str) -> StorageError {
    StorageError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("simulated crash during {what}"),
    ))
}

/// A file provider that crashes after a byte budget of data appends.
#[derive(Debug, Clone)]
pub struct CrashingFileProvider {
    inner: InMemoryFileProvider,
    state: Arc<CrashState>,
}

impl CrashingFileProvider {
    /// Wraps `inner`, allowing `budget` data-file bytes before crashing.
    pub fn new(inner: InMemoryFileProvider, budget: u64) -> Self {
        Self {
            inner,
            state: Arc::new(CrashState {
                remaining: AtomicU64::new(budget),
                crashed: AtomicBool::new(false),
            }),
        }
    }

    /// Whether the crash happened.
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }

    /// Data-file bytes that may still be written.
    pub fn remaining(&self) -> u64 {
        self.state.remaining.load(Ordering::SeqCst)
    }

    /// The files as they are "on disk", for reopening after the crash.
    pub fn disk(&self) -> InMemoryFileProvider {
        self.inner.clone()
    }

    fn check(&self, what: &str) -> CoreResult<()> {
        self.state.check(what).map_err(CoreError::from)
    }

    fn wrap(&self, inner: Box<dyn StorageBackend>, counted: bool) -> Box<dyn StorageBackend> {
        Box::new(CrashingBackend {
            inner,
            state: Arc::clone(&self.state),
            counted,
        })
    }
}

impl FileProvider for CrashingFileProvider {
    fn list_data_files(&self, channel: ChannelIndex) -> CoreResult<Vec<u64>> {
        self.inner.list_data_files(channel)
    }

    fn open_data_file(
        &self,
        channel: ChannelIndex,
        number: u64,
        create: bool,
    ) -> CoreResult<Box<dyn StorageBackend>> {
        if create {
            self.check("file creation")?;
        }
        let backend = self.inner.open_data_file(channel, number, create)?;
        Ok(self.wrap(backend, true))
    }

    fn delete_data_file(&self, channel: ChannelIndex, number: u64) -> CoreResult<()> {
        self.check("file deletion")?;
        self.inner.delete_data_file(channel, number)
    }

    fn has_transactions_log(&self, channel: ChannelIndex) -> CoreResult<bool> {
        self.inner.has_transactions_log(channel)
    }

    fn open_transactions_log(&self, channel: ChannelIndex) -> CoreResult<Box<dyn StorageBackend>> {
        let backend = self.inner.open_transactions_log(channel)?;
        Ok(self.wrap(backend, false))
    }

    fn replace_transactions_log(
        &self,
        channel: ChannelIndex,
        contents: &[u8],
    ) -> CoreResult<Box<dyn StorageBackend>> {
        self.check("log replacement")?;
        let backend = self.inner.replace_transactions_log(channel, contents)?;
        Ok(self.wrap(backend, false))
    }
}

/// Backend handed out by [`CrashingFileProvider`].
struct CrashingBackend {
    inner: Box<dyn StorageBackend>,
    state: Arc<CrashState>,
    /// Whether appends draw from the byte budget.
    counted: bool,
}

impl StorageBackend for CrashingBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.state.check("append")?;
        if !self.counted {
            return self.inner.append(data);
        }
        let granted = self.state.take(data.len() as u64) as usize;
        if granted < data.len() {
            // Write partial data up to crash point
            if granted > 0 {
                self.inner.append(&data[..granted])?;
            }
            return Err(simulated("partial append"));
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.state.check("flush")?;
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.state.check("sync")?;
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.state.check("truncate")?;
        self.inner.truncate(new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_append_then_everything_fails() {
        let provider = CrashingFileProvider::new(InMemoryFileProvider::new(), 10);
        let channel = ChannelIndex(0);
        let mut data = provider.open_data_file(channel, 1, true).unwrap();
        let mut log = provider.open_transactions_log(channel).unwrap();

        data.append(&[1; 6]).unwrap();
        log.append(&[0; 40]).unwrap();
        assert_eq!(provider.remaining(), 4);
        assert!(data.append(&[2; 6]).is_err());
        assert!(provider.has_crashed());

        assert!(log.append(&[0]).is_err());
        assert!(data.truncate(0).is_err());
        assert!(provider.open_data_file(channel, 2, true).is_err());

        let disk = provider.disk();
        let survived = disk.open_data_file(channel, 1, false).unwrap();
        assert_eq!(survived.read_all().unwrap(), [[1; 6].as_slice(), &[2; 4]].concat());
    }
}
