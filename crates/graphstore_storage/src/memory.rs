//! In-memory byte store.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// A byte buffer that several [`InMemoryBackend`]s can point at.
///
/// Dropping a backend leaves the buffer in place, so a test can "reopen"
/// a file after a simulated crash by creating a new backend over the same
/// buffer.
pub type SharedBuffer = Arc<RwLock<Vec<u8>>>;

/// A byte store held in memory.
///
/// # Example
///
/// ```rust
/// use graphstore_storage::{InMemoryBackend, StorageBackend};
///
/// let mut first = InMemoryBackend::new();
/// first.append(b"abc").unwrap();
///
/// let reopened = InMemoryBackend::shared(first.buffer());
/// assert_eq!(reopened.read_all().unwrap(), b"abc");
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    data: SharedBuffer,
}

impl InMemoryBackend {
    /// Creates an empty store with its own buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store preloaded with `data`.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Creates a store over an existing shared buffer.
    #[must_use]
    pub fn shared(buffer: SharedBuffer) -> Self {
        Self { data: buffer }
    }

    /// Returns the shared buffer behind this store.
    #[must_use]
    pub fn buffer(&self) -> SharedBuffer {
        Arc::clone(&self.data)
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        Ok(())
    }
}
