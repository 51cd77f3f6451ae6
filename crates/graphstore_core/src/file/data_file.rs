//! One data file of a channel.

use crate::cache::EntitySlot;
use crate::error::CoreResult;
use crate::policy::FileUsage;
use graphstore_storage::StorageBackend;
use std::collections::BTreeMap;
use std::fmt;

/// A live entity's extent inside a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntityExtent {
    pub(crate) slot: EntitySlot,
    pub(crate) length: u64,
}

/// An append-only data file and the live entities stored in it.
///
/// `entities` is keyed by offset, so it doubles as the increasing-offset
/// chain that dissolving walks. Its size is the file's user count.
pub(crate) struct DataFile {
    pub(crate) number: u64,
    pub(crate) backend: Box<dyn StorageBackend>,
    pub(crate) total_length: u64,
    pub(crate) data_length: u64,
    pub(crate) entities: BTreeMap<u64, EntityExtent>,
}

impl fmt::Debug for DataFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataFile")
            .field("number", &self.number)
            .field("total_length", &self.total_length)
            .field("data_length", &self.data_length)
            .field("users", &self.entities.len())
            .finish_non_exhaustive()
    }
}

impl DataFile {
    pub(crate) fn new(number: u64, backend: Box<dyn StorageBackend>, total_length: u64) -> Self {
        Self {
            number,
            backend,
            total_length,
            data_length: 0,
            entities: BTreeMap::new(),
        }
    }

    pub(crate) fn user_count(&self) -> usize {
        self.entities.len()
    }

    pub(crate) fn has_users(&self) -> bool {
        !self.entities.is_empty()
    }

    pub(crate) fn attach(&mut self, offset: u64, length: u64, slot: EntitySlot) {
        if let Some(previous) = self.entities.insert(offset, EntityExtent { slot, length }) {
            self.data_length -= previous.length;
        }
        self.data_length += length;
    }

    pub(crate) fn detach(&mut self, offset: u64) -> Option<EntityExtent> {
        let extent = self.entities.remove(&offset)?;
        self.data_length -= extent.length;
        Some(extent)
    }

    pub(crate) fn usage(&self, is_head: bool) -> FileUsage {
        FileUsage {
            total_length: self.total_length,
            data_length: self.data_length,
            entity_count: self.entities.len() as u64,
            is_head,
        }
    }

    pub(crate) fn read(&self, offset: u64, length: u64) -> CoreResult<Vec<u8>> {
        Ok(self.backend.read_at(offset, length as usize)?)
    }

    /// The longest run of back-to-back entities starting at the first
    /// live entity whose summed length stays within `limit`. Returns the
    /// run's offset, byte length and entity offsets; a first entity larger
    /// than `limit` yields an empty run.
    pub(crate) fn first_contiguous_run(&self, limit: u64) -> (u64, u64, Vec<u64>) {
        let mut offsets = Vec::new();
        let mut start = 0;
        let mut end = 0;
        for (&offset, extent) in &self.entities {
            if offsets.is_empty() {
                start = offset;
                end = offset;
            } else if offset != end {
                break;
            }
            if end + extent.length - start > limit {
                break;
            }
            offsets.push(offset);
            end = offset + extent.length;
        }
        (start, end - start, offsets)
    }
}
