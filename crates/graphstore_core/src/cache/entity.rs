//! Entities as the cache keeps them.

use crate::types::{ObjectId, TypeId};
use std::fmt;

/// Index of an entity in its channel's arena.
///
/// Slots are reused after deletion, so a slot is only meaningful while the
/// entity it was handed out for is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntitySlot(pub(crate) u32);

impl EntitySlot {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Garbage collection color.
///
/// Ordered so that everything at or above [`GcColor::Initial`] counts as
/// marked for the running cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GcColor {
    /// Not yet proven reachable in the current cycle.
    White,
    /// Registered or updated while a sweep was pending; survives that
    /// sweep and is classified in the next cycle.
    Initial,
    /// Reachable, references not yet walked.
    Gray,
    /// Reachable and walked.
    Black,
}

impl GcColor {
    /// Whether the entity survives a sweep.
    #[must_use]
    pub fn is_marked(self) -> bool {
        self >= Self::Initial
    }
}

impl fmt::Display for GcColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::White => "white",
            Self::Initial => "initial",
            Self::Gray => "gray",
            Self::Black => "black",
        })
    }
}

/// Where an entity's current version is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoragePosition {
    /// Data file number.
    pub file: u64,
    /// Byte offset in the data file.
    pub offset: u64,
}

/// One registered entity.
#[derive(Debug, Clone)]
pub struct Entity {
    pub(crate) object_id: ObjectId,
    pub(crate) type_id: TypeId,
    pub(crate) position: StoragePosition,
    pub(crate) length: u64,
    pub(crate) color: GcColor,
    pub(crate) cached: Option<Vec<u8>>,
    pub(crate) last_touched_ms: u64,
    pub(crate) hash_next: Option<EntitySlot>,
}

impl Entity {
    pub(crate) fn new(
        object_id: ObjectId,
        type_id: TypeId,
        position: StoragePosition,
        length: u64,
        color: GcColor,
    ) -> Self {
        Self {
            object_id,
            type_id,
            position,
            length,
            color,
            cached: None,
            last_touched_ms: 0,
            hash_next: None,
        }
    }

    /// The entity's object id.
    #[must_use]
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// The entity's type.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Position of the current version.
    #[must_use]
    pub fn position(&self) -> StoragePosition {
        self.position
    }

    /// Record length including the header.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Current GC color.
    #[must_use]
    pub fn color(&self) -> GcColor {
        self.color
    }

    /// Whether the record bytes are held in memory.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.cached.is_some()
    }

    /// Drops the cached bytes and returns how many were held.
    pub(crate) fn evict(&mut self) -> u64 {
        self.cached.take().map_or(0, |bytes| bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marked_colors() {
        assert!(!GcColor::White.is_marked());
        assert!(GcColor::Initial.is_marked());
        assert!(GcColor::Gray.is_marked());
        assert!(GcColor::Black.is_marked());
    }

    #[test]
    fn evict_reports_bytes() {
        let mut entity = Entity::new(
            ObjectId(1),
            TypeId(1),
            StoragePosition { file: 1, offset: 0 },
            32,
            GcColor::White,
        );
        assert_eq!(entity.evict(), 0);
        entity.cached = Some(vec![0; 32]);
        assert!(entity.is_cached());
        assert_eq!(entity.evict(), 32);
        assert!(!entity.is_cached());
    }
}
