//! Type descriptors: where a type's records keep their references.

use crate::record::EntityRecord;
use crate::types::{ObjectId, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Location of reference fields inside a record body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceLayout {
    /// The type holds no references.
    None,
    /// One reference per listed body offset.
    Fixed(Vec<usize>),
    /// Starting at the body offset: a `u64` count, then that many ids.
    Variable(usize),
}

/// Field layout of one persisted type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    /// The type's id.
    pub type_id: TypeId,
    /// Human-readable name, used in logs and CLI output.
    pub name: String,
    /// Reference field layout.
    pub layout: ReferenceLayout,
}

impl TypeDescriptor {
    /// Describes a type without references.
    pub fn leaf(type_id: TypeId, name: impl Into<String>) -> Self {
        Self {
            type_id,
            name: name.into(),
            layout: ReferenceLayout::None,
        }
    }

    /// Describes a type with references at fixed body offsets.
    pub fn fixed(type_id: TypeId, name: impl Into<String>, offsets: Vec<usize>) -> Self {
        Self {
            type_id,
            name: name.into(),
            layout: ReferenceLayout::Fixed(offsets),
        }
    }

    /// Describes a type with a counted reference list at `offset`.
    pub fn variable(type_id: TypeId, name: impl Into<String>, offset: usize) -> Self {
        Self {
            type_id,
            name: name.into(),
            layout: ReferenceLayout::Variable(offset),
        }
    }

    /// Returns `true` if instances may reference other objects.
    #[must_use]
    pub fn has_references(&self) -> bool {
        match &self.layout {
            ReferenceLayout::None => false,
            ReferenceLayout::Fixed(offsets) => !offsets.is_empty(),
            ReferenceLayout::Variable(_) => true,
        }
    }

    /// Calls `visit` for each non-null reference in `record`.
    ///
    /// Fields that fall outside the body are skipped; a variable list is
    /// cut at the end of the body.
    pub fn for_each_reference(&self, record: &EntityRecord<'_>, mut visit: impl FnMut(ObjectId)) {
        let mut emit = |value: Option<u64>| {
            if let Some(oid) = value.filter(|&v| v != 0) {
                visit(ObjectId(oid));
            }
        };
        match &self.layout {
            ReferenceLayout::None => {}
            ReferenceLayout::Fixed(offsets) => {
                for &offset in offsets {
                    emit(record.body_u64(offset));
                }
            }
            ReferenceLayout::Variable(offset) => {
                let Some(count) = record.body_u64(*offset) else {
                    return;
                };
                let available = (record.body().len().saturating_sub(offset + 8) / 8) as u64;
                for index in 0..count.min(available) {
                    emit(record.body_u64(offset + 8 + index as usize * 8));
                }
            }
        }
    }
}

/// All type descriptors known to a database.
///
/// Shared read-only by every channel.
#[derive(Debug, Clone, Default)]
pub struct TypeDictionary {
    types: HashMap<TypeId, Arc<TypeDescriptor>>,
}

impl TypeDictionary {
    /// Creates an empty dictionary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a descriptor.
    #[must_use]
    pub fn with(mut self, descriptor: TypeDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    /// Adds or replaces a descriptor.
    pub fn register(&mut self, descriptor: TypeDescriptor) {
        self.types.insert(descriptor.type_id, Arc::new(descriptor));
    }

    /// Looks up a descriptor.
    #[must_use]
    pub fn get(&self, type_id: TypeId) -> Option<&Arc<TypeDescriptor>> {
        self.types.get(&type_id)
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns `true` when no type is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ByteOrder, RecordBuilder};

    fn references_of(descriptor: &TypeDescriptor, bytes: &[u8]) -> Vec<u64> {
        let record = EntityRecord::parse(bytes, ByteOrder::Little).unwrap();
        let mut found = Vec::new();
        descriptor.for_each_reference(&record, |oid| found.push(oid.0));
        found
    }

    #[test]
    fn fixed_layout_skips_null() {
        let descriptor = TypeDescriptor::fixed(TypeId(2), "Pair", vec![0, 8]);
        let bytes = RecordBuilder::new(TypeId(2), ObjectId(10))
            .reference(ObjectId(11))
            .reference(ObjectId::NULL)
            .build(ByteOrder::Little);
        assert_eq!(references_of(&descriptor, &bytes), vec![11]);
        assert!(descriptor.has_references());
    }

    #[test]
    fn variable_layout_stops_at_body_end() {
        let descriptor = TypeDescriptor::variable(TypeId(3), "List", 8);
        let mut bytes = RecordBuilder::new(TypeId(3), ObjectId(10))
            .word(123)
            .references(&[ObjectId(4), ObjectId(5), ObjectId(6)])
            .build(ByteOrder::Little);
        assert_eq!(references_of(&descriptor, &bytes), vec![4, 5, 6]);

        // Claim more elements than the body holds.
        bytes[32] = 9;
        assert_eq!(references_of(&descriptor, &bytes), vec![4, 5, 6]);
    }

    #[test]
    fn leaf_has_no_references() {
        let descriptor = TypeDescriptor::leaf(TypeId(1), "Blob");
        assert!(!descriptor.has_references());
        assert!(!TypeDescriptor::fixed(TypeId(1), "Empty", vec![]).has_references());
    }

    #[test]
    fn dictionary_lookup() {
        let dictionary = TypeDictionary::new()
            .with(TypeDescriptor::leaf(TypeId(1), "Blob"))
            .with(TypeDescriptor::variable(TypeId(2), "List", 0));
        assert_eq!(dictionary.len(), 2);
        assert_eq!(dictionary.get(TypeId(2)).unwrap().name, "List");
        assert!(dictionary.get(TypeId(9)).is_none());
    }
}
