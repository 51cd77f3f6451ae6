//! Entity arena with a chained object id hash table.
//!
//! Entities live in a dense slot vector. The hash table stores the first
//! slot of each chain; the chain continues through `Entity::hash_next`.
//! The table length is a power of two and the table doubles when it holds
//! as many entities as buckets.

use super::entity::{Entity, EntitySlot};
use crate::types::{ChannelLayout, ObjectId};

const MINIMUM_BUCKETS: usize = 64;

#[derive(Debug)]
pub(crate) struct EntityTable {
    layout: ChannelLayout,
    slots: Vec<Option<Entity>>,
    free: Vec<EntitySlot>,
    buckets: Vec<Option<EntitySlot>>,
    len: usize,
}

impl EntityTable {
    pub(crate) fn new(layout: ChannelLayout) -> Self {
        Self {
            layout,
            slots: Vec::new(),
            free: Vec::new(),
            buckets: vec![None; MINIMUM_BUCKETS],
            len: 0,
        }
    }

    fn bucket_of(&self, oid: ObjectId) -> usize {
        (self.layout.local_hash(oid) as usize) & (self.buckets.len() - 1)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// One past the highest slot ever handed out.
    pub(crate) fn slot_bound(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn find(&self, oid: ObjectId) -> Option<EntitySlot> {
        let mut cursor = self.buckets[self.bucket_of(oid)];
        while let Some(slot) = cursor {
            let entity = self.slots[slot.index()].as_ref()?;
            if entity.object_id == oid {
                return Some(slot);
            }
            cursor = entity.hash_next;
        }
        None
    }

    pub(crate) fn get(&self, slot: EntitySlot) -> Option<&Entity> {
        self.slots.get(slot.index()).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, slot: EntitySlot) -> Option<&mut Entity> {
        self.slots.get_mut(slot.index()).and_then(Option::as_mut)
    }

    /// Registers `entity`, whose id must not be present yet.
    pub(crate) fn insert(&mut self, mut entity: Entity) -> EntitySlot {
        if self.len >= self.buckets.len() {
            self.rebuild(self.buckets.len() * 2);
        }
        let bucket = self.bucket_of(entity.object_id);
        entity.hash_next = self.buckets[bucket];
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot.index()] = Some(entity);
                slot
            }
            None => {
                self.slots.push(Some(entity));
                EntitySlot((self.slots.len() - 1) as u32)
            }
        };
        self.buckets[bucket] = Some(slot);
        self.len += 1;
        slot
    }

    /// Unregisters the entity in `slot`.
    pub(crate) fn remove(&mut self, slot: EntitySlot) -> Option<Entity> {
        let oid = self.get(slot)?.object_id;
        let bucket = self.bucket_of(oid);
        let next = self.get(slot)?.hash_next;

        if self.buckets[bucket] == Some(slot) {
            self.buckets[bucket] = next;
        } else {
            let mut cursor = self.buckets[bucket];
            while let Some(current) = cursor {
                let entity = self.slots[current.index()].as_mut()?;
                if entity.hash_next == Some(slot) {
                    entity.hash_next = next;
                    break;
                }
                cursor = entity.hash_next;
            }
        }

        let mut entity = self.slots[slot.index()].take()?;
        entity.hash_next = None;
        self.free.push(slot);
        self.len -= 1;
        Some(entity)
    }

    /// Shrinks the bucket array if it is at least four times larger than
    /// needed. Returns `true` if it was rebuilt.
    pub(crate) fn consolidate(&mut self) -> bool {
        let target = self.len.next_power_of_two().max(MINIMUM_BUCKETS);
        if self.buckets.len() < target * 4 {
            return false;
        }
        self.rebuild(target * 2);
        // Trailing free slots can be dropped entirely.
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        let bound = self.slots.len();
        self.free.retain(|slot| slot.index() < bound);
        true
    }

    fn rebuild(&mut self, bucket_count: usize) {
        self.buckets = vec![None; bucket_count];
        for index in 0..self.slots.len() {
            let Some(oid) = self.slots[index].as_ref().map(|e| e.object_id) else {
                continue;
            };
            let bucket = self.bucket_of(oid);
            let head = self.buckets[bucket];
            if let Some(entity) = self.slots[index].as_mut() {
                entity.hash_next = head;
            }
            self.buckets[bucket] = Some(EntitySlot(index as u32));
        }
    }

    /// Occupied slots in slot order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (EntitySlot, &Entity)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, entity)| entity.as_ref().map(|e| (EntitySlot(index as u32), e)))
    }
}
