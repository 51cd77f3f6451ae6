//! Per-channel entity cache and local garbage collector.
//!
//! The cache is the authoritative index of a channel's live entities. It
//! is owned by the channel's worker thread; other channels reach it only
//! through its mark queue.
//!
//! ## Collection
//!
//! Entities carry a [`GcColor`]. Marking takes object ids from the
//! channel's [`OidMarkQueue`], walks the references of each entity and
//! hands every referenced id to the [`MarkMonitor`], which queues it at
//! the owning channel. Walked entities turn black. Once the monitor sees
//! no mark pending anywhere it schedules one sweep per channel; the sweep
//! deletes white entities and resets all others to white.
//!
//! Stores keep the cycle sound:
//!
//! - a stored entity whose type has references is queued for marking, as
//!   it may hold the last reference to some other object
//! - an entity stored while its channel's sweep is pending becomes
//!   [`GcColor::Initial`]: it survives that sweep and is classified in the
//!   next cycle, which starts from the root again

mod entity;
mod oid_table;

pub use entity::{Entity, EntitySlot, GcColor, StoragePosition};

use crate::error::{CoreError, CoreResult};
use crate::file::FileManager;
use crate::gc::{MarkMonitor, OidMarkQueue, ReferenceMarker};
use crate::policy::{CacheCandidate, EntityCacheEvaluator, ZombieOidHandler};
use crate::record::{ByteOrder, ChunkBuffer, EntityRecord};
use crate::stats::StorageStats;
use crate::type_dictionary::{TypeDescriptor, TypeDictionary};
use crate::types::{ChannelIndex, ChannelLayout, Interrupts, ObjectId, TypeId};
use oid_table::EntityTable;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Shared collaborators of a channel's entity cache.
#[derive(Debug, Clone)]
pub struct CacheContext {
    /// The owning channel.
    pub channel: ChannelIndex,
    /// Type descriptors.
    pub types: Arc<TypeDictionary>,
    /// Type whose instances are roots. Without one nothing is swept.
    pub root_type: Option<TypeId>,
    /// Cross-channel mark coordination.
    pub monitor: Arc<MarkMonitor>,
    /// Policy for unresolvable marks.
    pub zombie_handler: Arc<dyn ZombieOidHandler>,
    /// Eviction policy of the rolling live check.
    pub cache_evaluator: Arc<dyn EntityCacheEvaluator>,
    /// Counters.
    pub stats: Arc<StorageStats>,
    /// Record byte order.
    pub byte_order: ByteOrder,
    /// Ids taken from the mark queue per batch.
    pub mark_batch_size: usize,
    /// Per-target buffer length of the reference marker.
    pub mark_buffer_length: usize,
    /// Bounded wait on the mark queue during an issued collection.
    pub marking_wait_time: Duration,
    /// Cancellation of issued collections.
    pub interrupts: Arc<Interrupts>,
}

#[derive(Debug)]
struct EntityType {
    descriptor: Arc<TypeDescriptor>,
    /// Entities of the type in registration order.
    entities: Vec<EntitySlot>,
}

/// Size figures of one channel's cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatistics {
    /// The channel.
    pub channel: ChannelIndex,
    /// Registered entities.
    pub entity_count: u64,
    /// Types with a registered entity chain.
    pub type_count: usize,
    /// Bytes of cached record payloads.
    pub cached_bytes: u64,
    /// Length of the object id hash table.
    pub hash_buckets: usize,
}

/// Registry of one channel's entities and types.
#[derive(Debug)]
pub struct EntityCache {
    context: CacheContext,
    layout: ChannelLayout,
    queue: Arc<OidMarkQueue>,
    marker: ReferenceMarker,
    table: EntityTable,
    types: BTreeMap<TypeId, EntityType>,
    used_cache_size: u64,
    live_check_cursor: usize,
    mark_batch: Vec<ObjectId>,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl EntityCache {
    /// Creates an empty cache for `context.channel`.
    #[must_use]
    pub fn new(context: CacheContext) -> Self {
        let layout = context.monitor.layout();
        let queue = Arc::clone(context.monitor.queue(context.channel));
        let marker = ReferenceMarker::new(Arc::clone(&context.monitor), context.mark_buffer_length);
        Self {
            layout,
            queue,
            marker,
            table: EntityTable::new(layout),
            types: BTreeMap::new(),
            used_cache_size: 0,
            live_check_cursor: 0,
            mark_batch: Vec::with_capacity(context.mark_batch_size),
            context,
        }
    }

    /// The owning channel.
    #[must_use]
    pub fn channel(&self) -> ChannelIndex {
        self.context.channel
    }

    /// Looks up the entity registered for `oid`.
    #[must_use]
    pub fn get_entry(&self, oid: ObjectId) -> Option<&Entity> {
        self.table.find(oid).and_then(|slot| self.table.get(slot))
    }

    /// Number of registered entities.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.table.len()
    }

    /// Bytes of cached record payloads.
    #[must_use]
    pub fn used_cache_size(&self) -> u64 {
        self.used_cache_size
    }

    /// All registered entities, in no particular order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.table.iter().map(|(_, entity)| entity)
    }

    fn consistency(&self, message: impl Into<String>) -> CoreError {
        CoreError::consistency(self.context.channel, message)
    }

    fn entity_type(&mut self, type_id: TypeId) -> CoreResult<&mut EntityType> {
        match self.types.entry(type_id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let descriptor = self
                    .context
                    .types
                    .get(type_id)
                    .cloned()
                    .ok_or(CoreError::UnknownType { type_id })?;
                Ok(entry.insert(EntityType {
                    descriptor,
                    entities: Vec::new(),
                }))
            }
        }
    }

    fn check_owner(&self, oid: ObjectId) -> CoreResult<()> {
        let owner = self.layout.channel_of(oid);
        if oid.is_null() || owner != self.context.channel {
            return Err(self.consistency(format!("{oid} is owned by {owner}")));
        }
        Ok(())
    }

    /// Checks that every record of `chunk` may be stored in this channel:
    /// the channel owns its id, its type is known and it does not change
    /// the type of an existing entity.
    ///
    /// Runs before anything is written, so a rejected store leaves no
    /// trace on any channel.
    ///
    /// # Errors
    ///
    /// Returns a consistency violation or [`CoreError::UnknownType`].
    pub fn validate_chunk(&self, chunk: &ChunkBuffer) -> CoreResult<()> {
        for record in chunk.records() {
            let oid = record.object_id();
            self.check_owner(oid)?;
            let type_id = record.type_id();
            if self.context.types.get(type_id).is_none() {
                return Err(CoreError::UnknownType { type_id });
            }
            if let Some(entity) = self.get_entry(oid) {
                if entity.type_id != type_id {
                    return Err(self.consistency(format!(
                        "{oid} is a {} and cannot become a {type_id}",
                        entity.type_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Registers the records of a committed store at `positions`.
    ///
    /// New ids create entities; known ids are re-pointed to the new
    /// version, which drops their cached payload. Entities of types with
    /// references are queued for marking unless this channel's sweep is
    /// pending, in which case they become [`GcColor::Initial`].
    ///
    /// # Errors
    ///
    /// Returns a consistency violation if the file manager does not know
    /// the old or new position.
    pub fn post_store_put_entities(
        &mut self,
        files: &mut FileManager,
        chunk: &ChunkBuffer,
        positions: &[StoragePosition],
    ) -> CoreResult<()> {
        if positions.len() != chunk.record_count() {
            return Err(self.consistency(format!(
                "{} positions for {} stored records",
                positions.len(),
                chunk.record_count()
            )));
        }
        let pending_sweep = self.context.monitor.is_pending_sweep(self.context.channel);
        let now = now_millis();
        for (record, &position) in chunk.records().zip(positions) {
            self.put_entity(files, record, position, pending_sweep, now)?;
        }
        self.marker.flush();
        Ok(())
    }

    fn put_entity(
        &mut self,
        files: &mut FileManager,
        record: EntityRecord<'_>,
        position: StoragePosition,
        pending_sweep: bool,
        now: u64,
    ) -> CoreResult<()> {
        let channel = self.context.channel;
        let oid = record.object_id();
        let type_id = record.type_id();
        let length = record.length();
        let has_references = self.entity_type(type_id)?.descriptor.has_references();
        let color = if pending_sweep {
            GcColor::Initial
        } else if has_references {
            GcColor::Gray
        } else {
            GcColor::Black
        };

        let slot = match self.table.find(oid) {
            Some(slot) => {
                let entity = self
                    .table
                    .get_mut(slot)
                    .ok_or_else(|| CoreError::consistency(channel, format!("{oid} lost its slot")))?;
                if entity.type_id != type_id {
                    return Err(CoreError::consistency(
                        channel,
                        format!("{oid} is a {} and cannot become a {type_id}", entity.type_id),
                    ));
                }
                let previous = entity.position;
                entity.position = position;
                entity.length = length;
                entity.color = color;
                entity.last_touched_ms = now;
                self.used_cache_size = self.used_cache_size.saturating_sub(entity.evict());
                files.detach(previous)?;
                slot
            }
            None => {
                let mut entity = Entity::new(oid, type_id, position, length, color);
                entity.last_touched_ms = now;
                let slot = self.table.insert(entity);
                self.entity_type(type_id)?.entities.push(slot);
                slot
            }
        };
        files.attach(position, length, slot)?;

        if has_references && !pending_sweep {
            self.marker.mark(oid);
        }
        Ok(())
    }

    /// Registers a record found during recovery. Returns `None` if the id
    /// is already registered, which makes the first version seen win.
    ///
    /// Recovered entities start out [`GcColor::Initial`].
    ///
    /// # Errors
    ///
    /// Fails for ids owned by another channel and for unknown types.
    pub fn register_loaded(
        &mut self,
        record: EntityRecord<'_>,
        position: StoragePosition,
    ) -> CoreResult<Option<EntitySlot>> {
        let oid = record.object_id();
        self.check_owner(oid)?;
        if self.table.find(oid).is_some() {
            return Ok(None);
        }
        let type_id = record.type_id();
        self.entity_type(type_id)?;
        let slot = self.table.insert(Entity::new(
            oid,
            type_id,
            position,
            record.length(),
            GcColor::Initial,
        ));
        self.entity_type(type_id)?.entities.push(slot);
        Ok(Some(slot))
    }

    /// Points `slot` at the position its record was transferred to.
    pub fn relocate(&mut self, slot: EntitySlot, position: StoragePosition) {
        if let Some(entity) = self.table.get_mut(slot) {
            entity.position = position;
        }
    }

    /// Processes this channel's mark queue in batches until it is empty or
    /// `deadline` passes. Returns `true` if the queue was drained.
    ///
    /// # Errors
    ///
    /// Fails on read errors, malformed stored records and escalated
    /// zombie ids.
    pub fn incremental_mark(&mut self, files: &FileManager, deadline: Instant) -> CoreResult<bool> {
        let mut batch = std::mem::take(&mut self.mark_batch);
        let result = self.mark_batches(files, deadline, &mut batch);
        self.mark_batch = batch;
        result
    }

    fn mark_batches(
        &mut self,
        files: &FileManager,
        deadline: Instant,
        batch: &mut Vec<ObjectId>,
    ) -> CoreResult<bool> {
        loop {
            let count = self.queue.peek_batch(batch, self.context.mark_batch_size);
            if count == 0 {
                return Ok(true);
            }
            let now = now_millis();
            for &oid in batch.iter() {
                self.mark_entity(files, oid, now)?;
            }
            // Everything found must be counted before the batch is released.
            self.marker.flush();
            self.context.monitor.advance_marking(&self.queue, count)?;
            if Instant::now() >= deadline {
                return Ok(self.queue.is_empty());
            }
        }
    }

    fn mark_entity(&mut self, files: &FileManager, oid: ObjectId, now: u64) -> CoreResult<()> {
        let channel = self.context.channel;
        let Some(slot) = self.table.find(oid) else {
            return self.context.zombie_handler.handle_zombie(channel, oid);
        };
        let Some(entity) = self.table.get_mut(slot) else {
            return Ok(());
        };
        if entity.color == GcColor::Black {
            return Ok(());
        }
        let descriptor = match self.types.get(&entity.type_id) {
            Some(entity_type) => Arc::clone(&entity_type.descriptor),
            None => {
                return Err(CoreError::consistency(
                    channel,
                    format!("{oid} has unregistered type {}", entity.type_id),
                ))
            }
        };

        if descriptor.has_references() {
            let (position, length) = (entity.position, entity.length);
            let (bytes, loaded) = match entity.cached.take() {
                Some(bytes) => (bytes, false),
                None => (files.read_entity(position, length)?, true),
            };
            let record = EntityRecord::parse(&bytes, self.context.byte_order)
                .filter(|record| record.object_id() == oid)
                .ok_or_else(|| {
                    CoreError::consistency(
                        channel,
                        format!("record of {oid} at {}:{} is malformed", position.file, position.offset),
                    )
                })?;
            let marker = &mut self.marker;
            descriptor.for_each_reference(&record, |reference| marker.mark(reference));
            self.return_payload(slot, bytes, loaded, now);
        }

        if let Some(entity) = self.table.get_mut(slot) {
            entity.color = GcColor::Black;
        }
        Ok(())
    }

    /// Puts a payload taken for marking back into the cache. A payload
    /// that had to be read is kept only if the evaluator agrees.
    fn return_payload(&mut self, slot: EntitySlot, bytes: Vec<u8>, loaded: bool, now: u64) {
        let Some(entity) = self.table.get_mut(slot) else {
            return;
        };
        let length = bytes.len() as u64;
        if loaded {
            let candidate = CacheCandidate {
                cached_length: length,
                last_touched_ms: entity.last_touched_ms,
                has_references: true,
            };
            let used = self.used_cache_size + length;
            if self.context.cache_evaluator.clear_entity_cache(used, now, &candidate) {
                return;
            }
            self.used_cache_size = used;
        }
        entity.cached = Some(bytes);
    }

    /// Deletes every white entity and resets all others to white, if this
    /// channel's sweep is scheduled. Returns the number deleted.
    ///
    /// Reports the highest surviving root-type id to the monitor, which
    /// seeds the next cycle from the selected root once every channel has
    /// swept.
    ///
    /// # Errors
    ///
    /// Returns a consistency violation if a deleted entity's file does not
    /// list it.
    pub fn sweep(&mut self, files: &mut FileManager) -> CoreResult<u64> {
        let channel = self.context.channel;
        if !self.context.monitor.is_pending_sweep(channel) {
            return Ok(0);
        }
        let root_type = self.context.root_type;
        let table = &mut self.table;
        let mut doomed = Vec::new();
        let mut root: Option<ObjectId> = None;
        for (&type_id, entity_type) in &mut self.types {
            let is_root_type = Some(type_id) == root_type;
            entity_type.entities.retain(|&slot| {
                let Some(entity) = table.get_mut(slot) else {
                    return false;
                };
                if entity.color == GcColor::White {
                    doomed.push(slot);
                    return false;
                }
                entity.color = GcColor::White;
                if is_root_type {
                    root = root.max(Some(entity.object_id));
                }
                true
            });
        }

        let deleted = doomed.len() as u64;
        for slot in doomed {
            if let Some(mut entity) = self.table.remove(slot) {
                self.used_cache_size = self.used_cache_size.saturating_sub(entity.evict());
                files.detach(entity.position)?;
            }
        }
        self.context.stats.record_sweep(deleted);
        self.context.monitor.complete_sweep(channel, root);
        info!(%channel, deleted, remaining = self.table.len(), "swept channel");
        Ok(deleted)
    }

    /// Advances collection until this channel has nothing left to do or
    /// `deadline` passes. Returns `true` when collection is complete.
    ///
    /// Without a root type only marking runs, and the result says whether
    /// the mark queue was drained.
    ///
    /// # Errors
    ///
    /// Fails like [`incremental_mark`](Self::incremental_mark) and
    /// [`sweep`](Self::sweep).
    pub fn incremental_gc(&mut self, files: &mut FileManager, deadline: Instant) -> CoreResult<bool> {
        if self.context.root_type.is_none() {
            return self.incremental_mark(files, deadline);
        }
        let channel = self.context.channel;
        let monitor = Arc::clone(&self.context.monitor);
        loop {
            if monitor.is_complete(channel) {
                self.consolidate();
                return Ok(true);
            }
            if !monitor.needs_sweep(channel)? {
                let drained = self.incremental_mark(files, deadline)?;
                if !drained || Instant::now() >= deadline || !monitor.needs_sweep(channel)? {
                    return Ok(false);
                }
            }
            self.sweep(files)?;
            if Instant::now() >= deadline {
                return Ok(monitor.is_complete(channel));
            }
        }
    }

    fn gc_complete(&self) -> bool {
        if self.context.root_type.is_none() {
            self.queue.is_empty()
        } else {
            self.context.monitor.is_complete(self.context.channel)
        }
    }

    /// Runs collection until it completes, `deadline` passes or an
    /// interrupt arrives after `epoch`. Between increments it waits on the
    /// mark queue for marks from other channels.
    ///
    /// # Errors
    ///
    /// Fails like [`incremental_gc`](Self::incremental_gc).
    pub fn issued_garbage_collection(
        &mut self,
        files: &mut FileManager,
        deadline: Instant,
        epoch: u64,
    ) -> CoreResult<bool> {
        loop {
            if self.context.interrupts.interrupted_since(epoch) {
                debug!(channel = %self.context.channel, "issued garbage collection interrupted");
                return Ok(self.gc_complete());
            }
            if self.incremental_gc(files, deadline)? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.queue
                .wait_for_entries(self.context.marking_wait_time.min(deadline - now));
        }
    }

    /// Evicts cached payloads the configured evaluator rejects, resuming
    /// where the previous call stopped. Returns `true` once a full round
    /// over all entities completed.
    pub fn incremental_live_check(&mut self, deadline: Instant) -> bool {
        let evaluator = Arc::clone(&self.context.cache_evaluator);
        self.live_check(deadline, evaluator.as_ref())
    }

    /// Like [`incremental_live_check`](Self::incremental_live_check) with
    /// a caller-supplied evaluator.
    pub fn issued_cache_check(&mut self, deadline: Instant, evaluator: &dyn EntityCacheEvaluator) -> bool {
        self.live_check(deadline, evaluator)
    }

    fn live_check(&mut self, deadline: Instant, evaluator: &dyn EntityCacheEvaluator) -> bool {
        let bound = self.table.slot_bound();
        if bound == 0 {
            self.live_check_cursor = 0;
            return true;
        }
        let now = now_millis();
        let mut visited = 0;
        let mut evicted = 0;
        let complete = loop {
            if self.live_check_cursor >= bound {
                self.live_check_cursor = 0;
            }
            if let Some(entity) = self.table.get_mut(EntitySlot(self.live_check_cursor as u32)) {
                if let Some(cached) = &entity.cached {
                    let candidate = CacheCandidate {
                        cached_length: cached.len() as u64,
                        last_touched_ms: entity.last_touched_ms,
                        has_references: self
                            .types
                            .get(&entity.type_id)
                            .is_some_and(|t| t.descriptor.has_references()),
                    };
                    if evaluator.clear_entity_cache(self.used_cache_size, now, &candidate) {
                        self.used_cache_size = self.used_cache_size.saturating_sub(entity.evict());
                        evicted += 1;
                    }
                }
            }
            self.live_check_cursor += 1;
            visited += 1;
            if visited >= bound {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
        };
        if evicted > 0 {
            self.context.stats.record_cache_evictions(evicted);
            debug!(channel = %self.context.channel, evicted, visited, "evicted cached payloads");
        }
        complete
    }

    fn load_into(
        &mut self,
        files: &FileManager,
        slot: EntitySlot,
        chunk: &mut ChunkBuffer,
    ) -> CoreResult<()> {
        let channel = self.context.channel;
        let order = self.context.byte_order;
        let entity = self
            .table
            .get_mut(slot)
            .ok_or_else(|| CoreError::consistency(channel, "load of an unregistered slot"))?;
        entity.last_touched_ms = now_millis();
        if entity.cached.is_none() {
            let bytes = files.read_entity(entity.position, entity.length)?;
            self.used_cache_size += bytes.len() as u64;
            entity.cached = Some(bytes);
        }
        let bytes = entity.cached.as_deref().unwrap_or_default();
        let record = EntityRecord::parse(bytes, order).ok_or_else(|| {
            CoreError::consistency(channel, format!("record of {} is malformed", entity.object_id))
        })?;
        chunk.push(record);
        Ok(())
    }

    /// Appends the current record of each id to `chunk`, caching what it
    /// reads.
    ///
    /// # Errors
    ///
    /// An id that is not registered is a consistency violation.
    pub fn collect_load_by_oids(
        &mut self,
        files: &FileManager,
        oids: &[ObjectId],
        chunk: &mut ChunkBuffer,
    ) -> CoreResult<()> {
        for &oid in oids {
            let slot = self
                .table
                .find(oid)
                .ok_or_else(|| self.consistency(format!("{oid} is not stored")))?;
            self.load_into(files, slot, chunk)?;
        }
        Ok(())
    }

    /// Appends every entity of the given types, in registration order.
    /// Types without entities add nothing.
    ///
    /// # Errors
    ///
    /// Fails on read errors.
    pub fn collect_load_by_tids(
        &mut self,
        files: &FileManager,
        type_ids: &[TypeId],
        chunk: &mut ChunkBuffer,
    ) -> CoreResult<()> {
        for type_id in type_ids {
            let slots = self
                .types
                .get(type_id)
                .map(|entity_type| entity_type.entities.clone())
                .unwrap_or_default();
            for slot in slots {
                self.load_into(files, slot, chunk)?;
            }
        }
        Ok(())
    }

    /// This channel's root candidate: its highest root-type id.
    #[must_use]
    pub fn root_candidate(&self) -> Option<ObjectId> {
        let entity_type = self.types.get(&self.context.root_type?)?;
        entity_type
            .entities
            .iter()
            .filter_map(|&slot| self.table.get(slot))
            .map(|entity| entity.object_id)
            .max()
    }

    /// Appends this channel's root candidate, if any.
    ///
    /// # Errors
    ///
    /// Fails on read errors.
    pub fn collect_load_roots(&mut self, files: &FileManager, chunk: &mut ChunkBuffer) -> CoreResult<()> {
        match self.root_candidate() {
            Some(root) => self.collect_load_by_oids(files, &[root], chunk),
            None => Ok(()),
        }
    }

    /// Shrinks the object id table if it is far larger than needed.
    pub fn consolidate(&mut self) -> bool {
        let shrunk = self.table.consolidate();
        if shrunk {
            for entity_type in self.types.values_mut() {
                entity_type.entities.shrink_to_fit();
            }
            debug!(
                channel = %self.context.channel,
                buckets = self.table.bucket_count(),
                "consolidated entity table"
            );
        }
        shrunk
    }

    /// Current size figures.
    #[must_use]
    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            channel: self.context.channel,
            entity_count: self.table.len() as u64,
            type_count: self.types.len(),
            cached_bytes: self.used_cache_size,
            hash_buckets: self.table.bucket_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{ChannelInventory, FileContext, InMemoryFileProvider};
    use crate::policy::{
        DefaultCacheEvaluator, DefaultFileEvaluator, EvictAll, FailOnZombies, HighestRootOid,
        IgnoreZombies,
    };
    use crate::record::RecordBuilder;
    use crate::types::TimestampProvider;

    const ROOT: TypeId = TypeId(1);
    const NODE: TypeId = TypeId(2);
    const LEAF: TypeId = TypeId(3);

    struct Harness {
        cache: EntityCache,
        files: FileManager,
        monitor: Arc<MarkMonitor>,
        timestamp: u64,
    }

    fn harness(channels: u32, zombies: Arc<dyn ZombieOidHandler>) -> Harness {
        let layout = ChannelLayout::new(channels).unwrap();
        let monitor = Arc::new(MarkMonitor::new(layout, Arc::new(HighestRootOid)));
        let stats = Arc::new(StorageStats::new());
        let types = TypeDictionary::new()
            .with(TypeDescriptor::fixed(ROOT, "Root", vec![0]))
            .with(TypeDescriptor::variable(NODE, "Node", 0))
            .with(TypeDescriptor::leaf(LEAF, "Leaf"));
        let cache = EntityCache::new(CacheContext {
            channel: ChannelIndex(0),
            types: Arc::new(types),
            root_type: Some(ROOT),
            monitor: Arc::clone(&monitor),
            zombie_handler: zombies,
            cache_evaluator: Arc::new(DefaultCacheEvaluator::default()),
            stats: Arc::clone(&stats),
            byte_order: ByteOrder::Little,
            mark_batch_size: 4,
            mark_buffer_length: 2,
            marking_wait_time: Duration::from_millis(1),
            interrupts: Arc::new(Interrupts::new()),
        });
        let context = FileContext {
            channel: ChannelIndex(0),
            provider: Arc::new(InMemoryFileProvider::new()),
            evaluator: Arc::new(DefaultFileEvaluator::default()),
            timestamps: Arc::new(TimestampProvider::new()),
            stats,
            byte_order: ByteOrder::Little,
            sync_on_write: false,
        };
        let inventory = ChannelInventory::read(&context).unwrap();
        let (files, _) = inventory.recover(context, 0, |_, _| Ok(None)).unwrap();
        Harness {
            cache,
            files,
            monitor,
            timestamp: 0,
        }
    }

    fn root(oid: u64, child: u64) -> Vec<u8> {
        RecordBuilder::new(ROOT, ObjectId(oid))
            .reference(ObjectId(child))
            .build(ByteOrder::Little)
    }

    fn node(oid: u64, children: &[u64]) -> Vec<u8> {
        let children: Vec<_> = children.iter().copied().map(ObjectId).collect();
        RecordBuilder::new(NODE, ObjectId(oid))
            .references(&children)
            .build(ByteOrder::Little)
    }

    fn leaf(oid: u64) -> Vec<u8> {
        RecordBuilder::new(LEAF, ObjectId(oid))
            .raw(&[1, 2, 3])
            .build(ByteOrder::Little)
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    impl Harness {
        fn store(&mut self, records: &[Vec<u8>]) -> CoreResult<()> {
            let chunk = ChunkBuffer::from_bytes(records.concat(), ByteOrder::Little)?;
            self.cache.validate_chunk(&chunk)?;
            self.monitor.register_pending_store_update(ChannelIndex(0));
            self.timestamp += 1;
            let positions = self.files.store_chunks(self.timestamp, &chunk)?;
            self.files.commit_write()?;
            self.cache
                .post_store_put_entities(&mut self.files, &chunk, &positions)?;
            self.monitor.clear_pending_store_update(ChannelIndex(0));
            Ok(())
        }

        fn collect(&mut self) -> bool {
            self.cache
                .issued_garbage_collection(&mut self.files, far(), 0)
                .unwrap()
        }

        fn contains(&self, oid: u64) -> bool {
            self.cache.get_entry(ObjectId(oid)).is_some()
        }
    }

    #[test]
    fn now_millis_counts_from_the_epoch() {
        let expected = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis();
        let now = u128::from(now_millis());
        assert!(now + 1000 >= expected && now <= expected + 1000);
    }

    #[test]
    fn store_then_get_and_load() {
        let mut h = harness(1, Arc::new(IgnoreZombies));
        let record = leaf(42);
        h.store(&[record.clone()]).unwrap();

        let entity = h.cache.get_entry(ObjectId(42)).unwrap();
        assert_eq!(entity.type_id(), LEAF);
        assert_eq!(entity.length(), 27);
        assert_eq!(entity.position(), StoragePosition { file: 1, offset: 0 });
        assert_eq!(entity.color(), GcColor::Black);
        assert!(!entity.is_cached());

        let mut chunk = ChunkBuffer::new(ByteOrder::Little);
        h.cache
            .collect_load_by_oids(&h.files, &[ObjectId(42)], &mut chunk)
            .unwrap();
        assert_eq!(chunk.as_bytes(), record.as_slice());
        assert_eq!(chunk.records().next().unwrap().body(), &[1, 2, 3]);
        assert_eq!(h.cache.used_cache_size(), 27);

        let missing = h
            .cache
            .collect_load_by_oids(&h.files, &[ObjectId(43)], &mut chunk);
        assert!(matches!(missing, Err(CoreError::Consistency { .. })));
    }

    #[test]
    fn update_repoints_and_drops_cache() {
        let mut h = harness(1, Arc::new(IgnoreZombies));
        h.store(&[leaf(8)]).unwrap();
        let mut chunk = ChunkBuffer::new(ByteOrder::Little);
        h.cache
            .collect_load_by_oids(&h.files, &[ObjectId(8)], &mut chunk)
            .unwrap();
        assert!(h.cache.get_entry(ObjectId(8)).unwrap().is_cached());

        h.store(&[leaf(8)]).unwrap();
        let entity = h.cache.get_entry(ObjectId(8)).unwrap();
        assert_eq!(entity.position().offset, 27);
        assert!(!entity.is_cached());
        assert_eq!(h.cache.used_cache_size(), 0);
        assert_eq!(h.cache.entity_count(), 1);
        let stats = h.files.statistics();
        assert_eq!(stats[0].entity_count, 1);
        assert_eq!(stats[0].data_length, 27);
    }

    #[test]
    fn foreign_ids_are_rejected() {
        let mut h = harness(2, Arc::new(IgnoreZombies));
        assert!(matches!(
            h.store(&[leaf(3)]),
            Err(CoreError::Consistency { .. })
        ));
        assert!(h.store(&[leaf(4)]).is_ok());
        assert_eq!(h.files.statistics()[0].total_length, 27);
    }

    #[test]
    fn type_changes_and_unknown_types_are_rejected() {
        let mut h = harness(1, Arc::new(IgnoreZombies));
        h.store(&[leaf(4)]).unwrap();
        assert!(matches!(
            h.store(&[node(4, &[])]),
            Err(CoreError::Consistency { .. })
        ));
        let unknown = RecordBuilder::new(TypeId(99), ObjectId(5)).build(ByteOrder::Little);
        assert!(matches!(
            h.store(&[unknown]),
            Err(CoreError::UnknownType { type_id: TypeId(99) })
        ));
    }

    #[test]
    fn gc_reclaims_orphan() {
        let mut h = harness(1, Arc::new(IgnoreZombies));
        h.store(&[root(1, 2), node(2, &[3]), leaf(3)]).unwrap();
        assert!(h.collect());
        assert!(h.contains(1) && h.contains(2) && h.contains(3));

        h.store(&[node(2, &[])]).unwrap();
        assert!(h.collect());
        assert!(h.contains(1) && h.contains(2));
        assert!(!h.contains(3));
        let stats = h.files.statistics();
        assert_eq!(stats[0].entity_count, 2);
    }

    #[test]
    fn second_sweep_deletes_nothing() {
        let mut h = harness(1, Arc::new(IgnoreZombies));
        h.store(&[root(1, 0), leaf(5)]).unwrap();

        assert!(h.cache.incremental_mark(&h.files, far()).unwrap());
        assert!(h.monitor.needs_sweep(ChannelIndex(0)).unwrap());
        assert_eq!(h.cache.sweep(&mut h.files).unwrap(), 0);
        assert_eq!(h.cache.sweep(&mut h.files).unwrap(), 0);

        // The root was re-seeded; the orphan is white now.
        assert!(h.cache.incremental_mark(&h.files, far()).unwrap());
        assert!(h.monitor.needs_sweep(ChannelIndex(0)).unwrap());
        assert_eq!(h.cache.sweep(&mut h.files).unwrap(), 1);
        assert_eq!(h.cache.sweep(&mut h.files).unwrap(), 0);
        assert!(h.contains(1));
        assert!(!h.contains(5));
    }

    #[test]
    fn store_during_pending_sweep_survives_it() {
        let mut h = harness(1, Arc::new(IgnoreZombies));
        h.store(&[root(1, 0)]).unwrap();
        assert!(h.cache.incremental_mark(&h.files, far()).unwrap());
        assert!(h.monitor.needs_sweep(ChannelIndex(0)).unwrap());

        h.store(&[root(1, 7), leaf(7)]).unwrap();
        assert_eq!(h.cache.get_entry(ObjectId(7)).unwrap().color(), GcColor::Initial);
        assert_eq!(h.cache.sweep(&mut h.files).unwrap(), 0);
        assert!(h.collect());
        assert!(h.contains(7));
    }

    #[test]
    fn zombie_policy_decides() {
        let mut h = harness(1, Arc::new(FailOnZombies));
        h.store(&[node(2, &[99])]).unwrap();
        assert!(matches!(
            h.cache.incremental_mark(&h.files, far()),
            Err(CoreError::ZombieObjectId { oid: ObjectId(99) })
        ));

        let mut h = harness(1, Arc::new(IgnoreZombies));
        h.store(&[node(2, &[99])]).unwrap();
        assert!(h.cache.incremental_mark(&h.files, far()).unwrap());
        assert_eq!(h.monitor.snapshot().pending_marks, 0);
    }

    #[test]
    fn live_check_evicts_and_resumes() {
        let mut h = harness(1, Arc::new(IgnoreZombies));
        h.store(&[leaf(1), leaf(2), leaf(3)]).unwrap();
        let mut chunk = ChunkBuffer::new(ByteOrder::Little);
        let oids = [ObjectId(1), ObjectId(2), ObjectId(3)];
        h.cache.collect_load_by_oids(&h.files, &oids, &mut chunk).unwrap();
        assert_eq!(h.cache.used_cache_size(), 81);

        // Default thresholds keep fresh payloads.
        assert!(h.cache.incremental_live_check(far()));
        assert_eq!(h.cache.used_cache_size(), 81);

        // An expired deadline still makes progress.
        assert!(!h.cache.issued_cache_check(Instant::now(), &EvictAll));
        assert_eq!(h.cache.used_cache_size(), 54);
        assert!(h.cache.issued_cache_check(far(), &EvictAll));
        assert_eq!(h.cache.used_cache_size(), 0);
    }

    #[test]
    fn recovery_registration_keeps_first_version() {
        let mut h = harness(1, Arc::new(IgnoreZombies));
        let newer = leaf(6);
        let older = RecordBuilder::new(LEAF, ObjectId(6)).build(ByteOrder::Little);
        let position = StoragePosition { file: 1, offset: 0 };
        let record = EntityRecord::parse(&newer, ByteOrder::Little).unwrap();
        assert!(h.cache.register_loaded(record, position).unwrap().is_some());
        let record = EntityRecord::parse(&older, ByteOrder::Little).unwrap();
        assert!(h.cache.register_loaded(record, position).unwrap().is_none());

        let entity = h.cache.get_entry(ObjectId(6)).unwrap();
        assert_eq!(entity.length(), 27);
        assert_eq!(entity.color(), GcColor::Initial);
    }

    #[test]
    fn loads_by_type_and_root() {
        let mut h = harness(1, Arc::new(IgnoreZombies));
        h.store(&[leaf(4), root(2, 4), leaf(3), root(9, 0)]).unwrap();

        let mut chunk = ChunkBuffer::new(ByteOrder::Little);
        h.cache
            .collect_load_by_tids(&h.files, &[LEAF, TypeId(50)], &mut chunk)
            .unwrap();
        let oids: Vec<_> = chunk.records().map(|r| r.object_id().0).collect();
        assert_eq!(oids, vec![4, 3]);

        let mut chunk = ChunkBuffer::new(ByteOrder::Little);
        h.cache.collect_load_roots(&h.files, &mut chunk).unwrap();
        assert_eq!(chunk.record_count(), 1);
        assert_eq!(h.cache.root_candidate(), Some(ObjectId(9)));
    }

    #[test]
    fn interrupted_collection_returns_early() {
        let mut h = harness(1, Arc::new(IgnoreZombies));
        h.store(&[root(1, 0)]).unwrap();
        h.cache.context.interrupts.interrupt();
        let complete = h
            .cache
            .issued_garbage_collection(&mut h.files, far(), 0)
            .unwrap();
        assert!(!complete);

        let epoch = h.cache.context.interrupts.epoch();
        assert!(h
            .cache
            .issued_garbage_collection(&mut h.files, far(), epoch)
            .unwrap());
    }
}
