//! Database facade and startup recovery.

use crate::cache::{CacheContext, EntityCache, StoragePosition};
use crate::channel::{
    collect_root_candidates, ChannelHandle, ChannelStatistics, ChannelWorker, Command, ExportPiece,
    LoadRequest, Reply, WorkerSettings,
};
use crate::config::Config;
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::export::ExportSink;
use crate::file::{
    consistent_timestamp, ChannelInventory, DirectoryFileProvider, FileContext, FileProvider,
    FileStatistics, InMemoryFileProvider,
};
use crate::gc::{MarkMonitor, MonitorSnapshot};
use crate::manifest::Manifest;
use crate::policy::EntityCacheEvaluator;
use crate::record::{scan_file, ChunkBuffer, FileSlot};
use crate::stats::{StatsSnapshot, StorageStats};
use crate::types::{ChannelIndex, ChannelLayout, Interrupts, ObjectId, TimestampProvider, TypeId};
use crossbeam_channel::bounded;
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where one stored record ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredEntity {
    /// The record's object id.
    pub object_id: ObjectId,
    /// The owning channel.
    pub channel: ChannelIndex,
    /// Position of the new version in the channel's files.
    pub position: StoragePosition,
}

/// Outcome of a committed store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreResult {
    /// The store's timestamp, logged by every channel.
    pub timestamp: u64,
    /// One entry per stored record, in chunk order.
    pub positions: Vec<StoredEntity>,
}

/// The main database handle.
///
/// A database is a fixed number of channels. Each channel owns the
/// entities whose object id maps to it, keeps them in its own data files
/// and runs a worker thread that stores, loads and collects garbage for
/// them.
///
/// # Opening a Database
///
/// ```rust,ignore
/// use graphstore_core::{Config, Database, TypeDescriptor, TypeDictionary, TypeId};
/// use std::path::Path;
///
/// let types = TypeDictionary::new()
///     .with(TypeDescriptor::fixed(TypeId(1), "Root", vec![0]))
///     .with(TypeDescriptor::leaf(TypeId(2), "Blob"));
/// let config = Config::new().channel_count(4).types(types).root_type(TypeId(1));
/// let db = Database::open_with_config(Path::new("my_graph"), config)?;
///
/// db.store(&chunk)?;
/// let roots = db.load_roots()?;
/// db.close()?;
/// ```
///
/// # Stores
///
/// A store is atomic across channels: every channel writes and logs its
/// share under one timestamp, and only once all of them succeeded does
/// any channel commit and update its entity index. If one channel fails,
/// all of them roll back.
///
/// # In-Memory Databases
///
/// For testing, use `Database::open_in_memory(config)`.
pub struct Database {
    /// Configuration.
    config: Config,
    /// Database directory (holds the lock). None without a directory.
    dir: Option<DatabaseDir>,
    /// Settings fixed at creation.
    manifest: Manifest,
    layout: ChannelLayout,
    channels: Vec<ChannelHandle>,
    monitor: Arc<MarkMonitor>,
    timestamps: Arc<TimestampProvider>,
    stats: Arc<StorageStats>,
    interrupts: Arc<Interrupts>,
    /// Serializes stores and exports.
    store_lock: Mutex<()>,
    /// Whether the database is open.
    is_open: RwLock<bool>,
}

impl Database {
    /// Opens a database from a directory path with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process has the database locked (`DatabaseLocked`)
    /// - The manifest is unreadable (`InvalidFormat`)
    /// - Recovery finds files that contradict their log (`Consistency`)
    /// - I/O errors occur
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens a database from a directory path with custom configuration.
    ///
    /// For an existing database the channel count and byte order stored in
    /// its manifest take precedence over `config`.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use graphstore_core::{Config, Database};
    /// use std::path::Path;
    ///
    /// let config = Config::default()
    ///     .create_if_missing(true)
    ///     .channel_count(8);
    ///
    /// let db = Database::open_with_config(Path::new("my_graph"), config)?;
    /// ```
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Self> {
        config.validate()?;
        let dir = DatabaseDir::open(path, config.create_if_missing)?;

        let manifest = match dir.load_manifest()? {
            Some(manifest) => {
                if config.error_if_exists {
                    return Err(CoreError::invalid_format(
                        "database already exists and error_if_exists is true",
                    ));
                }
                Self::reconcile(&config, manifest)
            }
            None => {
                if !config.create_if_missing {
                    return Err(CoreError::invalid_format(
                        "database does not exist and create_if_missing is false",
                    ));
                }
                let manifest = Manifest::new(config.channel_count, config.byte_order);
                dir.save_manifest(&manifest)?;
                manifest
            }
        };

        let provider = Arc::new(DirectoryFileProvider::new(dir.path()));
        Self::start(config, provider, manifest, Some(dir))
    }

    /// Opens a database over `provider` without a directory or manifest;
    /// channel count and byte order come from `config`.
    ///
    /// Reopening over a clone of an [`InMemoryFileProvider`] recovers what
    /// the previous instance stored.
    ///
    /// # Errors
    ///
    /// Fails like [`open`](Self::open).
    pub fn open_with_provider(provider: Arc<dyn FileProvider>, config: Config) -> CoreResult<Self> {
        config.validate()?;
        let manifest = Manifest::new(config.channel_count, config.byte_order);
        Self::start(config, provider, manifest, None)
    }

    /// Opens a fresh in-memory database for testing.
    ///
    /// Data is lost when the database is closed.
    ///
    /// # Errors
    ///
    /// Fails for an invalid configuration.
    pub fn open_in_memory(config: Config) -> CoreResult<Self> {
        Self::open_with_provider(Arc::new(InMemoryFileProvider::new()), config)
    }

    fn reconcile(config: &Config, manifest: Manifest) -> Manifest {
        if manifest.channel_count != config.channel_count || manifest.byte_order != config.byte_order {
            warn!(
                manifest_channels = manifest.channel_count,
                config_channels = config.channel_count,
                manifest_byte_order = ?manifest.byte_order,
                config_byte_order = ?config.byte_order,
                "configuration differs from the database manifest; using the manifest"
            );
        }
        manifest
    }

    /// Recovers every channel and starts the workers.
    fn start(
        config: Config,
        provider: Arc<dyn FileProvider>,
        manifest: Manifest,
        dir: Option<DatabaseDir>,
    ) -> CoreResult<Self> {
        let layout = manifest.layout()?;
        let byte_order = manifest.byte_order;
        let monitor = Arc::new(MarkMonitor::new(layout, Arc::clone(&config.root_selector)));
        let stats = Arc::new(StorageStats::new());
        let timestamps = Arc::new(TimestampProvider::new());
        let interrupts = Arc::new(Interrupts::new());
        let types = Arc::new(config.types.clone());
        let file_evaluator = config.effective_file_evaluator();
        let cache_evaluator = config.effective_cache_evaluator();

        let contexts: Vec<FileContext> = layout
            .channels()
            .map(|channel| FileContext {
                channel,
                provider: Arc::clone(&provider),
                evaluator: Arc::clone(&file_evaluator),
                timestamps: Arc::clone(&timestamps),
                stats: Arc::clone(&stats),
                byte_order,
                sync_on_write: config.sync_on_write,
            })
            .collect();
        let inventories = contexts
            .iter()
            .map(ChannelInventory::read)
            .collect::<CoreResult<Vec<_>>>()?;

        // Timestamps handed out from now on must exceed everything logged.
        if let Some(max) = inventories.iter().map(ChannelInventory::max_timestamp).max() {
            timestamps.observe(max);
        }
        let consistent = consistent_timestamp(&inventories);

        let settings = WorkerSettings {
            housekeeping_interval: config.housekeeping_interval,
            housekeeping_budget: config.housekeeping_time_budget,
            byte_order,
        };
        let mut workers = Vec::with_capacity(contexts.len());
        let mut entities = 0;
        for (inventory, context) in inventories.into_iter().zip(contexts) {
            let mut cache = EntityCache::new(CacheContext {
                channel: context.channel,
                types: Arc::clone(&types),
                root_type: config.root_type_id,
                monitor: Arc::clone(&monitor),
                zombie_handler: Arc::clone(&config.zombie_handler),
                cache_evaluator: Arc::clone(&cache_evaluator),
                stats: Arc::clone(&stats),
                byte_order,
                mark_batch_size: config.mark_batch_size,
                mark_buffer_length: config.mark_buffer_length,
                marking_wait_time: config.marking_wait_time,
                interrupts: Arc::clone(&interrupts),
            });
            let (files, summary) = inventory.recover(context, consistent, |record, position| {
                cache.register_loaded(record, position)
            })?;
            entities += summary.entities;
            workers.push(ChannelWorker::new(cache, files, Arc::clone(&monitor), settings));
        }
        // Recovered entities are unclassified; collection has to run again.
        monitor.reset_completion();

        let channels = workers
            .into_iter()
            .map(ChannelHandle::spawn)
            .collect::<CoreResult<Vec<_>>>()?;
        info!(
            channels = layout.count(),
            entities,
            consistent_timestamp = consistent,
            path = ?dir.as_ref().map(DatabaseDir::path),
            "opened database"
        );

        Ok(Self {
            config,
            dir,
            manifest,
            layout,
            channels,
            monitor,
            timestamps,
            stats,
            interrupts,
            store_lock: Mutex::new(()),
            is_open: RwLock::new(true),
        })
    }

    /// Ensures the database is open.
    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::Shutdown)
        }
    }

    /// Sends one request per channel, then collects the answers in channel
    /// order.
    fn broadcast<T>(&self, mut command: impl FnMut(Reply<T>) -> Command) -> CoreResult<Vec<T>> {
        let receivers = self
            .channels
            .iter()
            .map(|handle| handle.request(&mut command))
            .collect::<CoreResult<Vec<_>>>()?;
        self.channels
            .iter()
            .zip(&receivers)
            .map(|(handle, receiver)| handle.wait(receiver))
            .collect()
    }

    /// Stores a chunk of records, routing each to the channel owning its
    /// object id.
    ///
    /// Known object ids get a new version; unknown ones are created. The
    /// store is atomic: it either commits on every channel or leaves no
    /// entity changed.
    ///
    /// # Errors
    ///
    /// - `UnknownType` or `Consistency` for a record the owning channel
    ///   rejects (unregistered type, changed type)
    /// - `InvalidRecord` for a chunk in the wrong byte order
    /// - `ChannelStopped` if a channel was disrupted
    /// - I/O errors
    pub fn store(&self, chunk: &ChunkBuffer) -> CoreResult<StoreResult> {
        self.ensure_open()?;
        if chunk.byte_order() != self.manifest.byte_order {
            return Err(CoreError::invalid_record(
                0,
                "chunk byte order differs from the database",
            ));
        }
        let _guard = self.store_lock.lock();
        let parts = chunk.split_by_channel(self.layout);
        let timestamp = self.timestamps.next();
        for channel in self.layout.channels() {
            self.monitor.register_pending_store_update(channel);
        }

        let receivers: Vec<_> = self
            .channels
            .iter()
            .zip(parts)
            .map(|(handle, part)| {
                handle.request(|reply| Command::Write {
                    timestamp,
                    chunk: part,
                    reply,
                })
            })
            .collect();
        let written: Vec<CoreResult<Vec<StoragePosition>>> = self
            .channels
            .iter()
            .zip(receivers)
            .map(|(handle, receiver)| receiver.and_then(|receiver| handle.wait(&receiver)))
            .collect();
        let commit = written.iter().all(Result::is_ok);

        let finish_receivers: Vec<_> = self
            .channels
            .iter()
            .map(|handle| handle.request(|reply| Command::Finish { commit, reply }))
            .collect();
        let mut finish_error = None;
        for (handle, receiver) in self.channels.iter().zip(finish_receivers) {
            if let Err(error) = receiver.and_then(|receiver| handle.wait(&receiver)) {
                finish_error.get_or_insert(error);
            }
        }
        // A stopped channel cannot clear its own flag.
        for channel in self.layout.channels() {
            self.monitor.clear_pending_store_update(channel);
        }

        let mut positions_by_channel = Vec::with_capacity(written.len());
        for result in written {
            positions_by_channel.push(result?);
        }
        if let Some(error) = finish_error {
            return Err(error);
        }

        let mut cursors = vec![0; positions_by_channel.len()];
        let mut positions = Vec::with_capacity(chunk.record_count());
        for record in chunk.records() {
            let object_id = record.object_id();
            let channel = self.layout.channel_of(object_id);
            let index = channel.as_usize();
            let position = positions_by_channel[index]
                .get(cursors[index])
                .copied()
                .ok_or_else(|| CoreError::consistency(channel, "store returned too few positions"))?;
            cursors[index] += 1;
            positions.push(StoredEntity {
                object_id,
                channel,
                position,
            });
        }

        self.stats
            .record_store(chunk.record_count() as u64, chunk.len() as u64);
        debug!(timestamp, records = chunk.record_count(), bytes = chunk.len(), "store committed");
        Ok(StoreResult {
            timestamp,
            positions,
        })
    }

    /// Loads the current version of every object id, grouped by channel.
    ///
    /// # Errors
    ///
    /// Returns `Consistency` if an object id is not stored.
    pub fn load_by_oids(&self, oids: &[ObjectId]) -> CoreResult<ChunkBuffer> {
        self.ensure_open()?;
        let mut groups: Vec<Vec<ObjectId>> = vec![Vec::new(); self.channels.len()];
        for &oid in oids {
            groups[self.layout.channel_of(oid).as_usize()].push(oid);
        }
        let receivers = self
            .channels
            .iter()
            .zip(groups)
            .filter(|(_, group)| !group.is_empty())
            .map(|(handle, group)| {
                let receiver = handle.request(|reply| Command::Load {
                    request: LoadRequest::Oids(group),
                    reply,
                })?;
                Ok((handle, receiver))
            })
            .collect::<CoreResult<Vec<_>>>()?;
        let mut chunk = ChunkBuffer::new(self.manifest.byte_order);
        for (handle, receiver) in receivers {
            chunk.extend(&handle.wait(&receiver)?);
        }
        self.stats.record_load(chunk.record_count() as u64);
        Ok(chunk)
    }

    /// Loads every entity of the given types, grouped by channel.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or a stopped channel.
    pub fn load_by_types(&self, types: &[TypeId]) -> CoreResult<ChunkBuffer> {
        self.ensure_open()?;
        let parts = self.broadcast(|reply| Command::Load {
            request: LoadRequest::Types(types.to_vec()),
            reply,
        })?;
        let mut chunk = ChunkBuffer::new(self.manifest.byte_order);
        for part in &parts {
            chunk.extend(part);
        }
        self.stats.record_load(chunk.record_count() as u64);
        Ok(chunk)
    }

    /// Loads the graph root: the root-type entity the configured selector
    /// picks among every channel's candidate. Empty if there is none.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or a stopped channel.
    pub fn load_roots(&self) -> CoreResult<ChunkBuffer> {
        self.ensure_open()?;
        let candidates = collect_root_candidates(&self.channels)?;
        match self.config.root_selector.select_root(&candidates) {
            Some(root) => self.load_by_oids(&[root]),
            None => Ok(ChunkBuffer::new(self.manifest.byte_order)),
        }
    }

    /// Runs garbage collection on every channel until it completes or
    /// `budget` elapses. Returns `true` if collection completed.
    ///
    /// An [`interrupt`](Self::interrupt) ends the call early with the
    /// completion state reached so far.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, escalated zombie ids or a stopped channel.
    pub fn issue_garbage_collection(&self, budget: Duration) -> CoreResult<bool> {
        self.ensure_open()?;
        let deadline = Instant::now() + budget;
        let epoch = self.interrupts.epoch();
        let done = self.broadcast(|reply| Command::CollectGarbage {
            deadline,
            epoch,
            reply,
        })?;
        Ok(done.into_iter().all(|complete| complete))
    }

    /// Runs a file cleanup pass on every channel. Returns `true` if every
    /// pass finished within `budget`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or a stopped channel.
    pub fn issue_file_check(&self, budget: Duration) -> CoreResult<bool> {
        self.ensure_open()?;
        let deadline = Instant::now() + budget;
        let done = self.broadcast(|reply| Command::CheckFiles { deadline, reply })?;
        Ok(done.into_iter().all(|complete| complete))
    }

    /// Runs a cache live check with `evaluator` on every channel. Returns
    /// `true` if every channel completed a full round within `budget`.
    ///
    /// # Errors
    ///
    /// Fails on a stopped channel.
    pub fn issue_cache_check(
        &self,
        budget: Duration,
        evaluator: Arc<dyn EntityCacheEvaluator>,
    ) -> CoreResult<bool> {
        self.ensure_open()?;
        let deadline = Instant::now() + budget;
        let done = self.broadcast(|reply| Command::CheckCache {
            deadline,
            evaluator: Arc::clone(&evaluator),
            reply,
        })?;
        Ok(done.into_iter().all(|complete| complete))
    }

    /// Streams the manifest, then every channel's transactions log and
    /// data files, to `sink`. No store runs while the export does.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, sink errors or a stopped channel.
    pub fn export(&self, sink: &mut dyn ExportSink) -> CoreResult<()> {
        self.ensure_open()?;
        let _guard = self.store_lock.lock();
        sink.export_manifest(&self.manifest)?;
        let mut files = 0;
        for handle in &self.channels {
            let channel = handle.channel();
            let (pieces, receiver) = bounded(1);
            handle.send(Command::Export { pieces })?;
            loop {
                match receiver.recv() {
                    Ok(ExportPiece::TransactionsLog(bytes)) => {
                        sink.export_transactions_log(channel, &bytes)?;
                    }
                    Ok(ExportPiece::DataFile(number, bytes)) => {
                        sink.export_data_file(channel, number, &bytes)?;
                        files += 1;
                    }
                    Ok(ExportPiece::Finished(result)) => {
                        result?;
                        break;
                    }
                    Err(_) => return Err(CoreError::ChannelStopped { channel }),
                }
            }
        }
        info!(channels = self.channels.len(), files, "exported database");
        Ok(())
    }

    /// Stores every entity record found in the given data files as one
    /// store. Gaps are skipped; within a file later records win.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for a file that does not parse as a data
    /// file, and fails like [`store`](Self::store).
    pub fn import_files<P: AsRef<Path>>(&self, paths: &[P]) -> CoreResult<StoreResult> {
        self.ensure_open()?;
        let order = self.manifest.byte_order;
        let mut bytes = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let data = fs::read(path)?;
            for slot in scan_file(&data, order) {
                match slot {
                    Ok((_, FileSlot::Entity(record))) => bytes.extend_from_slice(record.as_bytes()),
                    Ok((_, FileSlot::Gap(_))) => {}
                    Err(error) => {
                        return Err(CoreError::invalid_format(format!(
                            "{} is not a data file: {error:?}",
                            path.display()
                        )))
                    }
                }
            }
        }
        let chunk = ChunkBuffer::from_bytes(bytes, order)?;
        let result = self.store(&chunk)?;
        info!(files = paths.len(), records = chunk.record_count(), "imported data files");
        Ok(result)
    }

    /// Size figures of every channel.
    ///
    /// # Errors
    ///
    /// Fails on a stopped channel.
    pub fn channel_statistics(&self) -> CoreResult<Vec<ChannelStatistics>> {
        self.ensure_open()?;
        self.broadcast(|reply| Command::Statistics { reply })
    }

    /// Data file figures of every channel.
    ///
    /// # Errors
    ///
    /// Fails on a stopped channel.
    pub fn file_statistics(&self) -> CoreResult<Vec<(ChannelIndex, Vec<FileStatistics>)>> {
        Ok(self
            .channel_statistics()?
            .into_iter()
            .map(|stats| (stats.channel, stats.files))
            .collect())
    }

    /// Operation counters since open.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// State of the garbage collector.
    #[must_use]
    pub fn gc_snapshot(&self) -> MonitorSnapshot {
        self.monitor.snapshot()
    }

    /// Aborts every issued operation currently running. Later calls are
    /// not affected.
    pub fn interrupt(&self) {
        self.interrupts.interrupt();
    }

    /// Stops every channel worker. Further calls fail with `Shutdown`.
    ///
    /// # Errors
    ///
    /// Closing does not fail today; the signature leaves room for a final
    /// sync.
    pub fn close(&self) -> CoreResult<()> {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return Ok(());
        }
        for handle in &self.channels {
            handle.shutdown();
        }
        *is_open = false;
        info!(channels = self.channels.len(), "closed database");
        Ok(())
    }

    /// Checks if the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    /// Returns the database configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the manifest in effect.
    #[must_use]
    pub fn manifest(&self) -> Manifest {
        self.manifest
    }

    /// Returns the database directory, if there is one.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(DatabaseDir::path)
    }

    /// Whether `channel` stopped after a fatal error.
    #[must_use]
    pub fn is_channel_stopped(&self, channel: ChannelIndex) -> bool {
        self.channels
            .get(channel.as_usize())
            .is_some_and(ChannelHandle::is_stopped)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{DirectoryExport, MemoryExport};
    use crate::policy::EvictAll;
    use crate::record::{ByteOrder, RecordBuilder};
    use crate::type_dictionary::{TypeDescriptor, TypeDictionary};
    use tempfile::tempdir;

    const ROOT: TypeId = TypeId(1);
    const NODE: TypeId = TypeId(2);
    const BLOB: TypeId = TypeId(7);

    fn config(channels: u32) -> Config {
        let types = TypeDictionary::new()
            .with(TypeDescriptor::fixed(ROOT, "Root", vec![0]))
            .with(TypeDescriptor::variable(NODE, "Node", 0))
            .with(TypeDescriptor::leaf(BLOB, "Blob"));
        Config::new()
            .channel_count(channels)
            .types(types)
            .root_type(ROOT)
            .sync_on_write(false)
            .housekeeping(Duration::from_secs(60), Duration::from_millis(1))
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

    fn blob(oid: u64, payload: &[u8]) -> Vec<u8> {
        RecordBuilder::new(BLOB, ObjectId(oid))
            .raw(payload)
            .build(ByteOrder::Little)
    }

    fn chunk(records: &[Vec<u8>]) -> ChunkBuffer {
        ChunkBuffer::from_bytes(records.concat(), ByteOrder::Little).unwrap()
    }

    fn oids(chunk: &ChunkBuffer) -> Vec<u64> {
        let mut oids: Vec<_> = chunk.records().map(|r| r.object_id().0).collect();
        oids.sort_unstable();
        oids
    }

    #[test]
    fn store_and_load_round_trip() {
        let db = Database::open_in_memory(config(1)).unwrap();
        let result = db.store(&chunk(&[blob(42, &[1, 2, 3])])).unwrap();
        assert_eq!(result.positions.len(), 1);
        assert_eq!(result.positions[0].object_id, ObjectId(42));

        let loaded = db.load_by_oids(&[ObjectId(42)]).unwrap();
        let record = loaded.records().next().unwrap();
        assert_eq!(record.type_id(), BLOB);
        assert_eq!(record.body(), &[1, 2, 3]);
        assert_eq!(db.stats().stores, 1);
    }

    #[test]
    fn store_routes_records_to_owning_channels() {
        let db = Database::open_in_memory(config(4)).unwrap();
        let records: Vec<_> = (1..=20).map(|oid| blob(oid, b"x")).collect();
        let result = db.store(&chunk(&records)).unwrap();
        for (entry, oid) in result.positions.iter().zip(1..=20u64) {
            assert_eq!(entry.object_id, ObjectId(oid));
            assert_eq!(entry.channel, ChannelIndex((oid % 4) as u32));
        }

        let stats = db.channel_statistics().unwrap();
        let counts: Vec<_> = stats.iter().map(|s| s.cache.entity_count).collect();
        assert_eq!(counts, vec![5, 5, 5, 5]);
        // Every channel logged the store, including its share's timestamp.
        assert!(stats
            .iter()
            .all(|s| s.latest_store_timestamp == result.timestamp));

        let loaded = db.load_by_types(&[BLOB]).unwrap();
        assert_eq!(oids(&loaded), (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn rejected_store_changes_nothing() {
        let db = Database::open_in_memory(config(2)).unwrap();
        db.store(&chunk(&[blob(2, b"a")])).unwrap();

        let bad = chunk(&[blob(3, b"b"), node(2, &[])]);
        assert!(matches!(db.store(&bad), Err(CoreError::Consistency { .. })));
        assert!(db.load_by_oids(&[ObjectId(3)]).is_err());
        assert!(!db.is_channel_stopped(ChannelIndex(0)));
        assert!(!db.is_channel_stopped(ChannelIndex(1)));
        assert_eq!(db.gc_snapshot().pending_store_updates, 0);

        let unknown = RecordBuilder::new(TypeId(99), ObjectId(5)).build(ByteOrder::Little);
        assert!(matches!(
            db.store(&chunk(&[unknown])),
            Err(CoreError::UnknownType { .. })
        ));
        assert!(db.store(&chunk(&[blob(3, b"b")])).is_ok());
    }

    #[test]
    fn gc_reclaims_orphan_across_channels() {
        let db = Database::open_in_memory(config(4)).unwrap();
        db.store(&chunk(&[root(4, 5), node(5, &[6, 7]), blob(6, b"b"), blob(7, b"c")]))
            .unwrap();
        assert!(db.issue_garbage_collection(Duration::from_secs(10)).unwrap());
        assert_eq!(oids(&db.load_by_types(&[NODE, BLOB]).unwrap()), vec![5, 6, 7]);

        db.store(&chunk(&[node(5, &[6])])).unwrap();
        assert!(db.issue_garbage_collection(Duration::from_secs(10)).unwrap());
        assert_eq!(oids(&db.load_by_types(&[NODE, BLOB]).unwrap()), vec![5, 6]);
        assert!(db.stats().entities_swept >= 1);

        let roots = db.load_roots().unwrap();
        assert_eq!(oids(&roots), vec![4]);
    }

    #[test]
    fn highest_root_is_the_graph_root() {
        let db = Database::open_in_memory(config(2)).unwrap();
        db.store(&chunk(&[root(3, 0), root(10, 0)])).unwrap();
        assert_eq!(oids(&db.load_roots().unwrap()), vec![10]);
    }

    #[test]
    fn reopen_recovers_from_shared_provider() {
        let provider = InMemoryFileProvider::new();
        let last = {
            let db = Database::open_with_provider(Arc::new(provider.clone()), config(2)).unwrap();
            db.store(&chunk(&[blob(1, b"one"), blob(2, b"two")])).unwrap();
            db.store(&chunk(&[blob(1, b"uno")])).unwrap().timestamp
        };
        let db = Database::open_with_provider(Arc::new(provider), config(2)).unwrap();
        let loaded = db.load_by_oids(&[ObjectId(1), ObjectId(2)]).unwrap();
        let bodies: Vec<_> = loaded.records().map(|r| r.body().to_vec()).collect();
        assert!(bodies.contains(&b"uno".to_vec()));
        assert!(bodies.contains(&b"two".to_vec()));

        // Timestamps keep increasing across the restart.
        let result = db.store(&chunk(&[blob(3, b"three")])).unwrap();
        assert!(result.timestamp > last);
    }

    #[test]
    fn directory_database_reopens_with_manifest_settings() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("graph");
        {
            let db = Database::open_with_config(&path, config(4)).unwrap();
            db.store(&chunk(&[blob(9, b"nine")])).unwrap();
            db.close().unwrap();
            assert!(matches!(db.store(&chunk(&[])), Err(CoreError::Shutdown)));
        }

        let db = Database::open_with_config(&path, config(1)).unwrap();
        assert_eq!(db.manifest().channel_count, 4);
        assert_eq!(db.channel_statistics().unwrap().len(), 4);
        assert_eq!(oids(&db.load_by_oids(&[ObjectId(9)]).unwrap()), vec![9]);

        assert!(matches!(
            Database::open_with_config(&path, config(4)),
            Err(CoreError::DatabaseLocked)
        ));
        drop(db);
        assert!(Database::open_with_config(&path, config(4).error_if_exists(true)).is_err());
        assert!(Database::open_with_config(
            &temp.path().join("missing"),
            config(1).create_if_missing(false)
        )
        .is_err());
    }

    #[test]
    fn export_produces_an_openable_copy() {
        let temp = tempdir().unwrap();
        let db = Database::open_in_memory(config(2)).unwrap();
        db.store(&chunk(&[root(2, 3), blob(3, b"payload")])).unwrap();

        let mut memory = MemoryExport::new();
        db.export(&mut memory).unwrap();
        assert_eq!(memory.manifest.map(|m| m.channel_count), Some(2));
        assert_eq!(memory.logs.len(), 2);
        assert!(!memory.data_files.is_empty());

        let target = temp.path().join("copy");
        let mut sink = DirectoryExport::create(&target).unwrap();
        db.export(&mut sink).unwrap();
        drop(sink);

        let copy = Database::open_with_config(&target, config(2)).unwrap();
        assert_eq!(oids(&copy.load_by_types(&[ROOT, BLOB]).unwrap()), vec![2, 3]);
    }

    #[test]
    fn import_stores_every_record_of_data_files() {
        let temp = tempdir().unwrap();
        let source = Database::open_in_memory(config(1)).unwrap();
        source.store(&chunk(&[blob(1, b"a"), blob(2, b"b")])).unwrap();
        source.store(&chunk(&[blob(1, b"c")])).unwrap();
        let mut export = MemoryExport::new();
        source.export(&mut export).unwrap();

        let mut paths = Vec::new();
        for ((_, number), bytes) in &export.data_files {
            let path = temp.path().join(format!("import_{number}.dat"));
            fs::write(&path, bytes).unwrap();
            paths.push(path);
        }

        let db = Database::open_in_memory(config(2)).unwrap();
        db.import_files(&paths).unwrap();
        let loaded = db.load_by_oids(&[ObjectId(1)]).unwrap();
        assert_eq!(loaded.records().next().unwrap().body(), b"c");
        assert_eq!(oids(&db.load_by_types(&[BLOB]).unwrap()), vec![1, 2]);

        let garbage = temp.path().join("garbage.dat");
        fs::write(&garbage, [0u8; 8]).unwrap();
        assert!(matches!(
            db.import_files(&[garbage]),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn cache_check_and_statistics() {
        let db = Database::open_in_memory(config(2)).unwrap();
        db.store(&chunk(&[blob(1, &[0; 100]), blob(2, &[0; 100])])).unwrap();
        db.load_by_oids(&[ObjectId(1), ObjectId(2)]).unwrap();
        let cached: u64 = db
            .channel_statistics()
            .unwrap()
            .iter()
            .map(|s| s.cache.cached_bytes)
            .sum();
        assert_eq!(cached, 248);

        assert!(db
            .issue_cache_check(Duration::from_secs(5), Arc::new(EvictAll))
            .unwrap());
        let cached: u64 = db
            .channel_statistics()
            .unwrap()
            .iter()
            .map(|s| s.cache.cached_bytes)
            .sum();
        assert_eq!(cached, 0);
        assert!(db.issue_file_check(Duration::from_secs(5)).unwrap());
        assert_eq!(db.file_statistics().unwrap().len(), 2);
    }

    #[test]
    fn interrupt_only_affects_running_calls() {
        let db = Database::open_in_memory(config(1)).unwrap();
        db.store(&chunk(&[root(1, 0)])).unwrap();
        db.interrupt();
        assert!(db.issue_garbage_collection(Duration::from_secs(10)).unwrap());
    }
}
