//! Test fixtures and database helpers.
//!
//! Provides a small type dictionary, record builders for it, and
//! [`TestStore`], a database over a shared in-memory provider that can be
//! "restarted".

use graphstore_core::{
    ByteOrder, ChunkBuffer, Config, Database, FileProvider, InMemoryFileProvider, ObjectId,
    RecordBuilder, TypeDescriptor, TypeDictionary, TypeId,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Root type: one fixed reference at body offset 0.
pub const ROOT_TYPE: TypeId = TypeId(1);
/// Node type: a variable reference list at body offset 0.
pub const NODE_TYPE: TypeId = TypeId(2);
/// Leaf type: no references.
pub const LEAF_TYPE: TypeId = TypeId(3);

/// The byte order fixtures encode with.
pub const ORDER: ByteOrder = ByteOrder::Little;

/// Descriptors for [`ROOT_TYPE`], [`NODE_TYPE`] and [`LEAF_TYPE`].
pub fn test_types() -> TypeDictionary {
    TypeDictionary::new()
        .with(TypeDescriptor::fixed(ROOT_TYPE, "Root", vec![0]))
        .with(TypeDescriptor::variable(NODE_TYPE, "Node", 0))
        .with(TypeDescriptor::leaf(LEAF_TYPE, "Leaf"))
}

/// A configuration suited to tests: the test types with [`ROOT_TYPE`] as
/// root, no fsync, and housekeeping that stays out of the way.
pub fn test_config(channels: u32) -> Config {
    Config::new()
        .channel_count(channels)
        .types(test_types())
        .root_type(ROOT_TYPE)
        .sync_on_write(false)
        .cleanup_head_file(false)
        .housekeeping(Duration::from_secs(3600), Duration::from_millis(1))
}

/// A root record referencing `child` (0 for none).
pub fn root_record(oid: u64, child: u64) -> Vec<u8> {
    RecordBuilder::new(ROOT_TYPE, ObjectId(oid))
        .reference(ObjectId(child))
        .build(ORDER)
}

/// A node record referencing `children`.
pub fn node_record(oid: u64, children: &[u64]) -> Vec<u8> {
    let children: Vec<_> = children.iter().copied().map(ObjectId).collect();
    RecordBuilder::new(NODE_TYPE, ObjectId(oid))
        .references(&children)
        .build(ORDER)
}

/// A leaf record carrying `payload`.
pub fn leaf_record(oid: u64, payload: &[u8]) -> Vec<u8> {
    RecordBuilder::new(LEAF_TYPE, ObjectId(oid))
        .raw(payload)
        .build(ORDER)
}

/// A record of any type with a raw body.
pub fn record(type_id: TypeId, oid: u64, body: &[u8]) -> Vec<u8> {
    RecordBuilder::new(type_id, ObjectId(oid)).raw(body).build(ORDER)
}

/// Concatenates encoded records into a chunk.
pub fn chunk(records: &[Vec<u8>]) -> ChunkBuffer {
    ChunkBuffer::from_bytes(records.concat(), ORDER).expect("fixture records are well formed")
}

/// Sorted object ids of the records in `chunk`.
pub fn oids(chunk: &ChunkBuffer) -> BTreeSet<u64> {
    chunk.records().map(|record| record.object_id().0).collect()
}

/// A database over an in-memory provider that survives restarts.
pub struct TestStore {
    /// The database instance.
    pub db: Database,
    provider: InMemoryFileProvider,
    config: Config,
}

impl TestStore {
    /// Opens a fresh store with [`test_config`].
    pub fn new(channels: u32) -> Self {
        Self::with_config(test_config(channels))
    }

    /// Opens a fresh store with `config`.
    pub fn with_config(config: Config) -> Self {
        Self::over(InMemoryFileProvider::new(), config)
    }

    /// Opens a store over existing files.
    pub fn over(provider: InMemoryFileProvider, config: Config) -> Self {
        let shared: Arc<dyn FileProvider> = Arc::new(provider.clone());
        let db = Database::open_with_provider(shared, config.clone())
            .expect("Failed to open test store");
        Self {
            db,
            provider,
            config,
        }
    }

    /// The files behind the store.
    pub fn provider(&self) -> &InMemoryFileProvider {
        &self.provider
    }

    /// Closes the database and opens a new one over the same files.
    pub fn restart(self) -> Self {
        let Self {
            db,
            provider,
            config,
        } = self;
        db.close().expect("Failed to close test store");
        drop(db);
        Self::over(provider, config)
    }

    /// Stores `records` as one chunk.
    pub fn put(&self, records: &[Vec<u8>]) {
        self.db.store(&chunk(records)).expect("Failed to store");
    }

    /// Object ids of every stored entity.
    pub fn all_oids(&self) -> BTreeSet<u64> {
        let loaded = self
            .db
            .load_by_types(&[ROOT_TYPE, NODE_TYPE, LEAF_TYPE])
            .expect("Failed to load");
        oids(&loaded)
    }

    /// Runs garbage collection to completion.
    pub fn collect(&self) {
        let complete = self
            .db
            .issue_garbage_collection(Duration::from_secs(30))
            .expect("Garbage collection failed");
        assert!(complete, "garbage collection did not complete in time");
    }
}

impl std::ops::Deref for TestStore {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}
