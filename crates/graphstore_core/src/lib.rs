//! # graphstore core
//!
//! Embedded object-graph storage engine with incremental garbage
//! collection.
//!
//! Entities are opaque byte records carrying a type id and an object id.
//! A type descriptor tells the engine where a record's references to other
//! entities are; everything else about the payload is the caller's
//! business.
//!
//! This crate provides:
//! - Channel sharding: object ids map onto a power-of-two number of
//!   channels, each with its own worker thread, entity cache and files
//! - Append-only data files plus a transactions log per channel, with
//!   crash recovery to the last store every channel logged
//! - Atomic stores across channels
//! - Incremental tri-color garbage collection coordinated by a global
//!   mark monitor
//! - Background housekeeping: file cleanup, collection and cache eviction
//!   within a rolling time budget
//! - Export to a directory or any [`ExportSink`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use graphstore_core::{ByteOrder, ChunkBuffer, Config, Database, ObjectId,
//!     RecordBuilder, TypeDescriptor, TypeDictionary, TypeId};
//!
//! let types = TypeDictionary::new()
//!     .with(TypeDescriptor::fixed(TypeId(1), "Root", vec![0]))
//!     .with(TypeDescriptor::leaf(TypeId(2), "Blob"));
//! let db = Database::open_in_memory(Config::new().types(types).root_type(TypeId(1)))?;
//!
//! let mut bytes = RecordBuilder::new(TypeId(1), ObjectId(1))
//!     .reference(ObjectId(2))
//!     .build(ByteOrder::Little);
//! bytes.extend(RecordBuilder::new(TypeId(2), ObjectId(2)).raw(b"hi").build(ByteOrder::Little));
//! db.store(&ChunkBuffer::from_bytes(bytes, ByteOrder::Little)?)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

mod cache;
mod channel;
mod config;
mod database;
mod dir;
mod error;
mod export;
mod file;
mod gc;
mod manifest;
mod policy;
mod record;
mod stats;
mod txlog;
mod type_dictionary;
mod types;

pub use cache::{
    CacheContext, CacheStatistics, Entity, EntityCache, EntitySlot, GcColor, StoragePosition,
};
pub use channel::ChannelStatistics;
pub use config::{Config, MAX_CHANNEL_COUNT};
pub use database::{Database, StoreResult, StoredEntity};
pub use dir::{read_manifest, DatabaseDir};
pub use error::{CoreError, CoreResult};
pub use export::{DirectoryExport, ExportSink, MemoryExport};
pub use file::{
    consistent_timestamp, verify_channel, ChannelInventory, ChannelReport, DirectoryFileProvider,
    FileContext, FileManager, FileProvider, FileReport, FileStatistics, InMemoryFileProvider,
    RecoverySummary,
};
pub use gc::{MarkMonitor, MonitorSnapshot, OidMarkQueue, ReferenceMarker};
pub use manifest::Manifest;
pub use policy::{
    CacheCandidate, DataFileEvaluator, DefaultCacheEvaluator, DefaultFileEvaluator,
    EntityCacheEvaluator, EvictAll, FailOnZombies, FileUsage, HighestRootOid, IgnoreZombies,
    RootOidSelector, ZombieOidHandler,
};
pub use record::{
    encode_gap, scan_file, ByteOrder, ChunkBuffer, ChunkRecords, EntityRecord, FileScanner,
    FileSlot, RecordBuilder, ScanError, MINIMUM_GAP_LENGTH, RECORD_HEADER_LENGTH,
};
pub use stats::{StatsSnapshot, StorageStats};
pub use txlog::{
    encode_log, parse_log, EntryError, EntryKind, LogContents, LoggedFile, StoreMark,
    TransactionEntry, TransactionLog, TransactionsAnalysis,
};
pub use type_dictionary::{ReferenceLayout, TypeDescriptor, TypeDictionary};
pub use types::{ChannelIndex, ChannelLayout, Interrupts, ObjectId, TimestampProvider, TypeId};
