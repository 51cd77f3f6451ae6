//! # graphstore storage
//!
//! Byte stores underneath graphstore's data files and transaction logs.
//!
//! A backend is an append-only byte sequence that can be read at any
//! committed offset and cut back with [`StorageBackend::truncate`]. It
//! knows nothing about entity records or log entries; `graphstore_core`
//! owns every format.
//!
//! ## Design Principles
//!
//! - Appends return the offset they landed at
//! - Truncation is the only way bytes disappear
//! - `sync` is the durability point; `flush` only hands data to the OS
//! - Backends are `Send + Sync` so a channel thread can own them
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - a file on disk
//! - [`InMemoryBackend`] - a shareable buffer, used by tests to reopen the
//!   "same file" after a simulated crash
//!
//! ## Example
//!
//! ```rust
//! use graphstore_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"entity bytes").unwrap();
//! backend.truncate(offset + 6).unwrap();
//! assert_eq!(backend.read_all().unwrap(), b"entity");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::{InMemoryBackend, SharedBuffer};
