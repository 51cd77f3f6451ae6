//! Durable storage of entity bytes.
//!
//! Each channel owns a chain of append-only data files and one
//! transactions log describing every mutation of that chain:
//!
//! ```text
//! <db_path>/channel_<n>/
//! ├─ channel_<n>_1.dat
//! ├─ channel_<n>_2.dat     # newest file is the head: the write target
//! └─ transactions_<n>.sft
//! ```
//!
//! ## Write Protocol
//!
//! 1. Data bytes are appended (and synced) before the log entry that
//!    makes them part of the committed state.
//! 2. Deletions and truncations are logged before they happen.
//!
//! A crash therefore never leaves the log describing bytes that are not
//! on disk. What it can leave, unlogged tail bytes and logged deletions
//! that did not happen, is repaired by [`ChannelInventory::recover`].

mod data_file;
mod manager;
mod provider;
mod recovery;

pub use manager::{FileContext, FileManager, FileStatistics};
pub use provider::{DirectoryFileProvider, FileProvider, InMemoryFileProvider};
pub use recovery::{
    consistent_timestamp, verify_channel, ChannelInventory, ChannelReport, FileReport,
    RecoverySummary,
};
