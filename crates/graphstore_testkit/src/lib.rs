//! # graphstore testkit
//!
//! Test utilities for graphstore.
//!
//! This crate provides:
//! - Fixture types, record builders and an in-memory [`TestStore`] that
//!   can be restarted over its own files
//! - A crash-simulating file provider
//! - Property-based graph generators using proptest
//! - Concurrent store/collect stress runs
//!
//! The cross-module integration tests live in this crate's `tests/`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use graphstore_testkit::prelude::*;
//!
//! #[test]
//! fn orphan_is_collected() {
//!     let store = TestStore::new(2);
//!     store.put(&[root_record(1, 2), leaf_record(2, b"x"), leaf_record(3, b"y")]);
//!     store.collect();
//!     assert_eq!(store.all_oids(), [1, 2].into());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
