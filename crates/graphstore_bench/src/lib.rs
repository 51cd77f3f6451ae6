//! Benchmark helpers for graphstore.

pub mod utils;
