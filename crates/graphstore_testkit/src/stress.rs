//! Stress tests for graphstore.
//!
//! Several threads store into one database while another keeps issuing
//! short garbage collections. Each writer owns a node hanging off a shared
//! hub below the root, attaches fresh leaves to it and periodically drops
//! the older ones, so collection always has both live and dead entities
//! to sort out.

use crate::fixtures::{chunk, leaf_record, node_record, root_record};
use graphstore_core::Database;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Object id of the hub node below the root.
pub const HUB_OID: u64 = 2;
/// Object id of the root.
pub const STRESS_ROOT_OID: u64 = 1;

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressResult {
    /// Successful stores.
    pub stores: usize,
    /// Failed stores.
    pub failed_stores: usize,
    /// Issued collections that ran.
    pub collections: usize,
    /// Total duration.
    pub duration: Duration,
    /// Object ids that must survive collection.
    pub live: BTreeSet<u64>,
    /// Object ids that were dropped from the graph.
    pub dropped: BTreeSet<u64>,
}

impl StressResult {
    /// Stores per second.
    pub fn stores_per_second(&self) -> f64 {
        if self.duration.as_secs_f64() > 0.0 {
            self.stores as f64 / self.duration.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Stores: {} ({} failed)", self.stores, self.failed_stores);
        println!("Collections: {}", self.collections);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} stores/sec", self.stores_per_second());
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of writer threads.
    pub threads: usize,
    /// Stores per writer.
    pub stores_per_thread: usize,
    /// Leaf payload size in bytes.
    pub payload_size: usize,
    /// Every this many stores a writer drops all but its newest leaf.
    pub drop_every: usize,
    /// Budget of each concurrent collection.
    pub collection_budget: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            stores_per_thread: 200,
            payload_size: 64,
            drop_every: 10,
            collection_budget: Duration::from_millis(5),
        }
    }
}

fn writer_node_oid(thread: usize) -> u64 {
    1_000 + thread as u64
}

fn leaf_oid(thread: usize, sequence: usize) -> u64 {
    1_000_000 * (thread as u64 + 1) + sequence as u64
}

/// Stores concurrently from `config.threads` writers while collecting
/// garbage, and reports which object ids must still exist.
///
/// The database must use the fixture types with `ROOT_TYPE` as root.
pub fn stress_stores_with_collection(db: &Database, config: &StressConfig) -> StressResult {
    let writers: Vec<u64> = (0..config.threads).map(writer_node_oid).collect();
    let mut setup = vec![
        root_record(STRESS_ROOT_OID, HUB_OID),
        node_record(HUB_OID, &writers),
    ];
    setup.extend(writers.iter().map(|&oid| node_record(oid, &[])));
    db.store(&chunk(&setup)).expect("Failed to store the stress graph");

    let stores = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let collections = AtomicUsize::new(0);
    let writing = AtomicBool::new(true);
    let payload = vec![0xAB; config.payload_size];
    let start = Instant::now();

    let outcomes: Vec<(BTreeSet<u64>, BTreeSet<u64>)> = thread::scope(|scope| {
        let collector = scope.spawn(|| {
            while writing.load(Ordering::Acquire) {
                if db.issue_garbage_collection(config.collection_budget).is_ok() {
                    collections.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        let handles: Vec<_> = (0..config.threads)
            .map(|thread| {
                let (stores, failed, payload) = (&stores, &failed, &payload);
                scope.spawn(move || {
                    let node = writer_node_oid(thread);
                    let mut attached: Vec<u64> = Vec::new();
                    let mut dropped = BTreeSet::new();
                    for sequence in 0..config.stores_per_thread {
                        let leaf = leaf_oid(thread, sequence);
                        let mut next = attached.clone();
                        if config.drop_every > 0 && sequence % config.drop_every == 0 {
                            dropped.extend(next.drain(..));
                        }
                        next.push(leaf);
                        let records = [leaf_record(leaf, payload), node_record(node, &next)];
                        match db.store(&chunk(&records)) {
                            Ok(_) => {
                                stores.fetch_add(1, Ordering::Relaxed);
                                attached = next;
                            }
                            Err(_) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    (attached.into_iter().collect(), dropped)
                })
            })
            .collect();

        let outcomes = handles
            .into_iter()
            .map(|handle| handle.join().expect("writer panicked"))
            .collect();
        writing.store(false, Ordering::Release);
        collector.join().expect("collector panicked");
        outcomes
    });

    let mut live: BTreeSet<u64> = [STRESS_ROOT_OID, HUB_OID].into_iter().collect();
    live.extend(writers);
    let mut dropped = BTreeSet::new();
    for (attached, gone) in outcomes {
        live.extend(attached);
        dropped.extend(gone);
    }

    StressResult {
        stores: stores.load(Ordering::Relaxed),
        failed_stores: failed.load(Ordering::Relaxed),
        collections: collections.load(Ordering::Relaxed),
        duration: start.elapsed(),
        live,
        dropped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestStore;

    #[test]
    fn concurrent_stores_survive_collection() {
        let store = TestStore::new(4);
        let config = StressConfig {
            threads: 3,
            stores_per_thread: 40,
            ..StressConfig::default()
        };
        let result = stress_stores_with_collection(&store, &config);
        assert_eq!(result.failed_stores, 0);
        assert_eq!(result.stores, 120);

        store.collect();
        let remaining = store.all_oids();
        assert_eq!(remaining, result.live);
        assert!(remaining.is_disjoint(&result.dropped));
    }
}
