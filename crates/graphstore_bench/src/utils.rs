//! Benchmark utilities.

use graphstore_core::{Database, ObjectId};
use graphstore_testkit::{chunk, leaf_record, node_record, root_record, test_config};
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;

/// Object id of the root of every generated graph.
pub const ROOT_OID: u64 = 1;
/// Object id of the hub node below the root.
pub const HUB_OID: u64 = 2;
/// First object id handed to generated leaves.
pub const FIRST_LEAF_OID: u64 = 1_000;

/// Generate random payload bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Object ids for `count` leaves.
pub fn leaf_oids(count: usize) -> Vec<u64> {
    (0..count as u64).map(|index| FIRST_LEAF_OID + index).collect()
}

/// Leaf records with random payloads of `payload_size` bytes.
pub fn generate_leaves(count: usize, payload_size: usize) -> Vec<Vec<u8>> {
    leaf_oids(count)
        .into_iter()
        .map(|oid| leaf_record(oid, &random_data(payload_size)))
        .collect()
}

/// Opens an in-memory database with the fixture types.
pub fn open_database(channels: u32) -> Database {
    let config = test_config(channels)
        .housekeeping(Duration::from_secs(3600), Duration::from_micros(100));
    Database::open_in_memory(config).expect("Failed to open benchmark database")
}

/// Stores root, hub and `count` leaves hanging off the hub. Returns the
/// leaf ids.
pub fn populate(db: &Database, count: usize, payload_size: usize) -> Vec<u64> {
    let leaves = leaf_oids(count);
    let mut records = vec![root_record(ROOT_OID, HUB_OID), node_record(HUB_OID, &leaves)];
    records.extend(generate_leaves(count, payload_size));
    db.store(&chunk(&records)).expect("Failed to populate");
    leaves
}

/// Re-stores the hub with a random `keep` of `leaves`, leaving the rest
/// as garbage.
pub fn drop_leaves(db: &Database, leaves: &[u64], keep: usize) {
    let mut kept = leaves.to_vec();
    kept.shuffle(&mut rand::thread_rng());
    kept.truncate(keep);
    db.store(&chunk(&[node_record(HUB_OID, &kept)]))
        .expect("Failed to re-store hub");
}

/// Random sample of `count` object ids out of `oids`.
pub fn sample_oids(oids: &[u64], count: usize) -> Vec<ObjectId> {
    oids.choose_multiple(&mut rand::thread_rng(), count)
        .copied()
        .map(ObjectId)
        .collect()
}
