//! Data file cleanup: retiring head files, dissolving sparse files and
//! keeping every live entity intact while doing so.

use graphstore_core::{Config, ObjectId};
use graphstore_testkit::prelude::*;
use std::collections::BTreeMap;
use std::time::Duration;

const LEAVES: u64 = 40;

fn compacting_config() -> Config {
    test_config(1).file_sizes(0, 1024).minimum_use_ratio(0.75)
}

fn leaf_oid(index: u64) -> u64 {
    100 + index
}

/// Stores root, hub and every leaf, one leaf per store. The hub is
/// re-stored with each new leaf so every stored leaf is reachable.
fn populate(store: &TestStore) {
    store.put(&[root_record(1, 2), node_record(2, &[])]);
    let mut attached = Vec::new();
    for index in 0..LEAVES {
        attached.push(leaf_oid(index));
        store.put(&[leaf_record(leaf_oid(index), &[1; 48]), node_record(2, &attached)]);
    }
}

fn update_leaves(store: &TestStore, indices: impl Iterator<Item = u64>) {
    for index in indices {
        store.put(&[leaf_record(leaf_oid(index), &[2; 48])]);
    }
}

fn payloads(store: &TestStore) -> BTreeMap<u64, Vec<u8>> {
    let ids: Vec<ObjectId> = (0..LEAVES).map(|index| ObjectId(leaf_oid(index))).collect();
    let loaded = store.load_by_oids(&ids).unwrap();
    loaded
        .records()
        .map(|record| (record.object_id().0, record.body().to_vec()))
        .collect()
}

#[test]
fn cleanup_moves_live_entities_out_of_sparse_files() {
    let store = TestStore::with_config(compacting_config());
    populate(&store);
    update_leaves(&store, (0..LEAVES).filter(|index| index % 4 != 0));

    let files_before = store.file_statistics().unwrap()[0].1.len();
    assert!(files_before > 2, "stores should have retired several head files");
    let expected = payloads(&store);

    assert!(store.issue_file_check(Duration::from_secs(30)).unwrap());

    assert_eq!(payloads(&store), expected);
    let live_bytes = store
        .load_by_types(&[ROOT_TYPE, NODE_TYPE, LEAF_TYPE])
        .unwrap()
        .len() as u64;

    let (_, files) = &store.file_statistics().unwrap()[0];
    let data: u64 = files.iter().map(|file| file.data_length).sum();
    assert_eq!(data, live_bytes);
    for file in files.iter().filter(|file| !file.is_head) {
        assert!(file.entity_count > 0);
        assert!(file.data_length * 4 >= file.total_length * 3);
    }

    let stats = store.stats();
    assert!(stats.files_deleted > 0);
    assert!(stats.transfers > 0);
}

#[test]
fn cleaned_up_files_recover_after_restart() {
    let store = TestStore::with_config(compacting_config());
    populate(&store);
    update_leaves(&store, (0..LEAVES).filter(|index| index % 2 == 0));
    assert!(store.issue_file_check(Duration::from_secs(30)).unwrap());
    let expected = payloads(&store);
    let oids = store.all_oids();

    let store = store.restart();
    assert_eq!(store.all_oids(), oids);
    assert_eq!(payloads(&store), expected);
}
