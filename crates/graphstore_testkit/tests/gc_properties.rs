//! Property tests for garbage collection over random graphs.

use graphstore_core::ObjectId;
use graphstore_testkit::prelude::*;
use proptest::prelude::*;
use std::time::Duration;

fn channel_count() -> impl Strategy<Value = u32> {
    prop_oneof![Just(1u32), Just(2), Just(4)]
}

/// Stores `graph`, then applies `rewires` one store at a time.
///
/// A rewire only ever points at nodes that are reachable at that moment,
/// since anything else may already have been collected. Leaves keep their
/// type and are never rewired.
fn build(store: &TestStore, graph: &mut GraphSpec, rewires: &[Rewire]) {
    store.put(&graph.records());
    for rewire in rewires {
        if graph.leaves.contains(&rewire.node) {
            continue;
        }
        let reachable = graph.reachable();
        graph.edges[rewire.node] = rewire
            .children
            .iter()
            .copied()
            .filter(|&child| reachable.contains(&GraphSpec::oid(child)))
            .collect();
        store.put(&[graph.node(rewire.node)]);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn collection_keeps_exactly_the_reachable_graph(
        (mut graph, rewires) in graph_with_rewires(24, 8),
        channels in channel_count(),
    ) {
        let store = TestStore::new(channels);
        build(&store, &mut graph, &rewires);
        store.collect();
        prop_assert_eq!(store.all_oids(), graph.reachable());
    }

    #[test]
    fn second_collection_sweeps_nothing(
        graph in graph_strategy(24),
        channels in channel_count(),
    ) {
        let store = TestStore::new(channels);
        store.put(&graph.records());
        store.collect();
        let swept = store.stats().entities_swept;
        let survivors = store.all_oids();

        store.collect();
        prop_assert_eq!(store.stats().entities_swept, swept);
        prop_assert_eq!(store.all_oids(), survivors);
    }

    #[test]
    fn collected_entities_stay_unloadable_after_restart(
        graph in graph_strategy(16),
        channels in channel_count(),
    ) {
        let store = TestStore::new(channels);
        store.put(&graph.records());
        store.collect();

        let store = store.restart();
        store.collect();
        prop_assert_eq!(store.all_oids(), graph.reachable());
        for oid in graph.all_oids().difference(&graph.reachable()) {
            prop_assert!(store.load_by_oids(&[ObjectId(*oid)]).is_err());
        }
    }
}

#[test]
fn pending_marks_match_queued_ids_throughout_collection() {
    let store = TestStore::new(4);
    let config = StressConfig {
        threads: 2,
        stores_per_thread: 30,
        drop_every: 5,
        collection_budget: Duration::from_millis(2),
        ..StressConfig::default()
    };

    let samples = std::thread::scope(|scope| {
        let writer = scope.spawn(|| stress_stores_with_collection(&store, &config));
        let mut samples = 0;
        while !writer.is_finished() {
            let snapshot = store.gc_snapshot();
            assert_eq!(
                snapshot.pending_marks,
                snapshot.queue_lengths.iter().sum::<usize>() as u64
            );
            samples += 1;
            std::thread::yield_now();
        }
        writer.join().expect("stress run panicked");
        samples
    });
    assert!(samples > 0);

    store.collect();
    let snapshot = store.gc_snapshot();
    assert_eq!(snapshot.pending_store_updates, 0);
    assert_eq!(snapshot.sweeping_channels, 0);
    assert!(snapshot.cold_complete);
    assert_eq!(
        snapshot.pending_marks,
        snapshot.queue_lengths.iter().sum::<usize>() as u64
    );
}
