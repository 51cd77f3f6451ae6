//! Property-based test generators using proptest.
//!
//! Graphs are generated as index-based adjacency lists and turned into
//! records of the fixture types: node `i` gets object id `i + 2`, the root
//! record has object id 1 and references node 0.

use crate::fixtures::{leaf_record, node_record, root_record};
use proptest::prelude::*;
use std::collections::BTreeSet;

/// Object id of the generated root.
pub const GRAPH_ROOT_OID: u64 = 1;

/// A random object graph.
#[derive(Debug, Clone)]
pub struct GraphSpec {
    /// Children of every node, by node index. Leaves have none.
    pub edges: Vec<Vec<usize>>,
    /// Nodes that are stored as leaf records.
    pub leaves: BTreeSet<usize>,
}

impl GraphSpec {
    /// Object id of node `index`.
    pub fn oid(index: usize) -> u64 {
        index as u64 + 2
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Records for the root and every node.
    pub fn records(&self) -> Vec<Vec<u8>> {
        let mut records = vec![root_record(GRAPH_ROOT_OID, Self::oid(0))];
        records.extend((0..self.len()).map(|index| self.node(index)));
        records
    }

    /// The record for node `index`.
    pub fn node(&self, index: usize) -> Vec<u8> {
        let oid = Self::oid(index);
        if self.leaves.contains(&index) {
            leaf_record(oid, &oid.to_le_bytes())
        } else {
            let children: Vec<_> = self.edges[index].iter().map(|&child| Self::oid(child)).collect();
            node_record(oid, &children)
        }
    }

    /// Object ids reachable from the root, the root included.
    pub fn reachable(&self) -> BTreeSet<u64> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![0];
        while let Some(index) = stack.pop() {
            if index >= self.len() || !seen.insert(index) || self.leaves.contains(&index) {
                continue;
            }
            stack.extend(self.edges[index].iter().copied());
        }
        let mut oids: BTreeSet<u64> = seen.into_iter().map(Self::oid).collect();
        oids.insert(GRAPH_ROOT_OID);
        oids
    }

    /// All object ids, reachable or not.
    pub fn all_oids(&self) -> BTreeSet<u64> {
        let mut oids: BTreeSet<u64> = (0..self.len()).map(Self::oid).collect();
        oids.insert(GRAPH_ROOT_OID);
        oids
    }
}

/// Strategy for graphs of 1 to `max_nodes` nodes with up to 3 children
/// each. Cycles and self references are allowed.
pub fn graph_strategy(max_nodes: usize) -> impl Strategy<Value = GraphSpec> {
    (1..=max_nodes.max(1)).prop_flat_map(|nodes| {
        (
            prop::collection::vec(prop::collection::vec(0..nodes, 0..=3), nodes),
            prop::collection::btree_set(1..nodes.max(2), 0..=nodes / 3),
        )
            .prop_map(move |(edges, leaves)| GraphSpec {
                edges,
                leaves: leaves.into_iter().filter(|&index| index < nodes).collect(),
            })
    })
}

/// A rewiring of one node's children.
#[derive(Debug, Clone)]
pub struct Rewire {
    /// The node to update.
    pub node: usize,
    /// Its new children.
    pub children: Vec<usize>,
}

/// Strategy for a graph plus a sequence of rewirings to apply to it.
pub fn graph_with_rewires(
    max_nodes: usize,
    max_rewires: usize,
) -> impl Strategy<Value = (GraphSpec, Vec<Rewire>)> {
    graph_strategy(max_nodes).prop_flat_map(move |graph| {
        let nodes = graph.len();
        let rewire = (0..nodes, prop::collection::vec(0..nodes, 0..=3))
            .prop_map(|(node, children)| Rewire { node, children });
        (Just(graph), prop::collection::vec(rewire, 0..=max_rewires))
    })
}

/// Strategy for leaf payloads.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}
