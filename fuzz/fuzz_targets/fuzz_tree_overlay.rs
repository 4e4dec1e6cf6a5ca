//! Fuzz target for tree overlay construction.
//!
//! Arbitrary member names and branching factors must give a symmetric
//! spanning tree, or a clean error for m = 0.

#![no_main]

use broadcast_engine::{NodeId, TreeOverlay};
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeSet;

fuzz_target!(|data: (u8, Vec<String>)| {
    let (m, names) = data;
    let m = m as usize % 9;

    // Duplicate names are not a valid member list.
    let unique: BTreeSet<String> = names.into_iter().take(256).collect();
    let members: Vec<NodeId> = unique.into_iter().map(NodeId::new).collect();

    let overlay = match TreeOverlay::build(&members, m) {
        Ok(overlay) => overlay,
        Err(_) => {
            assert_eq!(m, 0);
            return;
        }
    };
    assert_eq!(overlay.len(), members.len());

    let adjacency = overlay.adjacency();
    let mut degree_sum = 0;
    for (id, neighbors) in &adjacency {
        assert!(neighbors.len() <= m + 1);
        for other in neighbors {
            assert!(adjacency[other].contains(id));
        }
        degree_sum += neighbors.len();
    }
    assert_eq!(degree_sum, 2 * members.len().saturating_sub(1));
});
