//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use broadcast_engine::protocol::parse_line;
use broadcast_engine::{BatchAggregator, CheckpointTracker, NodeId, TreeOverlay, Value, ValueDedupStore};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

fn members(n: usize) -> Vec<NodeId> {
    (0..n).map(|i| NodeId::new(format!("n{}", i))).collect()
}

/// Nodes in a complete m-ary tree of the given height.
fn capacity(m: usize, height: usize) -> u128 {
    (0..=height).fold(0u128, |acc, d| {
        acc.saturating_add((m as u128).saturating_pow(d as u32))
    })
}

// =============================================================================
// Store Properties
// =============================================================================

proptest! {
    /// Inserting any sequence twice leaves the same set as inserting it once.
    #[test]
    fn store_insert_is_idempotent(values in prop::collection::vec(-50i64..50, 0..100)) {
        let store = ValueDedupStore::new();
        let first = store.insert_all(values.iter().copied().map(Value));
        let size = store.size();
        let second = store.insert_all(values.iter().copied().map(Value));

        prop_assert!(second.is_empty());
        prop_assert_eq!(store.size(), size);
        prop_assert_eq!(first.len(), values.iter().collect::<HashSet<_>>().len());
    }

    /// The snapshot never holds a value twice, and holds everything inserted.
    #[test]
    fn store_snapshot_is_a_set(values in prop::collection::vec(any::<i64>(), 0..100)) {
        let store = ValueDedupStore::new();
        for v in &values {
            store.try_insert(Value(*v));
        }
        let snapshot = store.snapshot();
        let unique: HashSet<i64> = snapshot.iter().map(|v| v.0).collect();

        prop_assert_eq!(unique.len(), snapshot.len());
        prop_assert_eq!(unique, values.iter().copied().collect::<HashSet<_>>());
    }

    /// `since(k)` is exactly the suffix of the snapshot after `k`.
    #[test]
    fn store_since_is_a_suffix(
        values in prop::collection::vec(0i64..1000, 0..60),
        offset in 0usize..80,
    ) {
        let store = ValueDedupStore::new();
        store.insert_all(values.into_iter().map(Value));
        let snapshot = store.snapshot();
        let (delta, end) = store.since(offset);

        prop_assert_eq!(end, snapshot.len());
        let expected: Vec<Value> = snapshot.into_iter().skip(offset).collect();
        prop_assert_eq!(delta, expected);
    }
}

// =============================================================================
// Checkpoint Properties
// =============================================================================

proptest! {
    /// Whatever order acknowledgements arrive in, the checkpoint never
    /// decreases and never passes the store size.
    #[test]
    fn checkpoint_is_monotone_and_clamped(
        stored in 0usize..50,
        acks in prop::collection::vec(0usize..100, 1..40),
    ) {
        let store = Arc::new(ValueDedupStore::new());
        store.insert_all((0..stored as i64).map(Value));
        let tracker = CheckpointTracker::new(Arc::clone(&store));
        let peer = NodeId::from("n1");
        tracker.init([&peer]);

        let mut previous = tracker.get(&peer);
        for ack in acks {
            let now = tracker.advance(&peer, ack);
            prop_assert!(now >= previous);
            prop_assert!(now <= store.size());
            prop_assert_eq!(now, previous.max(ack.min(stored)));
            previous = now;
        }
    }

    /// Outstanding plus confirmed always covers the whole store.
    #[test]
    fn checkpoint_outstanding_covers_remainder(
        stored in 0usize..50,
        ack in 0usize..60,
    ) {
        let store = Arc::new(ValueDedupStore::new());
        store.insert_all((0..stored as i64).map(Value));
        let tracker = CheckpointTracker::new(store);
        let peer = NodeId::from("n1");
        tracker.init([&peer]);

        let confirmed = tracker.advance(&peer, ack);
        let (delta, highwater) = tracker.outstanding(&peer);
        prop_assert_eq!(confirmed + delta.len(), stored);
        prop_assert_eq!(highwater, stored);
    }
}

// =============================================================================
// Tree Overlay Properties
// =============================================================================

proptest! {
    /// The overlay depends on the member set, not on its order.
    #[test]
    fn overlay_is_order_independent(
        n in 1usize..40,
        m in 1usize..6,
        seed in any::<u64>(),
    ) {
        let ordered = members(n);
        let mut shuffled = ordered.clone();
        // Deterministic Fisher-Yates from the seed.
        let mut state = seed | 1;
        for i in (1..shuffled.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let j = (state % (i as u64 + 1)) as usize;
            shuffled.swap(i, j);
        }

        let a = TreeOverlay::build(&ordered, m).unwrap();
        let b = TreeOverlay::build(&shuffled, m).unwrap();
        prop_assert_eq!(a, b);
    }

    /// y ∈ neighbors(x) iff x ∈ neighbors(y).
    #[test]
    fn overlay_neighbors_are_symmetric(n in 1usize..40, m in 1usize..6) {
        let overlay = TreeOverlay::build(&members(n), m).unwrap();
        for (id, neighbors) in overlay.adjacency() {
            prop_assert!(!neighbors.contains(&id));
            for other in neighbors {
                prop_assert!(overlay.neighbors(&other).contains(&id));
            }
        }
    }

    /// Every member is reachable from the root, over exactly n - 1 edges.
    #[test]
    fn overlay_is_a_spanning_tree(n in 1usize..40, m in 1usize..6) {
        let overlay = TreeOverlay::build(&members(n), m).unwrap();
        let adjacency = overlay.adjacency();

        let root = overlay.root().cloned().unwrap();
        let mut seen = BTreeSet::from([root.clone()]);
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            for next in &adjacency[&id] {
                if seen.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        prop_assert_eq!(seen.len(), n);

        let edges: usize = adjacency.values().map(|s| s.len()).sum::<usize>() / 2;
        prop_assert_eq!(edges, n - 1);
    }

    /// Each node has at most m children plus one parent.
    #[test]
    fn overlay_degree_is_bounded(n in 1usize..60, m in 1usize..6) {
        let overlay = TreeOverlay::build(&members(n), m).unwrap();
        for node in overlay.nodes() {
            prop_assert!(node.children.len() <= m);
            prop_assert!(overlay.neighbors(&node.id).len() <= m + 1);
        }
    }

    /// The tree is balanced: its height is the least h whose complete
    /// m-ary tree holds n nodes.
    #[test]
    fn overlay_height_is_minimal(n in 1usize..200, m in 1usize..6) {
        let overlay = TreeOverlay::build(&members(n), m).unwrap();
        let h = overlay.height();

        prop_assert!(capacity(m, h) >= n as u128);
        if h > 0 {
            prop_assert!(capacity(m, h - 1) < n as u128);
        }
    }
}

// =============================================================================
// Batch Aggregator Properties
// =============================================================================

proptest! {
    /// Drain returns exactly what was enqueued since the previous drain.
    #[test]
    fn drain_conserves_values(
        ops in prop::collection::vec((0usize..4, prop::collection::vec(any::<i64>(), 0..5)), 0..40),
    ) {
        let aggregator = BatchAggregator::new();
        let peers = members(4);
        let mut expected = 0usize;

        for (peer, values) in &ops {
            let values: Vec<Value> = values.iter().copied().map(Value).collect();
            aggregator.enqueue(&peers[*peer], &values);
            expected += values.len();
        }
        prop_assert_eq!(aggregator.pending_len(), expected);

        let drained = aggregator.drain_all();
        let total: usize = drained.values().map(|b| b.len()).sum();
        prop_assert_eq!(total, expected);
        prop_assert!(drained.values().all(|b| !b.is_empty()));
        prop_assert!(aggregator.is_empty());
        prop_assert!(aggregator.drain_all().is_empty());
    }
}

// =============================================================================
// Protocol Properties
// =============================================================================

proptest! {
    /// Arbitrary input never panics the parser.
    #[test]
    fn parse_line_never_panics(line in ".*") {
        let _ = parse_line(&line);
    }

    /// Arbitrary JSON-ish objects never panic the parser either.
    #[test]
    fn parse_line_handles_json_shapes(
        kind in prop::sample::select(vec!["broadcast", "read", "topology", "init", "bogus"]),
        message in prop::option::of(any::<i64>()),
        msg_id in prop::option::of(any::<u64>()),
    ) {
        let mut body = serde_json::json!({ "type": kind });
        if let Some(m) = message {
            body["message"] = serde_json::json!(m);
        }
        if let Some(id) = msg_id {
            body["msg_id"] = serde_json::json!(id);
        }
        let line = serde_json::json!({ "src": "c1", "dest": "n0", "body": body }).to_string();
        let _ = parse_line(&line);
    }

    /// A well-formed single broadcast always parses to that value.
    #[test]
    fn parse_line_reads_broadcast_value(value in any::<i64>(), msg_id in any::<u64>()) {
        let line = format!(
            r#"{{"src":"c1","dest":"n0","body":{{"type":"broadcast","message":{},"msg_id":{}}}}}"#,
            value, msg_id
        );
        let inbound = parse_line(&line).unwrap();
        match inbound {
            broadcast_engine::protocol::Inbound::Request { request, msg_id: id, .. } => {
                prop_assert_eq!(id, Some(msg_id));
                match request.unwrap() {
                    broadcast_engine::Request::Broadcast(payload) => {
                        prop_assert_eq!(payload.values(), &[Value(value)]);
                    }
                    other => prop_assert!(false, "unexpected request {:?}", other),
                }
            }
            other => prop_assert!(false, "unexpected inbound {:?}", other),
        }
    }
}
