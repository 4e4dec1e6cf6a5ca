// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-peer delivery checkpoints.
//!
//! A checkpoint is a highwater mark into the store's insertion log: position
//! `k` for peer `p` means the first `k` values have been confirmed received by
//! `p`. Everything past it is the peer's outstanding delta.
//!
//! # Monotonicity
//!
//! Acknowledgments can arrive out of order (two pushes in flight, the later
//! one confirmed first). [`CheckpointTracker::advance`] therefore only ever
//! moves a checkpoint forward:
//!
//! ```text
//! checkpoint(p) = max(checkpoint(p), min(delivered, store.size()))
//! ```
//!
//! Clamping to the store size means a bogus count can never skip values that
//! do not exist yet.
//!
//! Checkpoints live in memory only. A restarted node starts every peer at 0
//! and re-pushes everything, which dedup absorbs on the other side.

use crate::metrics;
use crate::store::{Value, ValueDedupStore};
use crate::topology::NodeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Highwater marks of confirmed delivery, one per peer.
pub struct CheckpointTracker {
    store: Arc<ValueDedupStore>,
    positions: RwLock<HashMap<NodeId, usize>>,
}

impl CheckpointTracker {
    pub fn new(store: Arc<ValueDedupStore>) -> Self {
        Self {
            store,
            positions: RwLock::new(HashMap::new()),
        }
    }

    /// Start tracking `peers` at position 0. Peers already tracked keep
    /// their position.
    pub fn init<'a>(&self, peers: impl IntoIterator<Item = &'a NodeId>) {
        let mut positions = self.positions.write().unwrap_or_else(|p| p.into_inner());
        for peer in peers {
            positions.entry(peer.clone()).or_insert(0);
        }
    }

    /// Current checkpoint of `peer` (0 if untracked).
    pub fn get(&self, peer: &NodeId) -> usize {
        self.positions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(peer)
            .copied()
            .unwrap_or(0)
    }

    /// Tracked peers, sorted.
    pub fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .positions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    /// Values not yet confirmed at `peer`, and the log position they run up to.
    ///
    /// The returned position is what to pass to [`advance`](Self::advance)
    /// once the delta has been acknowledged.
    pub fn outstanding(&self, peer: &NodeId) -> (Vec<Value>, usize) {
        self.store.since(self.get(peer))
    }

    /// Move `peer`'s checkpoint to `delivered`, never backwards.
    ///
    /// Returns the checkpoint after the call.
    pub fn advance(&self, peer: &NodeId, delivered: usize) -> usize {
        let ceiling = self.store.size();
        let target = delivered.min(ceiling);
        let mut positions = self.positions.write().unwrap_or_else(|p| p.into_inner());
        let position = positions.entry(peer.clone()).or_insert(0);
        if target > *position {
            debug!(peer_id = %peer, from = *position, to = target, "Checkpoint advanced");
            *position = target;
            metrics::set_checkpoint(peer.as_str(), target);
        }
        *position
    }
}
