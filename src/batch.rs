//! Per-peer batch aggregation.
//!
//! Values bound for a peer are queued here and leave as one `broadcast`
//! carrying `messages` per peer per flush.
//!
//! # Design
//!
//! ```text
//! propagation (batched mode) ──┐
//!                              ├──▶ enqueue ──▶ HashMap<peer, PendingBatch>
//! anti-entropy (outstanding) ──┘                        │
//!                                                       ▼ drain_all (swap)
//!                                          one push per peer this tick
//! ```
//!
//! `drain_all` swaps the whole map for an empty one under the lock and hands
//! back what was there. An enqueue racing a drain lands either in the batch
//! being drained or in the next one, never in both and never in neither.

use crate::metrics;
use crate::store::Value;
use crate::topology::NodeId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Values waiting to be pushed to one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingBatch {
    /// Values in enqueue order. May contain repeats; the receiver dedups.
    pub values: Vec<Value>,

    /// Log position covered by the queued outstanding delta, if anti-entropy
    /// contributed one. A confirmed push advances the peer's checkpoint to it.
    pub highwater: Option<usize>,
}

impl PendingBatch {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fold `other` into this batch, keeping the higher highwater.
    pub fn absorb(&mut self, other: PendingBatch) {
        self.values.extend(other.values);
        self.highwater = match (self.highwater, other.highwater) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Accumulates per-peer batches between flushes.
#[derive(Default)]
pub struct BatchAggregator {
    pending: Mutex<HashMap<NodeId, PendingBatch>>,
}

impl BatchAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, PendingBatch>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Append `values` to `peer`'s pending batch.
    pub fn enqueue(&self, peer: &NodeId, values: &[Value]) {
        if values.is_empty() {
            return;
        }
        self.lock()
            .entry(peer.clone())
            .or_default()
            .values
            .extend_from_slice(values);
        metrics::record_batch_enqueued(peer.as_str(), values.len());
    }

    /// Append an outstanding delta that runs up to log position `highwater`.
    pub fn enqueue_outstanding(&self, peer: &NodeId, values: &[Value], highwater: usize) {
        if values.is_empty() {
            return;
        }
        let mut pending = self.lock();
        let batch = pending.entry(peer.clone()).or_default();
        batch.values.extend_from_slice(values);
        batch.highwater = Some(batch.highwater.map_or(highwater, |h| h.max(highwater)));
        drop(pending);
        metrics::record_batch_enqueued(peer.as_str(), values.len());
    }

    /// Take every pending batch, leaving the aggregator empty.
    pub fn drain_all(&self) -> HashMap<NodeId, PendingBatch> {
        let drained = std::mem::take(&mut *self.lock());
        let values = drained.values().map(PendingBatch::len).sum();
        metrics::record_batch_drain(drained.len(), values);
        drained
    }

    /// Number of values queued across all peers.
    pub fn pending_len(&self) -> usize {
        self.lock().values().map(PendingBatch::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
