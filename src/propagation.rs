// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Propagation: forwarding newly seen values to neighbors.
//!
//! Runs after a value has been inserted for the first time and the caller has
//! already been acknowledged. What happens next depends on the mode:
//!
//! | Mode | Behavior |
//! |------|----------|
//! | `immediate` | One supervised task per inbound broadcast; it delivers to every neighbor concurrently, each with its own retry loop |
//! | `batched` | Values are queued in the [`BatchAggregator`] and ride the next anti-entropy flush |
//! | `disabled` | Nothing; anti-entropy alone spreads values |
//!
//! The sender of a value is never sent it back, and neither is this node.
//!
//! # Retry Loop
//!
//! ```text
//! attempt 1 ──timeout/err──▶ wait 1u ──▶ attempt 2 ──timeout/err──▶ wait 2u ──▶ ...
//!     │                                      │
//!     └──ok──▶ Delivered                     └──ok──▶ Delivered
//!
//! attempt N fails ──▶ Exhausted (logged, anti-entropy picks it up)
//! shutdown signal ──▶ Cancelled (at any await point)
//! ```
//!
//! Every delivery in flight is visible through [`PropagationEngine::deliveries()`]
//! with its attempt count and current backoff.

use crate::batch::BatchAggregator;
use crate::client::PeerClient;
use crate::config::PropagationMode;
use crate::error::BroadcastError;
use crate::metrics;
use crate::protocol::BroadcastPayload;
use crate::resilience::RetryPolicy;
use crate::store::Value;
use crate::topology::{NodeId, Topology};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Where a single per-neighbor delivery currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// An attempt is waiting for the neighbor's reply.
    InFlight,
    /// The last attempt failed; sleeping before the next one.
    BackingOff,
    Delivered,
    /// Ran out of attempts.
    Exhausted,
    /// The neighbor rejected the payload outright; retrying cannot help.
    Rejected,
    /// Abandoned because the node is shutting down.
    Cancelled,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InFlight | Self::BackingOff)
    }
}

/// Observable state of one per-neighbor delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryStatus {
    pub id: u64,
    pub peer: NodeId,
    pub values: usize,
    pub attempts: u32,
    pub next_backoff: Option<Duration>,
    pub state: DeliveryState,
}

/// Outcome counters over the lifetime of the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryCounts {
    pub delivered: u64,
    pub exhausted: u64,
    pub rejected: u64,
    pub cancelled: u64,
}

/// Live deliveries plus terminal counters.
///
/// Terminal deliveries leave the live table so it stays bounded by the
/// amount of work actually in flight.
#[derive(Default)]
pub struct DeliveryRegistry {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, DeliveryStatus>>,
    delivered: AtomicU64,
    exhausted: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
}

impl DeliveryRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, DeliveryStatus>> {
        self.live.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn register(&self, peer: &NodeId, values: usize) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(
            id,
            DeliveryStatus {
                id,
                peer: peer.clone(),
                values,
                attempts: 0,
                next_backoff: None,
                state: DeliveryState::InFlight,
            },
        );
        id
    }

    fn update(&self, id: u64, attempts: u32, state: DeliveryState, next_backoff: Option<Duration>) {
        if let Some(status) = self.lock().get_mut(&id) {
            status.attempts = attempts;
            status.state = state;
            status.next_backoff = next_backoff;
        }
    }

    fn finish(&self, id: u64, state: DeliveryState) {
        self.lock().remove(&id);
        let counter = match state {
            DeliveryState::Delivered => &self.delivered,
            DeliveryState::Exhausted => &self.exhausted,
            DeliveryState::Rejected => &self.rejected,
            DeliveryState::Cancelled => &self.cancelled,
            DeliveryState::InFlight | DeliveryState::BackingOff => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Deliveries currently in flight or backing off, ordered by id.
    pub fn snapshot(&self) -> Vec<DeliveryStatus> {
        let mut live: Vec<DeliveryStatus> = self.lock().values().cloned().collect();
        live.sort_by_key(|s| s.id);
        live
    }

    pub fn counts(&self) -> DeliveryCounts {
        DeliveryCounts {
            delivered: self.delivered.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Forwards freshly inserted values to neighbors.
pub struct PropagationEngine<C: PeerClient> {
    client: Arc<C>,
    self_id: NodeId,
    mode: PropagationMode,
    policy: RetryPolicy,
    aggregator: Arc<BatchAggregator>,
    registry: Arc<DeliveryRegistry>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: PeerClient> PropagationEngine<C> {
    pub fn new(
        client: Arc<C>,
        self_id: NodeId,
        mode: PropagationMode,
        policy: RetryPolicy,
        aggregator: Arc<BatchAggregator>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            self_id,
            mode,
            policy,
            aggregator,
            registry: Arc::new(DeliveryRegistry::default()),
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> PropagationMode {
        self.mode
    }

    /// Neighbors that should receive a value that arrived from `sender`.
    pub fn targets(&self, topology: &Topology, sender: &NodeId) -> Vec<NodeId> {
        topology
            .peers()
            .into_iter()
            .filter(|peer| peer != sender && *peer != self.self_id)
            .collect()
    }

    /// Forward `fresh` (values this node just inserted) from `sender`.
    ///
    /// Never waits on the network. Returns the number of neighbors the
    /// values were handed off towards.
    pub fn propagate(&self, topology: &Topology, sender: &NodeId, fresh: &[Value]) -> usize {
        if fresh.is_empty() || *self.shutdown_rx.borrow() {
            return 0;
        }
        let targets = self.targets(topology, sender);
        if targets.is_empty() {
            return 0;
        }

        match self.mode {
            PropagationMode::Disabled => 0,
            PropagationMode::Batched => {
                for peer in &targets {
                    self.aggregator.enqueue(peer, fresh);
                }
                targets.len()
            }
            PropagationMode::Immediate => {
                self.spawn_fan_out(targets.clone(), fresh.to_vec());
                targets.len()
            }
        }
    }

    fn spawn_fan_out(&self, targets: Vec<NodeId>, values: Vec<Value>) {
        let payload = match values.as_slice() {
            [single] => BroadcastPayload::Single(*single),
            _ => BroadcastPayload::Batch(values),
        };
        let span = tracing::info_span!(
            "propagation",
            values = payload.len(),
            neighbors = targets.len()
        );

        let client = Arc::clone(&self.client);
        let registry = Arc::clone(&self.registry);
        let policy = self.policy.clone();
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(
            async move {
                let deliveries = targets.into_iter().map(|peer| {
                    deliver_with_retry(
                        client.as_ref(),
                        &registry,
                        &policy,
                        peer,
                        payload.clone(),
                        shutdown_rx.clone(),
                    )
                });
                let outcomes = join_all(deliveries).await;
                debug!(
                    delivered = outcomes.iter().filter(|s| **s == DeliveryState::Delivered).count(),
                    total = outcomes.len(),
                    "Fan-out finished"
                );
            }
            .instrument(span),
        );

        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
        metrics::set_propagation_in_flight(tasks.len());
    }

    /// Deliveries currently in progress.
    pub fn deliveries(&self) -> Vec<DeliveryStatus> {
        self.registry.snapshot()
    }

    pub fn counts(&self) -> DeliveryCounts {
        self.registry.counts()
    }

    /// Number of fan-out tasks still running.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|h| !h.is_finished());
        tasks.len()
    }

    /// Wait for fan-out tasks to finish, giving each at most `timeout`.
    ///
    /// Meant to be called after the shutdown signal, at which point every
    /// retry loop bails out at its next await.
    pub async fn join(&self, timeout: Duration) {
        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        let count = handles.len();
        for handle in handles {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("Propagation task did not stop in time");
            }
        }
        if count > 0 {
            debug!(tasks = count, "Propagation tasks joined");
        }
        metrics::set_propagation_in_flight(0);
    }
}

/// Deliver `payload` to `peer`, retrying under `policy` until it is
/// acknowledged, the budget runs out, or shutdown is signalled.
pub async fn deliver_with_retry<C: PeerClient + ?Sized>(
    client: &C,
    registry: &DeliveryRegistry,
    policy: &RetryPolicy,
    peer: NodeId,
    payload: BroadcastPayload,
    mut shutdown_rx: watch::Receiver<bool>,
) -> DeliveryState {
    let id = registry.register(&peer, payload.len());
    let started = Instant::now();
    let mut attempt: u32 = 0;

    let state = loop {
        if *shutdown_rx.borrow() {
            break DeliveryState::Cancelled;
        }
        attempt += 1;
        registry.update(id, attempt, DeliveryState::InFlight, None);

        let send = tokio::time::timeout(
            policy.attempt_timeout,
            client.send_broadcast(&peer, payload.clone()),
        );
        let result = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break DeliveryState::Cancelled,
            result = send => result,
        };

        let err = match result {
            Ok(Ok(())) => {
                metrics::record_delivery_attempt(peer.as_str(), "ok");
                metrics::record_delivery_success(peer.as_str(), attempt, started.elapsed());
                if attempt > 1 {
                    info!(peer_id = %peer, attempt, "Delivered after retry");
                }
                break DeliveryState::Delivered;
            }
            Ok(Err(e)) => e,
            Err(_) => BroadcastError::Timeout {
                peer_id: peer.to_string(),
                after: policy.attempt_timeout,
            },
        };
        let outcome = if matches!(err, BroadcastError::Timeout { .. }) { "timeout" } else { "error" };
        metrics::record_delivery_attempt(peer.as_str(), outcome);

        if !err.is_retryable() {
            warn!(peer_id = %peer, attempt, error = %err, "Delivery rejected, not retrying");
            break DeliveryState::Rejected;
        }
        if !policy.has_attempts_left(attempt) {
            warn!(
                peer_id = %peer,
                attempts = attempt,
                error = %err,
                "Delivery attempts exhausted, leaving it to anti-entropy"
            );
            metrics::record_delivery_exhausted(peer.as_str());
            break DeliveryState::Exhausted;
        }

        let backoff = policy.delay_after_attempt(attempt);
        debug!(
            peer_id = %peer,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Delivery failed, backing off"
        );
        registry.update(id, attempt, DeliveryState::BackingOff, Some(backoff));

        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break DeliveryState::Cancelled,
            _ = tokio::time::sleep(backoff) => {}
        }
    };

    if state == DeliveryState::Cancelled {
        metrics::record_delivery_cancelled(peer.as_str());
        debug!(peer_id = %peer, attempts = attempt, "Delivery cancelled by shutdown");
    }
    registry.finish(id, state);
    state
}
