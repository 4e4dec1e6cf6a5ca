// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Anti-entropy: periodic checkpoint reconciliation.
//!
//! Immediate propagation is best effort. This loop is what makes delivery
//! eventual: every tick it pushes each peer whatever that peer has not yet
//! confirmed, regardless of what propagation did or did not manage.
//!
//! # Algorithm (one tick)
//!
//! 1. For every peer, compute its outstanding delta from the checkpoint
//! 2. Empty delta → skip that peer and move on to the next one
//! 3. Non-empty → queue it in the [`BatchAggregator`] (or keep it aside when
//!    batching is off)
//! 4. Drain the aggregator and fold it into the direct deltas; push one
//!    `broadcast {messages}` per peer, all peers concurrently, each under its
//!    own timeout
//! 5. Confirmed push → advance that peer's checkpoint to the delta's highwater
//! 6. Failed push → log it; a checkpointed delta is still outstanding next
//!    tick, a batch without a highwater goes back into the aggregator
//!
//! No lock is held across a push. A tick requested while another one is
//! running is skipped and reports `overlapped`. Pushes racing immediate
//! propagation may deliver a value twice; the receiver's dedup absorbs that.

use crate::batch::{BatchAggregator, PendingBatch};
use crate::checkpoint::CheckpointTracker;
use crate::client::PeerClient;
use crate::metrics;
use crate::protocol::BroadcastPayload;
use crate::store::Value;
use crate::topology::NodeId;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn, Instrument};

/// Tunables for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub rpc_timeout: Duration,
    /// Route outstanding deltas through the batch aggregator.
    pub batching: bool,
    /// Compute outstanding deltas from checkpoints. When off, ticks only
    /// flush whatever batched propagation queued.
    pub reconcile: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(1),
            batching: true,
            reconcile: true,
        }
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickStats {
    /// Peers whose delta was computed.
    pub peers_checked: usize,
    /// Peers with nothing outstanding.
    pub peers_skipped: usize,
    /// Pushes acknowledged.
    pub peers_pushed: usize,
    /// Values carried by acknowledged pushes.
    pub values_pushed: usize,
    /// Pushes that failed or timed out.
    pub failures: usize,
    /// Another tick was already running; this one did nothing.
    pub overlapped: bool,
}

struct Shared<C: PeerClient> {
    client: Arc<C>,
    checkpoints: Arc<CheckpointTracker>,
    aggregator: Arc<BatchAggregator>,
    peers: Vec<NodeId>,
    config: SchedulerConfig,
    // Set while a tick runs so a manual tick never overlaps the timer's.
    ticking: AtomicBool,
}

/// Clears the in-progress flag when a tick ends, including on cancellation.
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the anti-entropy timer task.
pub struct AntiEntropyScheduler<C: PeerClient> {
    shared: Arc<Shared<C>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<C: PeerClient> AntiEntropyScheduler<C> {
    pub fn new(
        client: Arc<C>,
        checkpoints: Arc<CheckpointTracker>,
        aggregator: Arc<BatchAggregator>,
        peers: Vec<NodeId>,
        config: SchedulerConfig,
    ) -> Self {
        checkpoints.init(&peers);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                client,
                checkpoints,
                aggregator,
                peers,
                config,
                ticking: AtomicBool::new(false),
            }),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.shared.peers
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Spawn the timer loop. A second call while running is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(run_scheduler(shared, shutdown_rx)));
    }

    /// Run one tick now, outside the timer. Skipped if a tick is running.
    pub async fn run_tick(&self) -> TickStats {
        self.shared.tick().await
    }

    /// Stop the timer loop and wait for it, at most `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutdown_tx.send_replace(true);
        let handle = self.handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            match tokio::time::timeout(timeout, handle).await {
                Ok(_) => debug!("Anti-entropy task joined"),
                Err(_) => warn!("Anti-entropy task did not stop in time"),
            }
        }
    }
}

async fn run_scheduler<C: PeerClient>(shared: Arc<Shared<C>>, mut shutdown_rx: watch::Receiver<bool>) {
    let span = tracing::info_span!("anti_entropy");

    async move {
        let _ = shutdown_rx.borrow_and_update();
        let interval = shared.config.interval;

        info!(
            interval_ms = interval.as_millis() as u64,
            peers = shared.peers.len(),
            batching = shared.config.batching,
            "Starting anti-entropy task"
        );

        // Nothing to repair right after install; first tick one interval in.
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping anti-entropy task");
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            let stats = shared.tick().await;
            if stats.values_pushed > 0 || stats.failures > 0 {
                debug!(
                    pushed = stats.peers_pushed,
                    skipped = stats.peers_skipped,
                    values = stats.values_pushed,
                    failures = stats.failures,
                    "Anti-entropy tick"
                );
            }
        }

        info!("Anti-entropy task stopped");
    }
    .instrument(span)
    .await
}

impl<C: PeerClient> Shared<C> {
    #[instrument(skip_all, fields(peers = self.peers.len()))]
    async fn tick(&self) -> TickStats {
        let Some(_guard) = TickGuard::acquire(&self.ticking) else {
            debug!("Anti-entropy tick already running, skipping");
            return TickStats {
                overlapped: true,
                ..Default::default()
            };
        };
        let started = Instant::now();
        let mut stats = TickStats::default();
        let mut pushes: HashMap<NodeId, PendingBatch> = HashMap::new();

        if self.config.reconcile {
            for peer in &self.peers {
                stats.peers_checked += 1;
                let (delta, highwater) = self.checkpoints.outstanding(peer);
                if delta.is_empty() {
                    stats.peers_skipped += 1;
                    continue;
                }
                if self.config.batching {
                    self.aggregator.enqueue_outstanding(peer, &delta, highwater);
                } else {
                    pushes.insert(
                        peer.clone(),
                        PendingBatch {
                            values: delta,
                            highwater: Some(highwater),
                        },
                    );
                }
            }
        }

        // One push per peer: queued values ride along with the direct delta.
        for (peer, batch) in self.aggregator.drain_all() {
            pushes.entry(peer).or_default().absorb(batch);
        }

        let results = join_all(
            pushes
                .into_iter()
                .map(|(peer, batch)| self.push(peer, batch.values, batch.highwater)),
        )
        .await;

        for (delivered, ok) in results {
            if ok {
                stats.peers_pushed += 1;
                stats.values_pushed += delivered;
            } else {
                stats.failures += 1;
            }
        }

        metrics::record_anti_entropy_tick(stats.peers_pushed, stats.peers_skipped, started.elapsed());
        stats
    }

    /// Push one peer's batch; returns (values carried, acknowledged).
    ///
    /// A failed batch with no highwater has no checkpoint to re-derive it
    /// from, so it is queued again for the next tick.
    async fn push(&self, peer: NodeId, values: Vec<Value>, highwater: Option<usize>) -> (usize, bool) {
        let count = values.len();
        let started = Instant::now();
        let requeue = highwater.is_none().then(|| values.clone());
        let result = tokio::time::timeout(
            self.config.rpc_timeout,
            self.client
                .send_broadcast(&peer, BroadcastPayload::Batch(values)),
        )
        .await;

        let ok = match result {
            Ok(Ok(())) => {
                if let Some(highwater) = highwater {
                    self.checkpoints.advance(&peer, highwater);
                }
                true
            }
            Ok(Err(e)) => {
                debug!(peer_id = %peer, values = count, error = %e, "Anti-entropy push failed");
                false
            }
            Err(_) => {
                debug!(
                    peer_id = %peer,
                    values = count,
                    timeout_ms = self.config.rpc_timeout.as_millis() as u64,
                    "Anti-entropy push timed out"
                );
                false
            }
        };
        if !ok {
            if let Some(values) = requeue {
                self.aggregator.enqueue(&peer, &values);
            }
        }
        metrics::record_anti_entropy_push(peer.as_str(), count, ok, started.elapsed());
        (count, ok)
    }
}
