// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Broadcast node coordinator.
//!
//! The orchestrator that ties together:
//! - The value store via [`crate::store::ValueDedupStore`]
//! - Overlay construction via [`crate::topology::TopologyBuilder`]
//! - Fan-out of new values via [`crate::propagation::PropagationEngine`]
//! - Periodic repair via [`crate::anti_entropy::AntiEntropyScheduler`]
//!
//! # Architecture
//!
//! The coordinator owns the node lifecycle:
//! 1. `init` fixes the node id and the member list
//! 2. `topology` installs the overlay (once) and starts anti-entropy
//! 3. `broadcast` dedup-inserts, acknowledges, then hands new values to propagation
//! 4. `read` returns everything stored
//! 5. [`BroadcastNode::shutdown`] cancels retries and stops the timer
//!
//! Requests are handled through `&self` so one node can serve many
//! concurrent request tasks.

mod types;

pub use types::{NodeState, NodeStatus};

use crate::anti_entropy::{AntiEntropyScheduler, SchedulerConfig, TickStats};
use crate::batch::BatchAggregator;
use crate::checkpoint::CheckpointTracker;
use crate::client::PeerClient;
use crate::config::{BroadcastConfig, PropagationMode};
use crate::error::{BroadcastError, Result};
use crate::metrics;
use crate::propagation::PropagationEngine;
use crate::protocol::{BroadcastPayload, Request, Response};
use crate::store::{Value, ValueDedupStore};
use crate::topology::{NodeId, Topology, TopologyBuilder};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How long shutdown waits for each background task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity fixed by `init`.
struct Session<C: PeerClient> {
    node_id: NodeId,
    members: Vec<NodeId>,
    propagation: PropagationEngine<C>,
}

/// One cluster member.
///
/// Generic over the [`PeerClient`] used to reach other members, so the same
/// node runs over stdio in production and over an in-memory network in tests.
pub struct BroadcastNode<C: PeerClient> {
    config: BroadcastConfig,
    client: Arc<C>,

    store: Arc<ValueDedupStore>,
    checkpoints: Arc<CheckpointTracker>,
    aggregator: Arc<BatchAggregator>,

    /// Set once by `init`.
    session: OnceLock<Session<C>>,

    /// Set once by the first `topology`.
    topology: OnceLock<Topology>,

    /// Present once topology is installed, unless both anti-entropy and
    /// batched propagation are off.
    scheduler: OnceLock<AntiEntropyScheduler<C>>,

    state_tx: watch::Sender<NodeState>,
    state_rx: watch::Receiver<NodeState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<C: PeerClient> BroadcastNode<C> {
    /// Create a node in the `Created` state.
    pub fn new(config: BroadcastConfig, client: Arc<C>) -> Self {
        let store = Arc::new(ValueDedupStore::new());
        let (state_tx, state_rx) = watch::channel(NodeState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        metrics::set_node_state("Created", NodeState::Created.code());

        Self {
            config,
            client,
            checkpoints: Arc::new(CheckpointTracker::new(Arc::clone(&store))),
            store,
            aggregator: Arc::new(BatchAggregator::new()),
            session: OnceLock::new(),
            topology: OnceLock::new(),
            scheduler: OnceLock::new(),
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn state(&self) -> NodeState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<NodeState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == NodeState::Running
    }

    fn set_state(&self, state: NodeState) {
        self.state_tx.send_replace(state);
        metrics::set_node_state(&state.to_string(), state.code());
    }

    pub fn node_id(&self) -> Option<&NodeId> {
        self.session.get().map(|s| &s.node_id)
    }

    pub fn members(&self) -> &[NodeId] {
        self.session
            .get()
            .map(|s| s.members.as_slice())
            .unwrap_or(&[])
    }

    pub fn topology(&self) -> Option<&Topology> {
        self.topology.get()
    }

    pub fn store(&self) -> &Arc<ValueDedupStore> {
        &self.store
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointTracker> {
        &self.checkpoints
    }

    pub fn propagation(&self) -> Option<&PropagationEngine<C>> {
        self.session.get().map(|s| &s.propagation)
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    /// Dispatch a validated request.
    pub async fn handle(&self, src: &NodeId, request: Request) -> Result<Response> {
        let kind = request.kind();
        let result = match request {
            Request::Init { node_id, node_ids } => {
                self.init(node_id, node_ids).map(|_| Response::InitOk)
            }
            Request::Topology { topology } => {
                self.install_topology(&topology).map(|_| Response::TopologyOk)
            }
            Request::Broadcast(payload) => {
                self.handle_broadcast(src, payload).map(|_| Response::BroadcastOk)
            }
            Request::Read => self.read().map(|messages| Response::ReadOk { messages }),
        };
        metrics::record_request(kind, result.is_ok());
        if let Err(ref e) = result {
            debug!(src = %src, request = kind, error = %e, "Request failed");
        }
        result
    }

    fn ensure_accepting(&self) -> Result<()> {
        match self.state() {
            NodeState::ShuttingDown | NodeState::Stopped => Err(BroadcastError::Shutdown),
            _ => Ok(()),
        }
    }

    /// Fix this node's identity and the cluster membership.
    pub fn init(&self, node_id: NodeId, members: Vec<NodeId>) -> Result<()> {
        self.ensure_accepting()?;
        let propagation = PropagationEngine::new(
            Arc::clone(&self.client),
            node_id.clone(),
            self.config.settings.propagation.mode,
            self.config.settings.propagation.retry_policy(),
            Arc::clone(&self.aggregator),
            self.shutdown_rx.clone(),
        );
        let session = Session {
            node_id: node_id.clone(),
            members,
            propagation,
        };
        if self.session.set(session).is_err() {
            return Err(BroadcastError::InvalidState {
                expected: NodeState::Created.to_string(),
                actual: self.state().to_string(),
            });
        }

        self.set_state(NodeState::Initialized);
        info!(node_id = %node_id, members = self.members().len(), "Node initialized");
        Ok(())
    }

    /// Install the overlay. Only the first call has any effect.
    pub fn install_topology(&self, adjacency: &HashMap<NodeId, Vec<NodeId>>) -> Result<()> {
        self.ensure_accepting()?;
        let session = self.session.get().ok_or_else(|| BroadcastError::InvalidState {
            expected: NodeState::Initialized.to_string(),
            actual: self.state().to_string(),
        })?;

        if self.topology.get().is_some() {
            debug!("Topology already installed, ignoring");
            return Ok(());
        }

        let settings = &self.config.settings;
        let builder = TopologyBuilder::new(settings.topology.mode, settings.topology.branching_factor);
        let topology = builder.build(&session.node_id, &session.members, adjacency)?;
        let peers: Vec<NodeId> = topology.peers().into_iter().collect();

        if self.topology.set(topology).is_err() {
            // Lost a race with a concurrent install.
            return Ok(());
        }
        metrics::set_neighbor_count(peers.len());
        info!(
            mode = ?settings.topology.mode,
            neighbors = ?peers,
            "Topology installed"
        );

        let reconcile = settings.anti_entropy.enabled;
        let flush_batches = settings.propagation.mode == PropagationMode::Batched;
        if reconcile || flush_batches {
            let scheduler = AntiEntropyScheduler::new(
                Arc::clone(&self.client),
                Arc::clone(&self.checkpoints),
                Arc::clone(&self.aggregator),
                peers,
                SchedulerConfig {
                    interval: settings.anti_entropy.interval_duration(),
                    rpc_timeout: settings.anti_entropy.rpc_timeout_duration(),
                    batching: settings.anti_entropy.batching,
                    reconcile,
                },
            );
            let scheduler = self.scheduler.get_or_init(|| scheduler);
            scheduler.start();
        } else {
            warn!("Anti-entropy disabled and propagation not batched: no repair loop");
        }

        self.set_state(NodeState::Running);
        Ok(())
    }

    /// Store the carried values and forward the ones that were new.
    ///
    /// Returns as soon as the values are stored; forwarding happens in the
    /// background.
    pub fn handle_broadcast(&self, src: &NodeId, payload: BroadcastPayload) -> Result<()> {
        self.ensure_accepting()?;
        let received = payload.len();
        let fresh = match payload {
            BroadcastPayload::Single(value) => {
                if self.store.try_insert(value) {
                    vec![value]
                } else {
                    Vec::new()
                }
            }
            BroadcastPayload::Batch(values) => self.store.insert_all(values),
        };
        metrics::record_values_received(src.as_str(), fresh.len(), received - fresh.len());

        if fresh.is_empty() {
            return Ok(());
        }
        metrics::set_store_size(self.store.size());
        debug!(src = %src, fresh = fresh.len(), received, "Stored new values");

        if let (Some(topology), Some(session)) = (self.topology.get(), self.session.get()) {
            session.propagation.propagate(topology, src, &fresh);
        }
        Ok(())
    }

    /// Every stored value.
    pub fn read(&self) -> Result<Vec<Value>> {
        self.ensure_accepting()?;
        let values = self.store.snapshot();
        metrics::record_read(values.len());
        Ok(values)
    }

    /// Run one anti-entropy tick now. `None` before topology install or when
    /// no repair loop is configured.
    pub async fn run_anti_entropy_tick(&self) -> Option<TickStats> {
        match self.scheduler.get() {
            Some(scheduler) => Some(scheduler.run_tick().await),
            None => None,
        }
    }

    /// Diagnostics snapshot.
    pub fn status(&self) -> NodeStatus {
        let neighbors: Vec<NodeId> = self
            .topology
            .get()
            .map(|t| t.peers().into_iter().collect())
            .unwrap_or_default();
        let checkpoints = neighbors
            .iter()
            .map(|n| (n.clone(), self.checkpoints.get(n)))
            .collect();
        let (deliveries_in_flight, delivery_counts) = match self.propagation() {
            Some(p) => (p.deliveries().len(), p.counts()),
            None => (0, Default::default()),
        };

        NodeStatus {
            state: self.state(),
            node_id: self.node_id().cloned(),
            values: self.store.size(),
            neighbors,
            checkpoints,
            deliveries_in_flight,
            delivery_counts,
            batched_values: self.aggregator.pending_len(),
        }
    }

    /// Gracefully shut down.
    ///
    /// Shutdown sequence:
    /// 1. Refuse new requests
    /// 2. Signal retry loops to stop at their next await
    /// 3. Stop the anti-entropy timer
    /// 4. Join propagation tasks (bounded)
    pub async fn shutdown(&self) {
        if matches!(self.state(), NodeState::ShuttingDown | NodeState::Stopped) {
            return;
        }
        info!("Shutting down broadcast node");
        self.set_state(NodeState::ShuttingDown);
        self.shutdown_tx.send_replace(true);

        if let Some(scheduler) = self.scheduler.get() {
            scheduler.shutdown(DRAIN_TIMEOUT).await;
        }
        if let Some(propagation) = self.propagation() {
            propagation.join(DRAIN_TIMEOUT).await;
        }

        self.set_state(NodeState::Stopped);
        info!(values = self.store.size(), "Broadcast node stopped");
    }
}
