//! # Broadcast Engine
//!
//! Cluster-wide gossip broadcast: every value handed to any node eventually
//! reaches every node, exactly once per node, despite dropped messages,
//! partitions, and slow peers.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              BroadcastNode                                │
//! │                                                                           │
//! │  broadcast ──► ValueDedupStore ──new?──► PropagationEngine ──► neighbors  │
//! │                 (set + ordered log)       (immediate / batched)           │
//! │                        │                          │                       │
//! │                        ▼                          ▼                       │
//! │               CheckpointTracker ◄──────── AntiEntropyScheduler            │
//! │               (highwater per peer)        (every tick: push deltas        │
//! │                                            through BatchAggregator)       │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Delivery Paths
//!
//! 1. **Propagation**: a value seen for the first time is forwarded to every
//!    neighbor except its sender, retried with linear backoff.
//! 2. **Anti-entropy**: on a fixed interval each peer is pushed whatever it
//!    has not confirmed yet. This is what guarantees eventual delivery.
//!
//! Both paths are idempotent through dedup-insert on the receiving side.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use broadcast_engine::{transport, BroadcastConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = BroadcastConfig::default();
//!     // Serves JSON lines on stdin/stdout until stdin closes.
//!     transport::run_stdio(config).await.expect("node failed");
//! }
//! ```

pub mod anti_entropy;
pub mod batch;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod propagation;
pub mod protocol;
pub mod resilience;
pub mod store;
pub mod telemetry;
pub mod topology;
pub mod transport;

// Re-exports for convenience
pub use anti_entropy::{AntiEntropyScheduler, TickStats};
pub use batch::{BatchAggregator, PendingBatch};
pub use checkpoint::CheckpointTracker;
pub use client::PeerClient;
pub use config::{BroadcastConfig, BroadcastSettings, PropagationMode, TopologyMode};
pub use coordinator::{BroadcastNode, NodeState, NodeStatus};
pub use error::{BroadcastError, Result};
pub use propagation::{DeliveryState, PropagationEngine};
pub use protocol::{BroadcastPayload, Request, Response};
pub use resilience::RetryPolicy;
pub use store::{Value, ValueDedupStore};
pub use topology::{NodeId, Topology, TopologyBuilder, TreeOverlay};
