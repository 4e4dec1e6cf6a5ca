//! Node state types.
//!
//! Defines the state machine for the broadcast node lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!            init                  topology
//! Created ─────────→ Initialized ─────────────→ Running
//!    │                    │                        │
//!    │                    │ shutdown()             │ shutdown()
//!    │                    ↓                        │
//!    └──────────────→ ShuttingDown ←───────────────┘
//!                         │
//!                         ↓
//!                      Stopped
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: After `BroadcastNode::new()`. Reads are served; nothing else.
//! - **Initialized**: `init` received; the node knows its id and the members.
//!   Broadcasts are stored but not forwarded yet.
//! - **Running**: Topology installed, propagation and anti-entropy active.
//! - **ShuttingDown**: `shutdown()` called. Retries are being cancelled.
//! - **Stopped**: All tasks joined. Safe to drop.

use crate::propagation::DeliveryCounts;
use crate::topology::NodeId;

/// State of the broadcast node.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Created, waiting for `init`.
    Created,

    /// Identity known, waiting for `topology`.
    Initialized,

    /// Gossiping.
    Running,

    /// Shutting down; no new requests are accepted.
    ShuttingDown,

    /// Stopped.
    Stopped,
}

impl NodeState {
    /// Numeric code for the state gauge.
    pub fn code(self) -> u8 {
        match self {
            NodeState::Created => 0,
            NodeState::Initialized => 1,
            NodeState::Running => 2,
            NodeState::ShuttingDown => 3,
            NodeState::Stopped => 4,
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Created => write!(f, "Created"),
            NodeState::Initialized => write!(f, "Initialized"),
            NodeState::Running => write!(f, "Running"),
            NodeState::ShuttingDown => write!(f, "ShuttingDown"),
            NodeState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Point-in-time view of a node, for diagnostics and tests.
///
/// Collected from in-memory state only; no network I/O.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub state: NodeState,
    pub node_id: Option<NodeId>,
    /// Distinct values stored.
    pub values: usize,
    /// This node's neighbors (empty before topology install).
    pub neighbors: Vec<NodeId>,
    /// Checkpoint per neighbor, sorted by neighbor.
    pub checkpoints: Vec<(NodeId, usize)>,
    /// Per-neighbor deliveries still retrying.
    pub deliveries_in_flight: usize,
    pub delivery_counts: DeliveryCounts,
    /// Values queued for the next flush.
    pub batched_values: usize,
}

impl NodeStatus {
    /// Every neighbor has confirmed every stored value.
    pub fn caught_up(&self) -> bool {
        self.checkpoints.iter().all(|(_, position)| *position == self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_display() {
        assert_eq!(NodeState::Created.to_string(), "Created");
        assert_eq!(NodeState::Initialized.to_string(), "Initialized");
        assert_eq!(NodeState::Running.to_string(), "Running");
        assert_eq!(NodeState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(NodeState::Stopped.to_string(), "Stopped");
    }

    #[test]
    fn test_node_state_codes_are_ordered() {
        let states = [
            NodeState::Created,
            NodeState::Initialized,
            NodeState::Running,
            NodeState::ShuttingDown,
            NodeState::Stopped,
        ];
        let codes: Vec<u8> = states.iter().map(|s| s.code()).collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_caught_up() {
        let mut status = NodeStatus {
            state: NodeState::Running,
            node_id: Some("n0".into()),
            values: 3,
            neighbors: vec!["n1".into(), "n2".into()],
            checkpoints: vec![("n1".into(), 3), ("n2".into(), 1)],
            deliveries_in_flight: 0,
            delivery_counts: DeliveryCounts::default(),
            batched_values: 0,
        };
        assert!(!status.caught_up());
        status.checkpoints[1].1 = 3;
        assert!(status.caught_up());
    }
}
