// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Overlay topology: who gossips with whom.
//!
//! The neighbor relation is installed once per session and never changes.
//! Two construction modes exist:
//!
//! - **Explicit**: the adjacency map delivered by the `topology` message is
//!   used verbatim (self entries dropped).
//! - **Tree**: a balanced m-ary tree laid over the members sorted by rank.
//!
//! # Tree Layout
//!
//! Members are sorted by rank and stored in an array. Position `i` has parent
//! `(i - 1) / m` and children `m·i + 1 ..= m·i + m` (those that exist). With
//! five members and `m = 2`:
//!
//! ```text
//!            n0
//!          /    \
//!        n1      n2
//!       /  \
//!     n3    n4
//! ```
//!
//! A node's neighbors are its parent plus its children. Every node computes
//! the same tree from the same member list without talking to anyone, since
//! the layout depends only on rank order and cluster size.

use crate::config::TopologyMode;
use crate::error::{BroadcastError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Identifier of a cluster member, e.g. `"n3"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 0-based rank encoded in the trailing digits (`"n12"` → 12).
    pub fn rank(&self) -> Option<usize> {
        let digits_at = self
            .0
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit())
            .last()
            .map(|(i, _)| i)?;
        self.0[digits_at..].parse().ok()
    }

    /// Sort key giving the total rank order: ranked ids by rank, then
    /// anything unranked by its string.
    fn rank_key(&self) -> (bool, usize, &str) {
        match self.rank() {
            Some(rank) => (false, rank, self.as_str()),
            None => (true, 0, self.as_str()),
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Sort members into rank order and drop duplicates.
pub fn rank_order(ids: &[NodeId]) -> Vec<NodeId> {
    let mut sorted: Vec<NodeId> = ids.to_vec();
    sorted.sort_by(|a, b| a.rank_key().cmp(&b.rank_key()));
    sorted.dedup();
    sorted
}

// =============================================================================
// Tree overlay
// =============================================================================

/// One slot of the tree overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayNode {
    pub id: NodeId,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// Balanced m-ary tree over rank-ordered members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeOverlay {
    nodes: Vec<OverlayNode>,
    branching_factor: usize,
}

impl TreeOverlay {
    /// Build the overlay. Pure: same members and `m` give the same tree.
    pub fn build(members: &[NodeId], branching_factor: usize) -> Result<Self> {
        if branching_factor == 0 {
            return Err(BroadcastError::Topology(
                "branching factor must be at least 1".to_string(),
            ));
        }
        let ranked = rank_order(members);
        let n = ranked.len();
        let m = branching_factor;

        let nodes = ranked
            .into_iter()
            .enumerate()
            .map(|(i, id)| {
                let parent = if i == 0 { None } else { Some((i - 1) / m) };
                let first = i.saturating_mul(m).saturating_add(1);
                let last = i.saturating_mul(m).saturating_add(m).min(n.saturating_sub(1));
                let children = if first < n { (first..=last).collect() } else { Vec::new() };
                OverlayNode { id, parent, children }
            })
            .collect();

        Ok(Self {
            nodes,
            branching_factor: m,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn branching_factor(&self) -> usize {
        self.branching_factor
    }

    pub fn nodes(&self) -> &[OverlayNode] {
        &self.nodes
    }

    pub fn root(&self) -> Option<&NodeId> {
        self.nodes.first().map(|n| &n.id)
    }

    pub fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.id == id)
    }

    /// Number of edges between the root and position `index`.
    pub fn depth_of(&self, index: usize) -> usize {
        let mut depth = 0;
        let mut cursor = self.nodes.get(index).and_then(|n| n.parent);
        while let Some(parent) = cursor {
            depth += 1;
            cursor = self.nodes[parent].parent;
        }
        depth
    }

    /// Depth of the deepest leaf.
    pub fn height(&self) -> usize {
        self.nodes.len().checked_sub(1).map_or(0, |last| self.depth_of(last))
    }

    /// Parent plus children of `id`; empty if `id` is not a member.
    pub fn neighbors(&self, id: &NodeId) -> BTreeSet<NodeId> {
        let Some(index) = self.position(id) else {
            return BTreeSet::new();
        };
        let node = &self.nodes[index];
        node.parent
            .into_iter()
            .chain(node.children.iter().copied())
            .map(|i| self.nodes[i].id.clone())
            .collect()
    }

    /// Neighbor sets for every member.
    pub fn adjacency(&self) -> BTreeMap<NodeId, BTreeSet<NodeId>> {
        self.nodes
            .iter()
            .map(|n| (n.id.clone(), self.neighbors(&n.id)))
            .collect()
    }
}

// =============================================================================
// Installed topology
// =============================================================================

/// The neighbor relation as seen by one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    self_id: NodeId,
    mode: TopologyMode,
    adjacency: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl Topology {
    /// Install an explicit adjacency map as-is, minus self loops.
    pub fn explicit(self_id: NodeId, map: &HashMap<NodeId, Vec<NodeId>>) -> Self {
        let adjacency = map
            .iter()
            .map(|(node, peers)| {
                let set = peers.iter().filter(|p| *p != node).cloned().collect();
                (node.clone(), set)
            })
            .collect();
        Self {
            self_id,
            mode: TopologyMode::Explicit,
            adjacency,
        }
    }

    /// Derive the tree overlay from the member list.
    pub fn tree(self_id: NodeId, members: &[NodeId], branching_factor: usize) -> Result<Self> {
        let overlay = TreeOverlay::build(members, branching_factor)?;
        if !overlay.is_empty() && overlay.position(&self_id).is_none() {
            return Err(BroadcastError::Topology(format!(
                "{} is not among the {} members",
                self_id,
                overlay.len()
            )));
        }
        Ok(Self {
            self_id,
            mode: TopologyMode::Tree,
            adjacency: overlay.adjacency(),
        })
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn mode(&self) -> TopologyMode {
        self.mode
    }

    /// Neighbors of any member; empty for unknown ids and singletons.
    pub fn neighbors(&self, id: &NodeId) -> BTreeSet<NodeId> {
        self.adjacency.get(id).cloned().unwrap_or_default()
    }

    /// This node's own neighbors, i.e. its gossip peers.
    pub fn peers(&self) -> BTreeSet<NodeId> {
        self.neighbors(&self.self_id)
    }
}

/// Builds a [`Topology`] from the install inputs according to the configured mode.
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    mode: TopologyMode,
    branching_factor: usize,
}

impl TopologyBuilder {
    pub fn new(mode: TopologyMode, branching_factor: usize) -> Self {
        Self {
            mode,
            branching_factor,
        }
    }

    /// Build the topology for `self_id`.
    ///
    /// `members` is the full member list from `init`. In tree mode an empty
    /// member list falls back to every id mentioned in `adjacency`.
    pub fn build(
        &self,
        self_id: &NodeId,
        members: &[NodeId],
        adjacency: &HashMap<NodeId, Vec<NodeId>>,
    ) -> Result<Topology> {
        match self.mode {
            TopologyMode::Explicit => Ok(Topology::explicit(self_id.clone(), adjacency)),
            TopologyMode::Tree => {
                let members: Vec<NodeId> = if members.is_empty() {
                    adjacency
                        .iter()
                        .flat_map(|(k, vs)| std::iter::once(k).chain(vs.iter()))
                        .cloned()
                        .collect()
                } else {
                    members.to_vec()
                };
                Topology::tree(self_id.clone(), &members, self.branching_factor)
            }
        }
    }
}
