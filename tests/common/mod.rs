//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An in-memory cluster (`SimNetwork`) with fault injection
//! - Topology helpers (full mesh, line)
//! - Config presets tuned for fast tests

#![allow(dead_code)]

pub mod sim_network;

pub use sim_network::*;

use broadcast_engine::config::{BroadcastConfig, PropagationMode, TopologyMode};

/// Explicit topology, fast timers.
pub fn explicit_config() -> BroadcastConfig {
    let mut config = BroadcastConfig::for_testing();
    config.settings.topology.mode = TopologyMode::Explicit;
    config
}

/// Immediate propagation only: anti-entropy off, so any delivery seen is
/// propagation's doing.
pub fn propagation_only(mut config: BroadcastConfig) -> BroadcastConfig {
    config.settings.anti_entropy.enabled = false;
    config.settings.propagation.mode = PropagationMode::Immediate;
    config
}

/// Anti-entropy only, with a timer too slow to fire during a test so ticks
/// are driven by hand.
pub fn manual_anti_entropy(mut config: BroadcastConfig) -> BroadcastConfig {
    config.settings.propagation.mode = PropagationMode::Disabled;
    config.settings.anti_entropy.enabled = true;
    config.settings.anti_entropy.interval = "1h".to_string();
    config
}
