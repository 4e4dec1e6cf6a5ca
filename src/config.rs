//! Configuration for the broadcast engine.
//!
//! Configuration is passed to [`BroadcastNode::new()`](crate::BroadcastNode::new)
//! and can be built programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use broadcast_engine::config::{BroadcastConfig, PropagationMode};
//!
//! let mut config = BroadcastConfig::default();
//! config.settings.propagation.mode = PropagationMode::Batched;
//! config.settings.anti_entropy.interval = "400ms".into();
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! BroadcastConfig
//! ├── log_level: String              # fallback when RUST_LOG is unset
//! └── settings: BroadcastSettings
//!     ├── propagation: PropagationConfig   # immediate fan-out + retries
//!     ├── anti_entropy: AntiEntropyConfig  # periodic repair loop
//!     └── topology: TopologyConfig         # overlay construction
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "log_level": "info",
//!   "settings": {
//!     "propagation": { "mode": "immediate", "rpc_timeout": "1s", "max_attempts": 100 },
//!     "anti_entropy": { "interval": "1s", "batching": true },
//!     "topology": { "mode": "tree", "branching_factor": 4 }
//!   }
//! }
//! ```

use crate::error::{BroadcastError, Result};
use crate::resilience::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `BroadcastNode::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Log filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Tunables for propagation, anti-entropy and topology.
    #[serde(default)]
    pub settings: BroadcastSettings,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            settings: BroadcastSettings::default(),
        }
    }
}

impl BroadcastConfig {
    /// Fast timers and small retry budgets for tests.
    pub fn for_testing() -> Self {
        Self {
            log_level: "debug".to_string(),
            settings: BroadcastSettings {
                propagation: PropagationConfig::for_testing(),
                anti_entropy: AntiEntropyConfig::for_testing(),
                topology: TopologyConfig::default(),
            },
        }
    }

    /// Load a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BroadcastError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| BroadcastError::Config(format!("invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.settings;
        if s.propagation.max_attempts == 0 {
            return Err(BroadcastError::Config(
                "propagation.max_attempts must be at least 1".to_string(),
            ));
        }
        if s.topology.branching_factor == 0 {
            return Err(BroadcastError::Config(
                "topology.branching_factor must be at least 1".to_string(),
            ));
        }
        if s.anti_entropy.interval_duration().is_zero() {
            return Err(BroadcastError::Config(
                "anti_entropy.interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings for the three moving parts of the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BroadcastSettings {
    #[serde(default)]
    pub propagation: PropagationConfig,
    #[serde(default)]
    pub anti_entropy: AntiEntropyConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
}

fn parse_or(raw: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(raw).unwrap_or(fallback)
}

fn default_true() -> bool {
    true
}

fn default_one_second() -> String {
    "1s".to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// PropagationConfig: fan-out of newly seen values
// ═══════════════════════════════════════════════════════════════════════════════

/// How newly inserted values leave this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationMode {
    /// One RPC per neighbor per value, retried with backoff.
    #[default]
    Immediate,
    /// Queue per neighbor; sent with the next anti-entropy flush.
    Batched,
    /// Never forward; anti-entropy alone spreads values.
    Disabled,
}

/// Propagation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationConfig {
    #[serde(default)]
    pub mode: PropagationMode,

    /// Timeout of a single delivery attempt (e.g. "1s").
    #[serde(default = "default_one_second")]
    pub rpc_timeout: String,

    /// Total delivery attempts per neighbor before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff unit: attempt `i` waits `i` units before the next one.
    #[serde(default = "default_one_second")]
    pub backoff_unit: String,
}

fn default_max_attempts() -> u32 {
    100
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            mode: PropagationMode::Immediate,
            rpc_timeout: default_one_second(),
            max_attempts: default_max_attempts(),
            backoff_unit: default_one_second(),
        }
    }
}

impl PropagationConfig {
    pub fn for_testing() -> Self {
        Self {
            mode: PropagationMode::Immediate,
            rpc_timeout: "100ms".to_string(),
            max_attempts: 5,
            backoff_unit: "5ms".to_string(),
        }
    }

    pub fn rpc_timeout_duration(&self) -> Duration {
        parse_or(&self.rpc_timeout, Duration::from_secs(1))
    }

    pub fn backoff_unit_duration(&self) -> Duration {
        parse_or(&self.backoff_unit, Duration::from_secs(1))
    }

    /// Build the retry policy used by each per-neighbor delivery.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            attempt_timeout: self.rpc_timeout_duration(),
            backoff_unit: self.backoff_unit_duration(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AntiEntropyConfig: periodic checkpoint reconciliation
// ═══════════════════════════════════════════════════════════════════════════════

/// Anti-entropy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntiEntropyConfig {
    /// Whether the repair loop runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tick period (e.g. "400ms", "5s").
    #[serde(default = "default_one_second")]
    pub interval: String,

    /// Timeout of one per-peer push.
    #[serde(default = "default_one_second")]
    pub rpc_timeout: String,

    /// Route outstanding deltas through the batch aggregator.
    #[serde(default = "default_true")]
    pub batching: bool,
}

impl Default for AntiEntropyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_one_second(),
            rpc_timeout: default_one_second(),
            batching: true,
        }
    }
}

impl AntiEntropyConfig {
    pub fn for_testing() -> Self {
        Self {
            enabled: true,
            interval: "50ms".to_string(),
            rpc_timeout: "100ms".to_string(),
            batching: true,
        }
    }

    pub fn interval_duration(&self) -> Duration {
        parse_or(&self.interval, Duration::from_secs(1))
    }

    pub fn rpc_timeout_duration(&self) -> Duration {
        parse_or(&self.rpc_timeout, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TopologyConfig: overlay construction
// ═══════════════════════════════════════════════════════════════════════════════

/// Where the neighbor sets come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyMode {
    /// Use the adjacency map from the `topology` message verbatim.
    Explicit,
    /// Derive a balanced m-ary tree over the ranked member list.
    #[default]
    Tree,
}

/// Topology configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub mode: TopologyMode,

    /// Children per interior node in `tree` mode.
    #[serde(default = "default_branching_factor")]
    pub branching_factor: usize,
}

fn default_branching_factor() -> usize {
    4
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            mode: TopologyMode::Tree,
            branching_factor: default_branching_factor(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
