// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the broadcast engine.
//!
//! Errors are categorized by where they come from (the peer transport, the
//! wire protocol, local configuration) and carry enough context to log
//! something useful.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Wire code | Description |
//! |------------|-----------|-----------|-------------|
//! | `Transport` | Yes | 14 | Peer unreachable, channel closed |
//! | `Timeout` | Yes | 0 | A single delivery attempt ran out of time |
//! | `Remote` | Depends | (peer's) | The peer answered with an `error` body |
//! | `MalformedRequest` | No | 12 | Missing field or wrong shape |
//! | `NotSupported` | No | 10 | Unknown request type |
//! | `Topology` | No | 13 | Overlay could not be built from the input |
//! | `Config` | No | 13 | Configuration invalid |
//! | `InvalidState` | No | 11 | Node lifecycle violation |
//! | `Shutdown` | No | 11 | Node is shutting down |
//! | `Json` / `Io` | No | 13 | Codec or stdio failure |
//! | `Internal` | No | 13 | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`BroadcastError::is_retryable()`] tells the propagation retry loop
//! whether another attempt can possibly succeed. Anti-entropy never retries
//! inside a tick; the unacknowledged delta is simply still outstanding on the
//! next one.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for broadcast operations.
pub type Result<T> = std::result::Result<T, BroadcastError>;

/// Wire error codes understood by the cluster harness.
pub mod codes {
    pub const TIMEOUT: u32 = 0;
    pub const NOT_SUPPORTED: u32 = 10;
    pub const TEMPORARILY_UNAVAILABLE: u32 = 11;
    pub const MALFORMED_REQUEST: u32 = 12;
    pub const CRASH: u32 = 13;
    pub const ABORT: u32 = 14;
}

/// Errors that can occur while receiving, storing, or spreading values.
#[derive(Error, Debug)]
pub enum BroadcastError {
    /// The message could not be handed to the peer.
    #[error("Transport error ({peer_id}): {message}")]
    Transport { peer_id: String, message: String },

    /// A delivery attempt got no reply within its timeout.
    #[error("Timed out after {after:?} waiting for {peer_id}")]
    Timeout { peer_id: String, after: Duration },

    /// The peer replied with an `error` body.
    #[error("Remote error {code}: {text}")]
    Remote { code: u32, text: String },

    /// A request body had a missing field or the wrong shape.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// A request type this node does not handle.
    #[error("Unsupported request type: {0}")]
    NotSupported(String),

    /// The overlay could not be derived from the installed membership.
    #[error("Topology error: {0}")]
    Topology(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// JSON encode/decode failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stdio failure in the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BroadcastError {
    /// Shorthand for a transport failure towards `peer_id`.
    pub fn transport(peer_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            peer_id: peer_id.into(),
            message: message.into(),
        }
    }

    /// Check if another attempt at the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Timeout { .. } => true,
            Self::Remote { code, .. } => matches!(
                *code,
                codes::TIMEOUT | codes::TEMPORARILY_UNAVAILABLE | codes::CRASH | codes::ABORT
            ),
            Self::MalformedRequest(_) => false,
            Self::NotSupported(_) => false,
            Self::Topology(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Json(_) => false,
            Self::Io(_) => false,
            Self::Internal(_) => false,
        }
    }

    /// Wire error code to send back to a requester.
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Transport { .. } => codes::ABORT,
            Self::Timeout { .. } => codes::TIMEOUT,
            Self::Remote { code, .. } => *code,
            Self::MalformedRequest(_) => codes::MALFORMED_REQUEST,
            Self::NotSupported(_) => codes::NOT_SUPPORTED,
            Self::InvalidState { .. } | Self::Shutdown => codes::TEMPORARILY_UNAVAILABLE,
            Self::Topology(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::Io(_)
            | Self::Internal(_) => codes::CRASH,
        }
    }
}
