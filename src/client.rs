//! Peer client seam.
//!
//! The core never talks to the wire directly. Everything that leaves this
//! node for another node goes through [`PeerClient`], which the stdio
//! transport implements for real and the test harness implements with an
//! in-memory network.
//!
//! # Example
//!
//! ```rust,no_run
//! use broadcast_engine::client::{BoxFuture, PeerClient};
//! use broadcast_engine::protocol::BroadcastPayload;
//! use broadcast_engine::topology::NodeId;
//!
//! struct Loopback;
//!
//! impl PeerClient for Loopback {
//!     fn send_broadcast(&self, _dest: &NodeId, _payload: BroadcastPayload) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//! }
//! ```

use crate::error::Result;
use crate::protocol::BroadcastPayload;
use crate::topology::NodeId;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by [`PeerClient`] calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Outbound RPCs to other cluster members.
pub trait PeerClient: Send + Sync + 'static {
    /// Send a `broadcast` to `dest` and resolve once it answers `broadcast_ok`.
    ///
    /// An `error` reply resolves to [`BroadcastError::Remote`](crate::BroadcastError::Remote).
    /// The future may never resolve if the peer never answers; callers bound
    /// it with their own timeout.
    fn send_broadcast(&self, dest: &NodeId, payload: BroadcastPayload) -> BoxFuture<'_, ()>;
}

impl<C: PeerClient + ?Sized> PeerClient for Arc<C> {
    fn send_broadcast(&self, dest: &NodeId, payload: BroadcastPayload) -> BoxFuture<'_, ()> {
        (**self).send_broadcast(dest, payload)
    }
}
