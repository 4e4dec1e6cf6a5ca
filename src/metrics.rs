//! Metrics for observability.
//!
//! Records through the `metrics` facade. No exporter is installed by the
//! library; whoever embeds the node decides where the numbers go.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `broadcast_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use broadcast_engine::metrics;
//! use std::time::Duration;
//!
//! // After a dedup-insert
//! metrics::record_values_received("client", 1, 0);
//!
//! // After an anti-entropy push was acknowledged
//! metrics::record_anti_entropy_push("n2", 17, true, Duration::from_millis(3));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Store
// =============================================================================

/// Record values arriving at this node, split into new and duplicate.
pub fn record_values_received(source: &str, fresh: usize, duplicate: usize) {
    counter!("broadcast_values_received_total", "source" => source.to_string(), "kind" => "new")
        .increment(fresh as u64);
    counter!("broadcast_values_received_total", "source" => source.to_string(), "kind" => "duplicate")
        .increment(duplicate as u64);
}

/// Record the number of distinct values stored.
pub fn set_store_size(size: usize) {
    gauge!("broadcast_store_values").set(size as f64);
}

/// Record a read served.
pub fn record_read(values: usize) {
    counter!("broadcast_reads_total").increment(1);
    histogram!("broadcast_read_values").record(values as f64);
}

// =============================================================================
// Propagation
// =============================================================================

/// Record one delivery attempt towards a neighbor.
pub fn record_delivery_attempt(peer_id: &str, outcome: &str) {
    counter!("broadcast_delivery_attempts_total", "peer_id" => peer_id.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record a delivery that finally succeeded, with how many attempts it took.
pub fn record_delivery_success(peer_id: &str, attempts: u32, elapsed: Duration) {
    counter!("broadcast_deliveries_total", "peer_id" => peer_id.to_string(), "status" => "delivered").increment(1);
    histogram!("broadcast_delivery_attempts", "peer_id" => peer_id.to_string()).record(attempts as f64);
    histogram!("broadcast_delivery_seconds", "peer_id" => peer_id.to_string()).record(elapsed.as_secs_f64());
}

/// Record a delivery that ran out of attempts.
pub fn record_delivery_exhausted(peer_id: &str) {
    counter!("broadcast_deliveries_total", "peer_id" => peer_id.to_string(), "status" => "exhausted").increment(1);
}

/// Record a delivery abandoned because the node is shutting down.
pub fn record_delivery_cancelled(peer_id: &str) {
    counter!("broadcast_deliveries_total", "peer_id" => peer_id.to_string(), "status" => "cancelled").increment(1);
}

/// Record the number of live propagation tasks.
pub fn set_propagation_in_flight(count: usize) {
    gauge!("broadcast_propagation_in_flight").set(count as f64);
}

// =============================================================================
// Batching
// =============================================================================

/// Record values queued for a peer.
pub fn record_batch_enqueued(peer_id: &str, count: usize) {
    counter!("broadcast_batch_enqueued_total", "peer_id" => peer_id.to_string()).increment(count as u64);
}

/// Record a drain of the aggregator.
pub fn record_batch_drain(peers: usize, values: usize) {
    counter!("broadcast_batch_drains_total").increment(1);
    histogram!("broadcast_batch_drain_peers").record(peers as f64);
    histogram!("broadcast_batch_drain_values").record(values as f64);
}

// =============================================================================
// Anti-entropy
// =============================================================================

/// Record an anti-entropy tick.
pub fn record_anti_entropy_tick(peers_pushed: usize, peers_skipped: usize, duration: Duration) {
    counter!("broadcast_anti_entropy_ticks_total").increment(1);
    counter!("broadcast_anti_entropy_peers_total", "result" => "pushed").increment(peers_pushed as u64);
    counter!("broadcast_anti_entropy_peers_total", "result" => "skipped").increment(peers_skipped as u64);
    histogram!("broadcast_anti_entropy_tick_seconds").record(duration.as_secs_f64());
}

/// Record one per-peer anti-entropy push.
pub fn record_anti_entropy_push(peer_id: &str, values: usize, success: bool, latency: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("broadcast_anti_entropy_pushes_total", "peer_id" => peer_id.to_string(), "status" => status)
        .increment(1);
    if success {
        counter!("broadcast_anti_entropy_values_total", "peer_id" => peer_id.to_string())
            .increment(values as u64);
    }
    histogram!("broadcast_anti_entropy_push_seconds", "peer_id" => peer_id.to_string())
        .record(latency.as_secs_f64());
}

/// Record a peer's checkpoint position.
pub fn set_checkpoint(peer_id: &str, position: usize) {
    gauge!("broadcast_checkpoint_position", "peer_id" => peer_id.to_string()).set(position as f64);
}

// =============================================================================
// Node
// =============================================================================

/// Record the node lifecycle state (0 = created .. 4 = stopped).
pub fn set_node_state(state: &str, code: u8) {
    gauge!("broadcast_node_state", "state" => state.to_string()).set(code as f64);
}

/// Record an inbound request by type and outcome.
pub fn record_request(kind: &str, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    counter!("broadcast_requests_total", "type" => kind.to_string(), "status" => status).increment(1);
}

/// Record the size of the installed neighbor set.
pub fn set_neighbor_count(count: usize) {
    gauge!("broadcast_neighbors").set(count as f64);
}
