//! Metric names for the directory.
//!
//! All metric name constants live here. Call sites use these constants rather
//! than raw strings. Nothing is exported unless the embedding binary installs
//! a `metrics` recorder; without one every call is a no-op.

use metrics::{counter, gauge};

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

/// Total accepted transport connections.
pub const CONNECTIONS_ACCEPTED: &str = "jm_directory_connections_accepted_total";
/// Currently open transport connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "jm_directory_connections_active";
/// Handshakes answered with `accepted: true`.
pub const HANDSHAKES_ACCEPTED: &str = "jm_directory_handshakes_accepted_total";
/// Handshakes answered with `accepted: false`.
pub const HANDSHAKES_REJECTED: &str = "jm_directory_handshakes_rejected_total";
/// Currently registered peers (gauge).
pub const PEERS_REGISTERED: &str = "jm_directory_peers_registered";

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Envelopes decoded from peers.
pub const MESSAGES_RECEIVED: &str = "jm_directory_messages_received_total";
/// Envelopes queued to peers on behalf of other peers. Direct replies
/// (DN_HANDSHAKE, PONG, PEERLIST) are not counted.
pub const MESSAGES_FORWARDED: &str = "jm_directory_messages_forwarded_total";
/// PRIVMSGs dropped because the recipient is unknown.
pub const ROUTING_FAILURES: &str = "jm_directory_routing_failures_total";

// ---------------------------------------------------------------------------
// Forced disconnects
// ---------------------------------------------------------------------------

/// Connections closed for a protocol violation or decode error.
pub const PROTOCOL_VIOLATIONS: &str = "jm_directory_protocol_violations_total";
/// Connections closed because their outbound queue was full.
pub const BACKPRESSURE_CLOSES: &str = "jm_directory_backpressure_closes_total";
/// Connections closed by the keepalive monitor.
pub const KEEPALIVE_TIMEOUTS: &str = "jm_directory_keepalive_timeouts_total";

pub(crate) fn incr(name: &'static str) {
    counter!(name).increment(1);
}

pub(crate) fn set_gauge(name: &'static str, value: usize) {
    gauge!(name).set(value as f64);
}

pub(crate) fn gauge_add(name: &'static str, delta: f64) {
    gauge!(name).increment(delta);
}
