//! Metric names and descriptions
//!
//! Components record through the `metrics` macros directly. Installing a
//! recorder is up to the binary; without one every call is a no-op.

use metrics::{describe_counter, describe_gauge, describe_histogram, histogram};
use std::time::Instant;

/// Describe every metric the crate records
pub fn init_metrics() {
    // Signaling
    describe_counter!("signal.reconnects", "Signaling reconnect attempts");
    describe_counter!("signal.requests.timed_out", "Signaling requests without a reply in time");

    // Swarm
    describe_counter!("swarm.connections.attempted", "Connection attempts started");
    describe_counter!("swarm.connections.established", "Connections established");
    describe_counter!("swarm.connections.failed", "Connection attempts that failed");
    describe_gauge!("swarm.connections.open", "Connections currently open");
    describe_counter!("swarm.peers.unreachable", "Peers that used up their retry budget");
    describe_histogram!("swarm.connect.duration_ms", "Time to establish a connection in milliseconds");
    describe_counter!("presence.timeouts", "Connections closed after the peer went silent");

    // Replication
    describe_gauge!("replication.sessions.active", "Replication sessions running");
    describe_counter!("replication.sessions.restarted", "Replication channels reopened on a live connection");
    describe_histogram!("replication.handshake.duration_ms", "Replication handshake duration in milliseconds");
    describe_counter!("replication.messages.sent", "Feed entries sent to peers");
    describe_counter!("replication.messages.received", "Feed entries received from peers");
    describe_counter!("replication.messages.replicated", "Feed entries stored");
    describe_counter!("replication.messages.duplicate", "Feed entries received again");
    describe_counter!("replication.messages.applied", "Data entries handed to the reconciler");
    describe_counter!("replication.messages.unauthorized", "Data entries retained without write rights");
    describe_counter!("replication.messages.malformed", "Feed entries that are not envelopes");
    describe_counter!("replication.credentials.applied", "Credentials accepted into the chain");
    describe_counter!("replication.credentials.rejected", "Credentials rejected by the chain");
    describe_counter!("replication.feeds.corrupted", "Feeds marked corrupt after a fork");
    describe_counter!("replication.gaps.requested", "Gap re-requests raised");
}

/// Records its lifetime into a histogram when stopped
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    pub fn stop(self) {
        let duration = self.start.elapsed();
        histogram!(self.name).record(duration.as_secs_f64() * 1000.0);
    }
}
