//! Transport counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of transport metrics at a point in time.
pub struct MetricsSnapshot {
    /// Broadcast calls started.
    pub broadcasts_total: u64,
    /// Member deliveries that completed.
    pub messages_sent: u64,
    /// Member deliveries that failed permanently.
    pub messages_failed: u64,
    /// Payload bytes handed to sockets, envelopes included.
    pub bytes_sent: u64,
    /// ACKs received.
    pub acks_received: u64,
    /// FAIL_ACKs received.
    pub fail_acks_received: u64,
    /// Reconnect-and-resend attempts.
    pub retries_total: u64,
    /// Members reported as timed out.
    pub timeouts_total: u64,
    /// Connections opened.
    pub connections_opened: u64,
    /// Connections closed.
    pub connections_closed: u64,
    /// Successful pool acquisitions.
    pub pool_acquired: u64,
    /// Acquisitions that gave up waiting.
    pub pool_exhausted: u64,
    /// Senders discarded on release.
    pub pool_discarded: u64,
}

/// Thread-safe transport metrics collector.
#[derive(Default)]
pub struct TransportMetrics {
    broadcasts_total: AtomicU64,
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
    bytes_sent: AtomicU64,
    acks_received: AtomicU64,
    fail_acks_received: AtomicU64,
    retries_total: AtomicU64,
    timeouts_total: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    pool_acquired: AtomicU64,
    pool_exhausted: AtomicU64,
    pool_discarded: AtomicU64,
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TransportMetrics {
    /// Creates a collector with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the broadcast counter.
    pub fn inc_broadcasts(&self) {
        self.broadcasts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the delivered counter.
    pub fn inc_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the failed delivery counter.
    pub fn inc_messages_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to the bytes sent counter.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Increments the ACK counter.
    pub fn inc_acks_received(&self) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the FAIL_ACK counter.
    pub fn inc_fail_acks_received(&self) {
        self.fail_acks_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the retry counter.
    pub fn inc_retries(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the timeout counter.
    pub fn inc_timeouts(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the opened connection counter.
    pub fn inc_connections_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the closed connection counter.
    pub fn inc_connections_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the pool acquisition counter.
    pub fn inc_pool_acquired(&self) {
        self.pool_acquired.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the pool exhaustion counter.
    pub fn inc_pool_exhausted(&self) {
        self.pool_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the discarded sender counter.
    pub fn inc_pool_discarded(&self) {
        self.pool_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            broadcasts_total: self.broadcasts_total.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            fail_acks_received: self.fail_acks_received.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            pool_acquired: self.pool_acquired.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            pool_discarded: self.pool_discarded.load(Ordering::Relaxed),
        }
    }
}
