//! Metrics collection for Quiver client

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Client metrics collector, one instance per `Client`
#[derive(Debug, Default)]
pub struct ClientMetrics {
    // Producer metrics
    pub messages_sent: AtomicU64,
    pub messages_acknowledged: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub messages_resent: AtomicU64,
    pub ack_latency_sum: AtomicU64,
    pub ack_latency_count: AtomicU64,

    // Connection metrics
    pub connections_created: AtomicU64,
    pub connections_failed: AtomicU64,
    pub reconnections: AtomicU64,

    // Lookup metrics
    pub lookup_requests: AtomicU64,
    pub lookup_cache_hits: AtomicU64,
}

impl ClientMetrics {
    /// Record a flushed batch
    pub fn record_batch(&self, message_count: u64, byte_count: u64) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.messages_sent.fetch_add(message_count, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record an acknowledged message and its submit-to-ack latency
    pub fn record_ack(&self, latency: Duration) {
        self.messages_acknowledged.fetch_add(1, Ordering::Relaxed);
        self.ack_latency_sum
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.ack_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message that failed permanently
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resend(&self, message_count: u64) {
        self.messages_resent
            .fetch_add(message_count, Ordering::Relaxed);
    }

    /// Record a successful connection
    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed connection
    pub fn record_connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup(&self) {
        self.lookup_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup_cache_hit(&self) {
        self.lookup_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Get average acknowledgment latency in microseconds
    pub fn average_ack_latency_us(&self) -> f64 {
        let sum = self.ack_latency_sum.load(Ordering::Relaxed);
        let count = self.ack_latency_count.load(Ordering::Relaxed);

        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_acknowledged: self.messages_acknowledged.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            messages_resent: self.messages_resent.load(Ordering::Relaxed),
            average_ack_latency_us: self.average_ack_latency_us(),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            lookup_requests: self.lookup_requests.load(Ordering::Relaxed),
            lookup_cache_hits: self.lookup_cache_hits.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_acknowledged: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub batches_flushed: u64,
    pub messages_resent: u64,
    pub average_ack_latency_us: f64,
    pub connections_created: u64,
    pub connections_failed: u64,
    pub reconnections: u64,
    pub lookup_requests: u64,
    pub lookup_cache_hits: u64,
}
