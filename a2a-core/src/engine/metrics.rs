//! Message metrics tracking

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Tracks message counters for an engine
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Total messages delivered to a handler
    messages_sent: AtomicU64,
    /// Total inbound messages accepted
    messages_received: AtomicU64,
    /// Inbound messages dropped by verification or expiry
    messages_dropped: AtomicU64,
    /// Sends that failed for good
    send_failures: AtomicU64,
    retries: AtomicU64,
    bytes_sent: AtomicU64,
    /// Sum of successful send latencies, in microseconds
    latency_micros: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize, latency: Duration) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.latency_micros
            .fetch_add(latency.as_micros().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let sent = self.messages_sent.load(Ordering::Relaxed);
        let latency = self.latency_micros.load(Ordering::Relaxed);
        MetricsSnapshot {
            messages_sent: sent,
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            average_latency: if sent == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(latency / sent)
            },
        }
    }
}

/// Engine statistics at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub send_failures: u64,
    pub retries: u64,
    pub bytes_sent: u64,
    pub average_latency: Duration,
}
