//! Connection metrics: monotonic counters updated by the owning thread or
//! under the metrics lock, readable without synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    transactions_successful: AtomicU64,
    transactions_failed: AtomicU64,
    inbound_bytes: AtomicU64,
    outbound_bytes: AtomicU64,
    errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transactions_successful(&self) -> u64 {
        self.transactions_successful.load(Ordering::Relaxed)
    }

    pub fn transactions_failed(&self) -> u64 {
        self.transactions_failed.load(Ordering::Relaxed)
    }

    pub fn inbound_bytes(&self) -> u64 {
        self.inbound_bytes.load(Ordering::Relaxed)
    }

    pub fn outbound_bytes(&self) -> u64 {
        self.outbound_bytes.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Records a successful receive of `bytes` (on the receiver side of a
    /// transmit: the peer's `on_receive`).
    pub fn record_inbound_success(&self, bytes: u64) {
        self.transactions_successful.fetch_add(1, Ordering::Relaxed);
        self.inbound_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a successful send of `bytes` from the transmitter side.
    pub fn record_outbound_success(&self, bytes: u64) {
        self.transactions_successful.fetch_add(1, Ordering::Relaxed);
        self.outbound_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.transactions_failed.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}
