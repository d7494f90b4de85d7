//! Global atomic counters for a reproduction run.
//!
//! Counters are incremented at the call site. Call [`Metrics::flush`] at
//! the end of a run to emit all values as one `info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    installations_churned: AtomicU64,
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
    deliveries: AtomicU64,
    delivery_timeouts: AtomicU64,
    client_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            installations_churned: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            delivery_timeouts: AtomicU64::new(0),
            client_errors: AtomicU64::new(0),
        }
    }

    pub fn inc_installations_churned(&self) {
        self.installations_churned.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "installations_churned", "counter incremented");
    }

    pub fn inc_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "messages_sent", "counter incremented");
    }

    pub fn inc_send_failures(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "send_failures", "counter incremented");
    }

    pub fn inc_deliveries(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deliveries", "counter incremented");
    }

    pub fn inc_delivery_timeouts(&self) {
        self.delivery_timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "delivery_timeouts", "counter incremented");
    }

    pub fn inc_client_errors(&self) {
        self.client_errors.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "client_errors", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            installations_churned = self.installations_churned(),
            messages_sent = self.messages_sent(),
            send_failures = self.send_failures(),
            deliveries = self.deliveries(),
            delivery_timeouts = self.delivery_timeouts(),
            client_errors = self.client_errors(),
        );
    }

    pub fn installations_churned(&self) -> u64 {
        self.installations_churned.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }

    pub fn delivery_timeouts(&self) -> u64 {
        self.delivery_timeouts.load(Ordering::Relaxed)
    }

    pub fn client_errors(&self) -> u64 {
        self.client_errors.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.installations_churned.store(0, Ordering::Relaxed);
        self.messages_sent.store(0, Ordering::Relaxed);
        self.send_failures.store(0, Ordering::Relaxed);
        self.deliveries.store(0, Ordering::Relaxed);
        self.delivery_timeouts.store(0, Ordering::Relaxed);
        self.client_errors.store(0, Ordering::Relaxed);
    }
}
