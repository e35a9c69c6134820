//! Process-wide metrics registry.
//!
//! Gauges and counters live for the whole process; tests reset them between
//! runs with [`reset`].

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge, Registry};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static MEMPOOL_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "mempool_unsorted_tx",
        "Number of transactions in the memory pool",
    )
    .expect("metric definition");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric registration");
    gauge
});

pub static MEMPOOL_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "mempool_evictions_total",
        "Transactions evicted from the memory pool under capacity pressure",
    )
    .expect("metric definition");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registration");
    counter
});

/// Called on every mempool mutation.
pub fn update_mempool_size(count: usize) {
    MEMPOOL_SIZE.set(count as i64);
}

pub fn record_eviction() {
    MEMPOOL_EVICTIONS_TOTAL.inc();
}

/// Clears process-wide state between test runs.
pub fn reset() {
    MEMPOOL_SIZE.set(0);
    MEMPOOL_EVICTIONS_TOTAL.reset();
}
