//! Self-test liveness probe
//!
//! Synthetic messages on the execution queue prove the consumer is alive
//! end to end. Health checks read the counter and last-seen time.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
pub struct Liveness {
    count: AtomicU64,
    /// Unix millis of the last probe, 0 = never
    last_seen_ms: AtomicI64,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beat(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        match self.last_seen_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }
}
