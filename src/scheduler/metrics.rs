//! Metrics for the dynamic batch scheduler.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for monitoring scheduler behavior
#[derive(Debug, Default)]
pub struct BatcherMetrics {
    /// Total requests received by `enqueue`
    pub requests_received: AtomicU64,

    /// Requests currently waiting in the queue
    pub requests_queued: AtomicU64,

    /// Requests handed to the rate limiter in batches
    pub requests_dispatched: AtomicU64,

    /// Requests rejected because their queue timeout expired
    pub requests_timed_out: AtomicU64,

    /// Requests rejected because a queue was full
    pub requests_rejected: AtomicU64,

    /// Batches handed to the rate limiter
    pub batches_dispatched: AtomicU64,

    /// Total declared batch size across dispatched batches
    pub total_batch_size: AtomicU64,

    /// Maximum queue depth observed
    pub max_queue_depth: AtomicU64,

    /// Requests answered from the response cache
    pub cache_hits: AtomicU64,

    /// Responses inserted into the cache after a miss
    pub cache_misses: AtomicU64,

    /// Total lookup time across cache hits, nanoseconds
    pub total_cache_hit_ns: AtomicU64,

    /// Total lookup + insert time across cache misses, nanoseconds
    pub total_cache_miss_ns: AtomicU64,
}

impl BatcherMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queued(&self) {
        let queued = self.requests_queued.fetch_add(1, Ordering::Relaxed) + 1;
        let mut current_max = self.max_queue_depth.load(Ordering::Relaxed);
        while queued > current_max {
            match self.max_queue_depth.compare_exchange_weak(
                current_max,
                queued,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_max = x,
            }
        }
    }

    pub(crate) fn record_batch(&self, requests: u64, batch_size: u64) {
        self.requests_queued.fetch_sub(requests, Ordering::Relaxed);
        self.requests_dispatched.fetch_add(requests, Ordering::Relaxed);
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        self.total_batch_size.fetch_add(batch_size, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.requests_queued.fetch_sub(1, Ordering::Relaxed);
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evicted(&self) {
        self.requests_queued.fetch_sub(1, Ordering::Relaxed);
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self, lookup_ns: u64) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.total_cache_hit_ns.fetch_add(lookup_ns, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self, miss_ns: u64) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.total_cache_miss_ns.fetch_add(miss_ns, Ordering::Relaxed);
    }

    /// Current queue depth
    pub fn queue_depth(&self) -> u64 {
        self.requests_queued.load(Ordering::Relaxed)
    }

    /// Average requests per dispatched batch
    pub fn avg_batch_size(&self) -> f64 {
        let batches = self.batches_dispatched.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        let total = self.total_batch_size.load(Ordering::Relaxed);
        total as f64 / batches as f64
    }

    /// Fraction of cache lookups that hit, in [0, 1]
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            return 0.0;
        }
        hits as f64 / (hits + misses) as f64
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            max_queue_depth: self.max_queue_depth.load(Ordering::Relaxed),
            avg_batch_size: self.avg_batch_size(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_hit_rate: self.cache_hit_rate(),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_received: u64,
    pub requests_queued: u64,
    pub requests_dispatched: u64,
    pub requests_timed_out: u64,
    pub requests_rejected: u64,
    pub batches_dispatched: u64,
    pub max_queue_depth: u64,
    pub avg_batch_size: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
}
