//! Configuration for the dynamic batch scheduler.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::queue::QueuePolicy;

/// Configuration for one scheduler instance (one model).
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// When false, every request is dispatched alone without queueing
    pub dynamic_batching_enabled: bool,

    /// Hard upper bound on a batch's total declared size (at least 1)
    pub max_batch_size: u32,

    /// Batch sizes the backend executes most efficiently; sealing at one of
    /// these is favored over waiting further
    pub preferred_batch_sizes: BTreeSet<u32>,

    /// Longest a request may wait in queue to improve batching.
    /// Zero means no delay is ever allowed.
    pub max_queue_delay: Duration,

    /// Deliver responses in the order requests were accepted
    pub preserve_ordering: bool,

    /// Consult and fill the response cache (requires a cache to be attached)
    pub response_cache_enabled: bool,

    /// Input tensors whose shapes must match across a batch (name -> enforced)
    pub enforce_equal_shape_tensors: HashMap<String, bool>,

    /// The model declares optional inputs; batches must then agree on which
    /// inputs are present
    pub has_optional_input: bool,

    /// Number of priority levels; level 0 is the most urgent
    pub priority_levels: u32,

    /// Policy for levels without an explicit override
    pub default_queue_policy: QueuePolicy,

    /// Per-level policy overrides
    pub queue_policies: HashMap<u32, QueuePolicy>,

    /// Nice value applied to the batcher thread on Linux
    pub nice: i32,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            dynamic_batching_enabled: true,
            max_batch_size: 8,
            preferred_batch_sizes: BTreeSet::new(),
            max_queue_delay: Duration::ZERO,
            preserve_ordering: false,
            response_cache_enabled: false,
            enforce_equal_shape_tensors: HashMap::new(),
            has_optional_input: false,
            priority_levels: 1,
            default_queue_policy: QueuePolicy::default(),
            queue_policies: HashMap::new(),
            nice: 0,
        }
    }
}

impl BatcherConfig {
    /// Config optimized for low latency: small batches, no queueing delay
    pub fn low_latency() -> Self {
        Self {
            max_batch_size: 4,
            preferred_batch_sizes: BTreeSet::from([1, 2, 4]),
            max_queue_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Config optimized for throughput: larger batches, a modest delay to
    /// let them fill
    pub fn high_throughput() -> Self {
        Self {
            max_batch_size: 32,
            preferred_batch_sizes: BTreeSet::from([8, 16, 32]),
            max_queue_delay: Duration::from_millis(5),
            ..Self::default()
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("DYNBATCH_MAX_BATCH_SIZE") {
            if let Ok(n) = val.parse() {
                config.max_batch_size = n;
            }
        }

        if let Ok(val) = std::env::var("DYNBATCH_PREFERRED_BATCH_SIZES") {
            config.preferred_batch_sizes =
                val.split(',').filter_map(|s| s.trim().parse().ok()).collect();
        }

        if let Ok(val) = std::env::var("DYNBATCH_MAX_QUEUE_DELAY_US") {
            if let Ok(n) = val.parse() {
                config.max_queue_delay = Duration::from_micros(n);
            }
        }

        if let Ok(val) = std::env::var("DYNBATCH_PRESERVE_ORDERING") {
            config.preserve_ordering = val == "1" || val.to_lowercase() == "true";
        }

        if let Ok(val) = std::env::var("DYNBATCH_PRIORITY_LEVELS") {
            if let Ok(n) = val.parse() {
                config.priority_levels = n;
            }
        }

        config
    }

    /// Largest preferred batch size, 0 when none are configured
    pub(crate) fn max_preferred_batch_size(&self) -> u64 {
        self.preferred_batch_sizes
            .iter()
            .next_back()
            .copied()
            .map(u64::from)
            .unwrap_or(0)
    }

    /// Max queue delay in nanoseconds, the unit batch formation works in
    pub(crate) fn max_queue_delay_ns(&self) -> u64 {
        self.max_queue_delay.as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BatcherConfig::default();
        assert!(config.dynamic_batching_enabled);
        assert_eq!(config.max_batch_size, 8);
        assert!(config.preferred_batch_sizes.is_empty());
        assert_eq!(config.max_preferred_batch_size(), 0);
        assert_eq!(config.max_queue_delay_ns(), 0);
    }

    #[test]
    fn test_high_throughput_config() {
        let config = BatcherConfig::high_throughput();
        assert_eq!(config.max_batch_size, 32);
        assert_eq!(config.max_preferred_batch_size(), 32);
        assert!(config.max_queue_delay_ns() > 0);
    }

    #[test]
    fn test_max_preferred_batch_size_picks_largest() {
        let mut config = BatcherConfig::default();
        config.preferred_batch_sizes = BTreeSet::from([4, 8, 2]);
        assert_eq!(config.max_preferred_batch_size(), 8);
    }
}
