//! Per-priority-level queue policies.

use std::time::Duration;

/// What to do when a priority level's queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowAction {
    /// Fail the new enqueue with an overflow error
    #[default]
    Reject,
    /// Evict and reject the oldest queued entry to admit the newcomer
    Delay,
}

/// Policy applied to one priority level of the scheduler queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePolicy {
    /// Maximum queued requests for the level; 0 means unbounded
    pub max_queue_size: usize,

    /// Queue timeout applied to requests that don't carry their own
    pub default_timeout: Option<Duration>,

    /// Behavior when the level is full
    pub overflow_action: OverflowAction,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_queue_size: 0,
            default_timeout: None,
            overflow_action: OverflowAction::Reject,
        }
    }
}

impl QueuePolicy {
    /// Bounded queue that rejects overflow
    pub fn rejecting(max_queue_size: usize) -> Self {
        Self {
            max_queue_size,
            default_timeout: None,
            overflow_action: OverflowAction::Reject,
        }
    }

    /// Bounded queue that evicts the oldest entry on overflow
    pub fn delaying(max_queue_size: usize) -> Self {
        Self {
            max_queue_size,
            default_timeout: None,
            overflow_action: OverflowAction::Delay,
        }
    }

    /// Set the default per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}
