//! Error types for the dynamic batch scheduler.
//!
//! Library code returns the structured [`ScheduleError`]; application code
//! is free to wrap it in `anyhow` with added context.

use thiserror::Error;

use crate::request::InferenceRequest;

/// Errors surfaced by the scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// The scheduler is stopping and no longer accepts requests.
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),

    /// A priority level's queue is full and its policy rejects overflow.
    #[error("queue for priority level {level} is full (max: {max})")]
    Overflow { level: u32, max: usize },

    /// The request's queue timeout elapsed before it could be scheduled.
    #[error("request timeout expired")]
    TimeoutExpired,

    /// A scheduler invariant was broken.
    #[error("internal scheduler error: {0}")]
    Internal(String),
}

impl ScheduleError {
    /// Create an `Unavailable` error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create an `Internal` error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, ScheduleError>;

/// A request the scheduler refused to accept.
///
/// Returned by [`DynamicBatchScheduler::enqueue`](crate::DynamicBatchScheduler::enqueue)
/// so the caller keeps ownership of the request and can respond to the client
/// or retry elsewhere.
#[derive(Debug)]
pub struct RejectedRequest {
    /// The request, handed back untouched
    pub request: InferenceRequest,
    /// Why it was rejected
    pub error: ScheduleError,
}

impl std::fmt::Display for RejectedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "request '{}' rejected: {}", self.request.id, self.error)
    }
}

impl std::error::Error for RejectedRequest {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
