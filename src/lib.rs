//! # dynbatch
//!
//! Dynamic batch scheduler for model inference serving.
//!
//! Inference backends amortize per-call overhead across a batch, but clients
//! send requests one at a time. This crate queues requests briefly and
//! assembles them into batches the backend can execute as a single call,
//! without blowing per-request latency budgets.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Client threads                       │
//! └──────────────────────────┬───────────────────────────┘
//!                            │ enqueue
//!                   ┌────────▼────────┐
//!                   │ Response cache  │ ← hit: answer immediately
//!                   └────────┬────────┘
//!                            │ miss
//!                   ┌────────▼────────┐
//!                   │ Priority queue  │ ← per-level policies, timeouts
//!                   └────────┬────────┘
//!                            │ scan cursor
//!                   ┌────────▼────────┐
//!                   │ Batch formation │ ← preferred sizes, shapes,
//!                   └────────┬────────┘   max queue delay
//!                            │ sealed payload
//!                   ┌────────▼────────┐
//!                   │  Rate limiter   │ ← owns execution slots
//!                   └────────┬────────┘
//!                            │ backend responses
//!                   ┌────────▼────────┐
//!                   │ Ordered release │ ← cache insert, in-order delivery
//!                   └─────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dynbatch::{
//!     BatcherConfig, DynamicBatchScheduler, InferenceRequest, InferenceResponse,
//!     ResponseFlags, SlotLimiter,
//! };
//!
//! // A backend that echoes one FINAL response per request.
//! let limiter = SlotLimiter::new(2, Arc::new(|requests: &mut [InferenceRequest]| {
//!     for request in requests {
//!         let response = InferenceResponse::new(request.id.clone(), vec![]);
//!         request.send_response(Ok(response), ResponseFlags::FINAL);
//!     }
//! }));
//!
//! let scheduler = DynamicBatchScheduler::new(BatcherConfig::high_throughput(), limiter);
//! let request = InferenceRequest::new("req-0", vec![])
//!     .on_response(|result, _flags| println!("{result:?}"));
//! scheduler.enqueue(request).unwrap();
//! ```

pub mod cache;
pub mod custom;
pub mod error;
pub mod limiter;
pub mod payload;
pub mod request;
pub mod scheduler;
pub mod shape;

mod queue;

pub use cache::{CacheError, CacheKey, ExactResponseCache, ResponseCache};
pub use custom::CustomBatcher;
pub use error::{RejectedRequest, Result, ScheduleError};
pub use limiter::{BackendFn, RateLimiter, SlotLimiter};
pub use payload::{Payload, PayloadState};
pub use queue::{OverflowAction, QueuePolicy};
pub use request::{
    InferenceRequest, InferenceResponse, Responder, ResponseFlags, ResponseResult, Tensor,
};
pub use scheduler::{BatcherConfig, BatcherMetrics, DynamicBatchScheduler, MetricsSnapshot};
pub use shape::RequiredEqualInputs;

use once_cell::sync::Lazy;
use std::time::Instant;

static CLOCK_ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic nanoseconds since process start. All scheduler timestamps and
/// deadlines live on this clock; 0 doubles as "unset", so the reading is
/// clamped to at least 1.
pub(crate) fn now_ns() -> u64 {
    (CLOCK_ANCHOR.elapsed().as_nanos() as u64).max(1)
}
