//! Request and response types flowing through the scheduler.
//!
//! The scheduler treats tensor contents as opaque; only tensor names and
//! shapes are inspected (for equal-shape batching). Responses travel back to
//! the client through a per-request responder callback, which the scheduler
//! may replace with a delegating wrapper when ordering or caching is on.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::cache::CacheKey;
use crate::error::ScheduleError;

/// An input or output tensor. Data is opaque to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    /// Tensor name, unique within a request
    pub name: String,
    /// Dimensions, batch dimension first
    pub shape: Vec<i64>,
    /// Raw tensor contents
    pub data: Bytes,
}

impl Tensor {
    /// Create a new tensor
    pub fn new(name: impl Into<String>, shape: Vec<i64>, data: Bytes) -> Self {
        Self { name: name.into(), shape, data }
    }
}

/// The result of one inference execution for a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceResponse {
    /// Echoes the request id
    pub id: String,
    /// Output tensors produced by the backend
    pub outputs: Vec<Tensor>,
}

impl InferenceResponse {
    /// Create a new response
    pub fn new(id: impl Into<String>, outputs: Vec<Tensor>) -> Self {
        Self { id: id.into(), outputs }
    }
}

/// Flags attached to each response. `FINAL` marks the last response of a
/// request; streaming backends may send several non-final responses first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseFlags(u32);

impl ResponseFlags {
    /// No flags set
    pub const NONE: ResponseFlags = ResponseFlags(0);
    /// This is the last response for the request
    pub const FINAL: ResponseFlags = ResponseFlags(1);

    /// Whether the FINAL bit is set
    pub fn is_final(self) -> bool {
        self.0 & ResponseFlags::FINAL.0 != 0
    }
}

/// Either a successful response or the error terminating the request.
pub type ResponseResult = Result<InferenceResponse, ScheduleError>;

/// Per-request response callback.
pub type Responder = Box<dyn FnMut(ResponseResult, ResponseFlags) + Send>;

/// Shared handle to a responder so buffered responses can be dispatched
/// after the completion-queue lock is released.
pub(crate) type SharedResponder = Arc<Mutex<Responder>>;

/// A single inference request.
///
/// Immutable after enqueue except for the fields the scheduler itself owns:
/// the cache key, the timestamps and the (delegated) responder.
pub struct InferenceRequest {
    /// Caller-assigned identifier, echoed in responses
    pub id: String,
    priority: u32,
    batch_size: u32,
    inputs: Vec<Tensor>,
    timeout: Option<Duration>,
    responder: Option<SharedResponder>,

    // Scheduler-owned bookkeeping.
    pub(crate) queue_start_ns: u64,
    pub(crate) batcher_start_ns: u64,
    pub(crate) cache_lookup_start_ns: u64,
    pub(crate) cache_lookup_end_ns: u64,
    pub(crate) cache_key: Option<CacheKey>,
    /// Absolute deadline in monotonic ns, 0 = no timeout. Set on enqueue.
    pub(crate) deadline_ns: u64,
}

impl InferenceRequest {
    /// Create a request with default priority and a batch size of 1.
    pub fn new(id: impl Into<String>, inputs: Vec<Tensor>) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            batch_size: 1,
            inputs,
            timeout: None,
            responder: None,
            queue_start_ns: 0,
            batcher_start_ns: 0,
            cache_lookup_start_ns: 0,
            cache_lookup_end_ns: 0,
            cache_key: None,
            deadline_ns: 0,
        }
    }

    /// Set the priority level (0 is the most urgent)
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the declared batch size (clamped to at least 1 when accounted)
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set a per-request queue timeout, overriding the level's default
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Install the response callback. Later responses (or a terminal error)
    /// arrive through it; the FINAL flag marks the last one.
    pub fn on_response<F>(mut self, f: F) -> Self
    where
        F: FnMut(ResponseResult, ResponseFlags) + Send + 'static,
    {
        self.responder = Some(Arc::new(Mutex::new(Box::new(f) as Responder)));
        self
    }

    /// Priority level of this request
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Declared batch size
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Batch size as accounted by the scheduler (at least 1)
    pub fn effective_batch_size(&self) -> u64 {
        u64::from(self.batch_size.max(1))
    }

    /// Input tensors
    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    /// Look up an input tensor by name
    pub fn input(&self, name: &str) -> Option<&Tensor> {
        self.inputs.iter().find(|t| t.name == name)
    }

    /// Per-request timeout override, if any
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Monotonic ns at which this request first entered a scheduler queue;
    /// 0 until enqueued
    pub fn queue_start_ns(&self) -> u64 {
        self.queue_start_ns
    }

    /// Monotonic ns at which this batcher accepted the request; 0 until
    /// enqueued
    pub fn batcher_start_ns(&self) -> u64 {
        self.batcher_start_ns
    }

    /// Send a response through the current responder. Invoking it on a
    /// request without a responder is logged and dropped.
    pub fn send_response(&self, result: ResponseResult, flags: ResponseFlags) {
        match &self.responder {
            Some(responder) => {
                let mut f = responder.lock().unwrap();
                (*f)(result, flags);
            }
            None => {
                tracing::warn!(id = %self.id, "dropping response for request without responder");
            }
        }
    }

    /// Whether this request's queue deadline has passed
    pub(crate) fn is_expired(&self, now_ns: u64) -> bool {
        self.deadline_ns != 0 && now_ns >= self.deadline_ns
    }

    pub(crate) fn take_responder(&mut self) -> Option<SharedResponder> {
        self.responder.take()
    }

    pub(crate) fn set_responder(&mut self, responder: SharedResponder) {
        self.responder = Some(responder);
    }
}

impl std::fmt::Debug for InferenceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceRequest")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("batch_size", &self.batch_size)
            .field("inputs", &self.inputs.len())
            .field("deadline_ns", &self.deadline_ns)
            .finish()
    }
}
