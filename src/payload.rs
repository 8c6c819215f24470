//! Payloads: batches in formation and in flight.
//!
//! A payload is created by the scheduler, filled with requests during batch
//! formation, marked ready and handed to the rate limiter, which drives it
//! through execution. Once a payload is executing or released it is stale
//! and must never be modified; the scheduler allocates a fresh one instead.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::request::InferenceRequest;
use crate::shape::RequiredEqualInputs;

static NEXT_PAYLOAD_ID: AtomicU64 = AtomicU64::new(0);

/// Lifecycle state of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadState {
    /// Created, not yet holding a complete batch
    Uninitialized,
    /// Batch complete, waiting for (or queued at) the rate limiter
    Ready,
    /// The backend is running this batch
    Executing,
    /// Execution finished and the payload was released
    Released,
}

impl PayloadState {
    /// Stale payloads must not be modified; the scheduler starts a new one.
    pub fn is_stale(self) -> bool {
        matches!(self, PayloadState::Executing | PayloadState::Released)
    }
}

/// Callback invoked when the payload is released by the rate limiter.
pub type ReleaseCallback = Box<dyn Fn() + Send + Sync>;

/// Everything guarded by the payload's execution mutex.
pub(crate) struct PayloadInner {
    pub(crate) state: PayloadState,
    pub(crate) requests: Vec<InferenceRequest>,
    pub(crate) batch_size: u64,
    pub(crate) saturated: bool,
    pub(crate) required_equal: RequiredEqualInputs,
    /// Opaque state owned by a custom batching hook, bracketed by init/fini.
    pub(crate) user_data: Option<Box<dyn Any + Send>>,
}

/// A batch of requests owned by the scheduler until handed to the rate
/// limiter.
pub struct Payload {
    id: u64,
    inner: Mutex<PayloadInner>,
    callback: Mutex<Option<ReleaseCallback>>,
}

impl Payload {
    /// Create an empty payload in the `Uninitialized` state
    pub fn new() -> Self {
        Self {
            id: NEXT_PAYLOAD_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(PayloadInner {
                state: PayloadState::Uninitialized,
                requests: Vec::new(),
                batch_size: 0,
                saturated: false,
                required_equal: RequiredEqualInputs::default(),
                user_data: None,
            }),
            callback: Mutex::new(None),
        }
    }

    /// Unique payload id, for logging
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Acquire the execution mutex. The scheduler holds this guard while
    /// reading or mutating the forming batch.
    pub(crate) fn lock(&self) -> MutexGuard<'_, PayloadInner> {
        self.inner.lock().unwrap()
    }

    /// Current lifecycle state
    pub fn state(&self) -> PayloadState {
        self.inner.lock().unwrap().state
    }

    /// Move the payload to a new state. Rate limiters use this to drive
    /// `Ready -> Executing`; releasing goes through [`Payload::release`].
    pub fn set_state(&self, state: PayloadState) {
        self.inner.lock().unwrap().state = state;
    }

    /// Sum of the declared batch sizes of the requests added so far
    pub fn batch_size(&self) -> u64 {
        self.inner.lock().unwrap().batch_size
    }

    /// Number of requests in the payload
    pub fn request_count(&self) -> usize {
        self.inner.lock().unwrap().requests.len()
    }

    /// Reserve space for `additional` requests
    pub fn reserve_requests(&self, additional: usize) {
        self.inner.lock().unwrap().requests.reserve(additional);
    }

    /// Append a request to the batch
    pub fn add_request(&self, request: InferenceRequest) {
        let mut inner = self.inner.lock().unwrap();
        inner.batch_size += request.effective_batch_size();
        inner.requests.push(request);
    }

    /// Take the batched requests out, typically when execution begins.
    /// The batch size accounting is left in place.
    pub fn take_requests(&self) -> Vec<InferenceRequest> {
        std::mem::take(&mut self.inner.lock().unwrap().requests)
    }

    /// Mark the payload as unable to accept further requests
    pub fn mark_saturated(&self) {
        self.inner.lock().unwrap().saturated = true;
    }

    /// Whether the payload was marked saturated
    pub fn is_saturated(&self) -> bool {
        self.inner.lock().unwrap().saturated
    }

    /// Install the callback fired on release. The scheduler installs one
    /// that re-checks rate-limiter slot availability.
    pub fn set_callback(&self, callback: ReleaseCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Transition to `Released` and fire the release callback, if any.
    /// Called by the rate limiter when execution is finished.
    pub fn release(&self) {
        self.inner.lock().unwrap().state = PayloadState::Released;
        let callback = self.callback.lock().unwrap();
        if let Some(cb) = callback.as_ref() {
            cb();
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Payload")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("requests", &inner.requests.len())
            .field("batch_size", &inner.batch_size)
            .field("saturated", &inner.saturated)
            .finish()
    }
}
