//! The dynamic batch scheduler.
//!
//! One scheduler instance serves one model. Client threads hand requests to
//! [`DynamicBatchScheduler::enqueue`]; a single background worker drains the
//! priority queue, forms batches under the configured policies and hands
//! sealed payloads to the rate limiter for execution.
//!
//! # Architecture
//!
//! ```text
//! client ──► enqueue ──► cache lookup ──hit──► respond
//!                │
//!                ▼
//!         priority queue ──► worker ──► batch formation ──► payload
//!                                                              │
//!                                                              ▼
//!                                                        rate limiter
//!                                                              │
//!                          response delegation  ◄── backend ◄──┘
//!                            (cache insert, ordered release)
//! ```
//!
//! # Locking
//!
//! Lock order, outermost first: the finalize mutex (ordered response drain),
//! the scheduler state mutex, the payload's execution mutex, the
//! completion-queue mutex. Response delegators run on backend threads and
//! only ever touch the last of these.

mod batch;
mod config;
mod metrics;

pub use config::BatcherConfig;
pub use metrics::{BatcherMetrics, MetricsSnapshot};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::cache::{CacheError, ResponseCache};
use crate::custom::CustomBatcher;
use crate::error::{RejectedRequest, ScheduleError};
use crate::limiter::RateLimiter;
use crate::now_ns;
use crate::payload::{Payload, PayloadInner, PayloadState};
use crate::queue::PriorityQueue;
use crate::request::{
    InferenceRequest, InferenceResponse, Responder, ResponseFlags, ResponseResult,
    SharedResponder,
};

/// Hold batch formation until the queue reaches this many entries.
/// Debugging and testing only.
const DELAY_SCHEDULER_ENV: &str = "DYNBATCH_DELAY_SCHEDULER";

const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(500);
const DELAY_POLL_WAIT: Duration = Duration::from_millis(10);

/// Scheduler state guarded by the state mutex.
pub(crate) struct SchedState {
    pub(crate) queue: PriorityQueue,
    pub(crate) curr_payload: Arc<Payload>,
    pub(crate) payload_saturated: bool,
    /// Total declared size of requests accepted by the current scan
    pub(crate) pending_batch_size: u64,
    /// Total declared size of everything sitting in the queue
    pub(crate) queued_batch_size: u64,
    /// Queue size at which an incoming request is worth a batcher wakeup
    pub(crate) next_preferred_batch_size: u64,
}

/// One completion slot per delegated request, in submission order.
struct Slot {
    /// The request's own responder; present only when ordering is on
    responder: Option<SharedResponder>,
    entries: Vec<(ResponseResult, ResponseFlags)>,
}

#[derive(Default)]
struct CompletionQueue {
    slots: VecDeque<Slot>,
    /// Sequence number of the front slot
    front_seq: u64,
    next_seq: u64,
}

impl CompletionQueue {
    fn push_entry(&mut self, seq: u64, result: ResponseResult, flags: ResponseFlags) {
        if seq < self.front_seq {
            warn!(seq, "response arrived for an already-finalized request");
            return;
        }
        let index = (seq - self.front_seq) as usize;
        match self.slots.get_mut(index) {
            Some(slot) => slot.entries.push((result, flags)),
            None => warn!(seq, "response arrived for an unknown completion slot"),
        }
    }
}

pub(crate) struct SchedulerCore {
    pub(crate) config: BatcherConfig,
    pub(crate) max_queue_delay_ns: u64,
    pub(crate) max_preferred_batch_size: u64,
    /// Caching requires both the config flag and an attached cache
    cache_enabled: bool,
    limiter: Arc<dyn RateLimiter>,
    cache: Option<Arc<dyn ResponseCache>>,
    custom: Option<Arc<dyn CustomBatcher>>,
    metrics: Arc<BatcherMetrics>,
    pub(crate) state: Mutex<SchedState>,
    pub(crate) cv: Condvar,
    stop: AtomicBool,
    exit: AtomicBool,
    completion: Mutex<CompletionQueue>,
    finalize_mtx: Mutex<()>,
}

impl SchedulerCore {
    pub(crate) fn new(
        mut config: BatcherConfig,
        limiter: Arc<dyn RateLimiter>,
        cache: Option<Arc<dyn ResponseCache>>,
        custom: Option<Arc<dyn CustomBatcher>>,
    ) -> Arc<Self> {
        config.max_batch_size = config.max_batch_size.max(1);
        let queue = PriorityQueue::new(
            config.default_queue_policy.clone(),
            config.priority_levels,
            &config.queue_policies,
        );
        let cache_enabled = config.response_cache_enabled && cache.is_some();
        if config.response_cache_enabled && cache.is_none() {
            warn!("response caching requested but no cache attached; caching disabled");
        }
        let curr_payload = limiter.new_payload();
        Arc::new(Self {
            max_queue_delay_ns: config.max_queue_delay_ns(),
            max_preferred_batch_size: config.max_preferred_batch_size(),
            cache_enabled,
            config,
            limiter,
            cache,
            custom,
            metrics: Arc::new(BatcherMetrics::new()),
            state: Mutex::new(SchedState {
                queue,
                curr_payload,
                payload_saturated: false,
                pending_batch_size: 0,
                queued_batch_size: 0,
                next_preferred_batch_size: 0,
            }),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
            exit: AtomicBool::new(false),
            completion: Mutex::new(CompletionQueue::default()),
            finalize_mtx: Mutex::new(()),
        })
    }

    /// Replace a saturated or stale payload. Called with the state lock held.
    fn new_payload(&self, state: &mut SchedState) {
        state.curr_payload = self.limiter.new_payload();
        state.payload_saturated = false;
        let payload = Arc::clone(&state.curr_payload);
        let mut inner = payload.lock();
        self.custom_batch_init(&mut inner);
    }

    pub(crate) fn custom_batch_enabled(&self) -> bool {
        self.custom.is_some()
    }

    pub(crate) fn custom_batch_init(&self, payload: &mut PayloadInner) {
        let Some(custom) = &self.custom else { return };
        match custom.init() {
            Ok(state) => payload.user_data = Some(state),
            Err(e) => error!("custom batching initialization failed: {e}"),
        }
    }

    /// Ask the custom hook whether `request` may join the batch. A failing
    /// hook counts as "do not include".
    pub(crate) fn custom_batch_include(
        &self,
        request: &InferenceRequest,
        payload: &mut PayloadInner,
    ) -> bool {
        let Some(custom) = &self.custom else { return true };
        let Some(state) = payload.user_data.as_mut() else {
            // Initialization failed earlier; there is no state to consult.
            return true;
        };
        match custom.include(request, state.as_mut()) {
            Ok(include) => include,
            Err(e) => {
                error!(id = %request.id, "custom batching include failed: {e}");
                false
            }
        }
    }

    pub(crate) fn custom_batch_fini(&self, payload: &mut PayloadInner) {
        let Some(custom) = &self.custom else { return };
        let Some(state) = payload.user_data.take() else { return };
        if let Err(e) = custom.fini(state) {
            error!("custom batching finalization failed: {e}");
        }
    }

    /// Compute the request's cache key (once) and look it up, capturing the
    /// lookup window for later miss-latency accounting.
    fn cache_lookup(&self, request: &mut InferenceRequest) -> Option<InferenceResponse> {
        let cache = self.cache.as_ref()?;
        if request.cache_key.is_none() {
            match cache.hash(request) {
                Ok(key) => request.cache_key = Some(key),
                Err(e) => {
                    error!(id = %request.id, "failed to hash request: {e}");
                    return None;
                }
            }
        }
        let key = request.cache_key?;

        request.cache_lookup_start_ns = now_ns();
        let response = cache.lookup(key);
        request.cache_lookup_end_ns = now_ns();

        if response.is_some() {
            self.metrics
                .record_cache_hit(request.cache_lookup_end_ns - request.cache_lookup_start_ns);
            debug!(id = %request.id, key, "response cache hit");
        }
        response
    }

    /// Intercept the request's responder.
    ///
    /// The wrapper inserts Ok responses into the cache (a miss path; an
    /// AlreadyExists result means the hit was counted at lookup) and, when
    /// ordering is on, buffers responses in the request's submission-order
    /// slot instead of sending them directly.
    fn delegate_response(core: &Arc<SchedulerCore>, request: &mut InferenceRequest) {
        // A request without a responder would stall the ordered drain, so it
        // gets a discarding one.
        let original = request.take_responder().unwrap_or_else(|| {
            warn!(id = %request.id, "delegating a request that has no responder");
            Arc::new(Mutex::new(Box::new(|_, _| {}) as Responder))
        });

        let seq = {
            let mut completion = core.completion.lock().unwrap();
            let seq = completion.next_seq;
            completion.next_seq += 1;
            completion.slots.push_back(Slot {
                responder: if core.config.preserve_ordering {
                    Some(original.clone())
                } else {
                    None
                },
                entries: Vec::new(),
            });
            seq
        };

        let key = request.cache_key;
        let lookup_start_ns = request.cache_lookup_start_ns;
        let lookup_end_ns = request.cache_lookup_end_ns;
        let id = request.id.clone();
        let direct = if core.config.preserve_ordering {
            None
        } else {
            Some(original)
        };
        let core = Arc::clone(core);

        let wrapper: Responder = Box::new(move |result: ResponseResult, flags: ResponseFlags| {
            if core.cache_enabled {
                if let (Ok(response), Some(cache)) = (&result, core.cache.as_ref()) {
                    match key {
                        None => error!(id = %id, "request cache key was not set correctly"),
                        Some(key) => {
                            // Insertion happens here because the backend must
                            // produce the response first on a miss.
                            let insert_start_ns = now_ns();
                            let status = cache.insert(response, key);
                            let insert_ns = now_ns() - insert_start_ns;
                            match status {
                                Err(CacheError::AlreadyExists) => {}
                                status => {
                                    let lookup_ns = if lookup_start_ns > lookup_end_ns {
                                        error!(id = %id, "request lookup duration was not set correctly");
                                        0
                                    } else {
                                        lookup_end_ns - lookup_start_ns
                                    };
                                    core.metrics.record_cache_miss(lookup_ns + insert_ns);
                                    if let Err(e) = status {
                                        error!(id = %id, key, "failed to insert response into cache: {e}");
                                    }
                                }
                            }
                        }
                    }
                }
            }

            if core.config.preserve_ordering {
                {
                    let mut completion = core.completion.lock().unwrap();
                    completion.push_entry(seq, result, flags);
                }
                core.finalize_responses();
            } else if let Some(responder) = &direct {
                let mut f = responder.lock().unwrap();
                (*f)(result, flags);
            }
        });

        request.set_responder(Arc::new(Mutex::new(wrapper)));
    }

    /// Release buffered responses in submission order.
    ///
    /// Removes the longest contiguous prefix of non-empty slots. A slot
    /// whose last buffered response is not FINAL is cleared but kept, so
    /// later partial responses of that request stay ordered. Dispatch
    /// happens after the completion-queue lock is dropped.
    fn finalize_responses(&self) {
        let _finalize = self.finalize_mtx.lock().unwrap();

        let mut ready: Vec<(SharedResponder, ResponseResult, ResponseFlags)> = Vec::new();
        {
            let mut completion = self.completion.lock().unwrap();
            while let Some(front) = completion.slots.front_mut() {
                if front.entries.is_empty() {
                    break;
                }
                let Some(responder) = front.responder.clone() else {
                    break;
                };
                let mut complete = false;
                for (result, flags) in front.entries.drain(..) {
                    complete = flags.is_final();
                    ready.push((responder.clone(), result, flags));
                }
                if complete {
                    completion.slots.pop_front();
                    completion.front_seq += 1;
                }
            }
        }

        for (responder, result, flags) in ready {
            let mut f = responder.lock().unwrap();
            (*f)(result, flags);
        }
    }
}

/// Dynamic batch scheduler for a single model.
///
/// Dropping the scheduler signals its worker thread and joins it; requests
/// still queued are dropped, payloads already handed to the rate limiter
/// complete normally.
pub struct DynamicBatchScheduler {
    core: Arc<SchedulerCore>,
    worker: Option<JoinHandle<()>>,
}

impl DynamicBatchScheduler {
    /// Create a scheduler without caching or custom batching hooks
    pub fn new(config: BatcherConfig, limiter: Arc<dyn RateLimiter>) -> Self {
        Self::with_hooks(config, limiter, None, None)
    }

    /// Create a scheduler with an optional response cache and optional
    /// custom batching hooks
    pub fn with_hooks(
        config: BatcherConfig,
        limiter: Arc<dyn RateLimiter>,
        cache: Option<Arc<dyn ResponseCache>>,
        custom: Option<Arc<dyn CustomBatcher>>,
    ) -> Self {
        let core = SchedulerCore::new(config, limiter, cache, custom);

        let worker = if core.config.dynamic_batching_enabled {
            {
                let state = core.state.lock().unwrap();
                let payload = Arc::clone(&state.curr_payload);
                drop(state);
                let mut inner = payload.lock();
                core.custom_batch_init(&mut inner);
            }
            let worker_core = Arc::clone(&core);
            let nice = core.config.nice;
            Some(
                std::thread::Builder::new()
                    .name("dynbatch-worker".to_string())
                    .spawn(move || batcher_thread(worker_core, nice))
                    .expect("failed to spawn batcher thread"),
            )
        } else {
            None
        };

        Self { core, worker }
    }

    /// Accept a request for scheduling.
    ///
    /// On success the scheduler owns the request and will answer through its
    /// responder. On failure the request is handed back along with the error.
    pub fn enqueue(&self, mut request: InferenceRequest) -> Result<(), RejectedRequest> {
        if self.core.stop.load(Ordering::Relaxed) {
            return Err(RejectedRequest {
                request,
                error: ScheduleError::unavailable(
                    "scheduler has stopped accepting new inference requests",
                ),
            });
        }

        self.core.metrics.record_received();

        // An outer batcher may already own the queue-start timestamp.
        let now = now_ns();
        if request.queue_start_ns == 0 {
            request.queue_start_ns = now;
        }
        request.batcher_start_ns = now;

        if self.core.cache_enabled {
            if let Some(mut response) = self.core.cache_lookup(&mut request) {
                response.id = request.id.clone();
                if self.core.config.preserve_ordering {
                    // The send must go through the completion queue to keep
                    // its place in line.
                    SchedulerCore::delegate_response(&self.core, &mut request);
                }
                request.send_response(Ok(response), ResponseFlags::FINAL);
                return Ok(());
            }
        }

        if !self.core.config.dynamic_batching_enabled {
            return self.enqueue_direct(request);
        }

        let wake_batcher;
        {
            let mut state = self.core.state.lock().unwrap();
            let size = request.effective_batch_size();
            state.queued_batch_size += size;

            match state.queue.enqueue(request) {
                Ok(evicted_size) => {
                    if evicted_size > 0 {
                        state.queued_batch_size =
                            state.queued_batch_size.saturating_sub(evicted_size);
                        self.core.metrics.record_evicted();
                    }
                }
                Err(rejected) => {
                    state.queued_batch_size -= size;
                    self.core.metrics.record_rejected();
                    return Err(rejected);
                }
            }
            self.core.metrics.record_queued();

            // Wake the batcher only when it can act: a payload slot must be
            // free, and (unless shape checks force a look at every request)
            // the queue must have reached the next preferred size or the
            // current payload must already be unusable.
            let mut wake = self.core.limiter.slot_available();
            if self.core.config.enforce_equal_shape_tensors.is_empty() {
                let payload = Arc::clone(&state.curr_payload);
                let inner = payload.lock();
                wake &= state.payload_saturated
                    || inner.state.is_stale()
                    || state.queued_batch_size >= state.next_preferred_batch_size;
            }
            wake_batcher = wake;
        }

        // Notify outside the lock so the woken thread doesn't immediately
        // block on it.
        if wake_batcher {
            self.core.cv.notify_one();
        }
        Ok(())
    }

    /// Dispatch a request alone, bypassing the queue. Used when dynamic
    /// batching is disabled.
    fn enqueue_direct(&self, mut request: InferenceRequest) -> Result<(), RejectedRequest> {
        if self.core.config.preserve_ordering || self.core.cache_enabled {
            SchedulerCore::delegate_response(&self.core, &mut request);
        }
        let payload = self.core.limiter.new_payload();
        payload.add_request(request);
        payload.set_state(PayloadState::Ready);

        let batch_size = payload.batch_size();
        if let Err(error) = self.core.limiter.enqueue_payload(Arc::clone(&payload)) {
            let mut requests = payload.take_requests();
            match requests.pop() {
                Some(request) => return Err(RejectedRequest { request, error }),
                None => {
                    error!("rate limiter rejected a payload it already consumed: {error}");
                    return Ok(());
                }
            }
        }
        self.core.metrics.record_queued();
        self.core.metrics.record_batch(1, batch_size);
        Ok(())
    }

    /// Stop accepting new requests. Queued and in-flight work still drains.
    pub fn stop(&self) {
        self.core.stop.store(true, Ordering::Relaxed);
    }

    /// Scheduler metrics handle
    pub fn metrics(&self) -> Arc<BatcherMetrics> {
        Arc::clone(&self.core.metrics)
    }
}

impl Drop for DynamicBatchScheduler {
    fn drop(&mut self) {
        self.core.exit.store(true, Ordering::Relaxed);
        self.core.cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(target_os = "linux")]
fn apply_nice(nice: i32) {
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::id_t;
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid, nice) };
    if rc == 0 {
        debug!(nice, "batcher thread reniced");
    } else {
        debug!(nice, "renice failed, batcher thread keeps default priority");
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_nice(_nice: i32) {}

/// The scheduler worker: forms batches, times out waits and hands sealed
/// payloads to the rate limiter.
fn batcher_thread(core: Arc<SchedulerCore>, nice: i32) {
    apply_nice(nice);
    debug!("starting dynamic batcher thread");

    let mut delay_cnt: usize = std::env::var(DELAY_SCHEDULER_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if delay_cnt > 0 {
        debug!(delay_cnt, "delaying batcher until the queue reaches the configured depth");
    }

    // Guards against handing the same payload to the rate limiter twice: a
    // ready payload that is not a preferred size stays current so it can
    // still be grown until the backend picks it up.
    let mut last_dispatched: Option<u64> = None;

    while !core.exit.load(Ordering::Relaxed) {
        let mut rejected: Vec<Vec<(InferenceRequest, ScheduleError)>> = Vec::new();
        let mut wait = Duration::ZERO;
        let dispatch_payload;

        {
            let mut state = core.state.lock().unwrap();
            {
                let payload = Arc::clone(&state.curr_payload);
                let inner = payload.lock();
                if state.payload_saturated || inner.state.is_stale() {
                    drop(inner);
                    core.new_payload(&mut state);
                    state.next_preferred_batch_size = 0;
                }
            }

            if delay_cnt > 0 {
                wait = DELAY_POLL_WAIT;
                if state.queue.size() >= delay_cnt {
                    debug!(queued = state.queue.size(), "queue reached configured depth");
                    delay_cnt = 0;
                }
            } else if state.queue.is_empty() {
                wait = DEFAULT_IDLE_WAIT;
            } else {
                if state.payload_saturated {
                    continue;
                }
                state = core
                    .cv
                    .wait_while(state, |_| {
                        !core.exit.load(Ordering::Relaxed) && !core.limiter.slot_available()
                    })
                    .unwrap();
                if core.exit.load(Ordering::Relaxed) {
                    continue;
                }

                let payload = Arc::clone(&state.curr_payload);
                let mut inner = payload.lock();
                if inner.state.is_stale() {
                    continue;
                }

                let wait_us = core.get_dynamic_batch(&mut state, &mut inner);
                wait = Duration::from_micros(wait_us);

                rejected = state.queue.release_rejected_requests();

                let pending_count = state.queue.pending_batch_count();
                if wait_us == 0 && pending_count != 0 {
                    inner.requests.reserve(pending_count);
                    let mut added = 0u64;
                    let mut added_size = 0u64;
                    for _ in 0..pending_count {
                        match state.queue.dequeue() {
                            Ok(mut request) => {
                                if core.config.preserve_ordering || core.cache_enabled {
                                    SchedulerCore::delegate_response(&core, &mut request);
                                }
                                added += 1;
                                added_size += request.effective_batch_size();
                                inner.batch_size += request.effective_batch_size();
                                inner.requests.push(request);
                            }
                            Err(e) => {
                                // The queue disagrees with the pending batch
                                // count. Send whatever was added and rescan.
                                error!("failed to retrieve request from scheduler queue: {e}");
                                state.queue.reset_cursor();
                                state.queued_batch_size = 0;
                                state.pending_batch_size = 0;
                                break;
                            }
                        }
                    }

                    if inner.state == PayloadState::Uninitialized {
                        inner.state = PayloadState::Ready;
                    }

                    state.queued_batch_size =
                        state.queued_batch_size.saturating_sub(state.pending_batch_size);
                    state.pending_batch_size = 0;
                    if added > 0 {
                        core.metrics.record_batch(added, added_size);
                    }
                }
            }

            if wait > Duration::ZERO {
                let (guard, _timeout) = core.cv.wait_timeout(state, wait).unwrap();
                state = guard;
            }

            dispatch_payload = Arc::clone(&state.curr_payload);
        }

        if dispatch_payload.state() == PayloadState::Ready
            && last_dispatched != Some(dispatch_payload.id())
        {
            last_dispatched = Some(dispatch_payload.id());
            let notify = Arc::clone(&core);
            dispatch_payload.set_callback(Box::new(move || notify.cv.notify_one()));
            {
                let mut inner = dispatch_payload.lock();
                core.custom_batch_fini(&mut inner);
            }
            debug!(
                payload = dispatch_payload.id(),
                requests = dispatch_payload.request_count(),
                batch_size = dispatch_payload.batch_size(),
                "dispatching payload to rate limiter"
            );
            if let Err(e) = core.limiter.enqueue_payload(Arc::clone(&dispatch_payload)) {
                error!(
                    payload = dispatch_payload.id(),
                    "failed to enqueue payload with rate limiter: {e}"
                );
            }
        }

        for (request, error) in rejected.into_iter().flatten() {
            if matches!(error, ScheduleError::TimeoutExpired) {
                core.metrics.record_timeout();
            }
            debug!(id = %request.id, "rejecting request: {error}");
            request.send_response(Err(error), ResponseFlags::FINAL);
        }
    }

    debug!("stopping dynamic batcher thread");
}
