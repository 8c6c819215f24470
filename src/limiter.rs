//! Rate-limiter interface and a slot-based reference implementation.
//!
//! The rate limiter owns execution slots: the scheduler asks it for fresh
//! payloads, checks slot availability before forming a batch, and hands
//! sealed payloads over for execution. The limiter drives the payload
//! through `Executing` to `Released` and fires the payload's release
//! callback, which is how the scheduler learns a slot freed up.

use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use crate::error::{Result, ScheduleError};
use crate::payload::{Payload, PayloadState};
use crate::request::InferenceRequest;

/// Admission controller between the scheduler and the backend.
pub trait RateLimiter: Send + Sync {
    /// Allocate a fresh payload for the scheduler to fill
    fn new_payload(&self) -> Arc<Payload>;

    /// Accept a sealed payload for execution
    fn enqueue_payload(&self, payload: Arc<Payload>) -> Result<()>;

    /// Whether an execution slot is currently free
    fn slot_available(&self) -> bool;
}

/// Backend invocation: receives the batch and sends responses through each
/// request's responder.
pub type BackendFn = Arc<dyn Fn(&mut [InferenceRequest]) + Send + Sync>;

/// A rate limiter holding a fixed number of execution slots.
///
/// Each enqueued payload runs on its own thread once a slot frees up; the
/// batch is passed to the backend function, which is responsible for
/// sending one FINAL response per request.
pub struct SlotLimiter {
    slots: Arc<(Mutex<usize>, Condvar)>,
    backend: BackendFn,
}

impl SlotLimiter {
    /// Create a limiter with `slots` concurrent execution slots
    pub fn new(slots: usize, backend: BackendFn) -> Arc<Self> {
        Arc::new(Self {
            slots: Arc::new((Mutex::new(slots), Condvar::new())),
            backend,
        })
    }

    /// Add execution slots at runtime
    pub fn add_slots(&self, additional: usize) {
        let (lock, cv) = &*self.slots;
        *lock.lock().unwrap() += additional;
        cv.notify_all();
    }
}

impl RateLimiter for SlotLimiter {
    fn new_payload(&self) -> Arc<Payload> {
        Arc::new(Payload::new())
    }

    fn enqueue_payload(&self, payload: Arc<Payload>) -> Result<()> {
        if payload.state().is_stale() {
            return Err(ScheduleError::internal(
                "payload enqueued in a stale state",
            ));
        }

        let slots = Arc::clone(&self.slots);
        let backend = Arc::clone(&self.backend);
        std::thread::spawn(move || {
            {
                let (lock, cv) = &*slots;
                let mut available = lock.lock().unwrap();
                while *available == 0 {
                    available = cv.wait(available).unwrap();
                }
                *available -= 1;
            }

            payload.set_state(PayloadState::Executing);
            let mut requests = payload.take_requests();
            debug!(
                payload = payload.id(),
                requests = requests.len(),
                "executing payload"
            );
            (*backend)(&mut requests);

            // Free the slot before releasing: the release callback is what
            // wakes the scheduler to re-check slot availability.
            let (lock, cv) = &*slots;
            *lock.lock().unwrap() += 1;
            cv.notify_all();

            payload.release();
        });

        Ok(())
    }

    fn slot_available(&self) -> bool {
        *self.slots.0.lock().unwrap() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{InferenceResponse, ResponseFlags};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn echo_backend() -> BackendFn {
        Arc::new(|requests: &mut [InferenceRequest]| {
            for request in requests {
                let response = InferenceResponse::new(request.id.clone(), vec![]);
                request.send_response(Ok(response), ResponseFlags::FINAL);
            }
        })
    }

    #[test]
    fn test_payload_executes_and_releases() {
        let limiter = SlotLimiter::new(1, echo_backend());
        let responded = Arc::new(AtomicUsize::new(0));

        let payload = limiter.new_payload();
        let counter = responded.clone();
        payload.add_request(InferenceRequest::new("a", vec![]).on_response(
            move |result, flags| {
                assert!(result.is_ok());
                assert!(flags.is_final());
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ));
        payload.set_state(PayloadState::Ready);

        limiter.enqueue_payload(payload.clone()).unwrap();

        // Wait for the execution thread to finish.
        for _ in 0..100 {
            if payload.state() == PayloadState::Released {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(payload.state(), PayloadState::Released);
        assert_eq!(responded.load(Ordering::SeqCst), 1);
        assert!(limiter.slot_available());
    }

    #[test]
    fn test_stale_payload_rejected() {
        let limiter = SlotLimiter::new(1, echo_backend());
        let payload = limiter.new_payload();
        payload.set_state(PayloadState::Executing);
        assert!(limiter.enqueue_payload(payload).is_err());
    }

    #[test]
    fn test_add_slots() {
        let limiter = SlotLimiter::new(0, echo_backend());
        assert!(!limiter.slot_available());
        limiter.add_slots(2);
        assert!(limiter.slot_available());
    }
}
