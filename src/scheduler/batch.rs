//! Batch formation: deciding what to seal, what to wait for.
//!
//! The engine runs with the scheduler state lock and the current payload's
//! execution mutex held, scanning the queue at its cursor. It returns a wait
//! in microseconds: 0 means "seal and dispatch the pending batch now", a
//! positive value means "reassess after this long (or on the next wakeup)".

use tracing::warn;

use super::{SchedState, SchedulerCore};
use crate::now_ns;
use crate::payload::PayloadInner;

impl SchedulerCore {
    pub(crate) fn get_dynamic_batch(
        &self,
        state: &mut SchedState,
        payload: &mut PayloadInner,
    ) -> u64 {
        let mut send_now = false;

        // If the previous scan's prefix was never executed, restart from the
        // queue front and rebuild any custom-batching state.
        if !state.queue.is_cursor_valid() {
            state.queue.reset_cursor();
            state.pending_batch_size = 0;
            if self.custom_batch_enabled() {
                self.custom_batch_fini(payload);
                self.custom_batch_init(payload);
            }
        }

        let mut best_preferred_batch_size: u64 = 0;
        state.queued_batch_size = state
            .queued_batch_size
            .saturating_sub(state.queue.apply_policy_at_cursor());

        // With optional inputs or enforced shapes, every candidate's inputs
        // must be examined while forming the batch.
        let check_input = !self.config.enforce_equal_shape_tensors.is_empty()
            || self.config.has_optional_input;
        let payload_batch_size = payload.batch_size;

        while !state.queue.cursor_end() {
            let batch_size = state.queue.request_at_cursor().effective_batch_size();

            if payload_batch_size + state.queue.pending_batch_count() as u64 == 0 {
                // This request starts a new batch; its shapes become the
                // contract for everything that follows.
                if check_input {
                    if let Err(e) = payload.required_equal.initialize(
                        state.queue.request_at_cursor(),
                        &self.config.enforce_equal_shape_tensors,
                        self.config.has_optional_input,
                    ) {
                        warn!("cannot start batch from malformed request: {e}");
                        send_now = true;
                        break;
                    }
                }
            } else {
                // Adding this request would outgrow every preferred size.
                // Remember the batch as it stands, but keep scanning so the
                // delay and timeout logic below sees the whole queue.
                if payload_batch_size + state.pending_batch_size + batch_size
                    > self.max_preferred_batch_size
                    && best_preferred_batch_size == 0
                {
                    best_preferred_batch_size = state.pending_batch_size;
                    state.queue.mark_cursor();
                    state.payload_saturated = true;
                }

                if payload_batch_size + state.pending_batch_size + batch_size
                    > u64::from(self.config.max_batch_size)
                {
                    send_now = true;
                    break;
                }

                // A shape disagreement seals the pending batch as it is.
                if check_input
                    && !payload
                        .required_equal
                        .has_equal_inputs(state.queue.request_at_cursor())
                {
                    payload.saturated = true;
                    send_now = true;
                    break;
                }
            }

            if self.custom_batch_enabled()
                && !self.custom_batch_include(state.queue.request_at_cursor(), payload)
            {
                payload.saturated = true;
                send_now = true;
                break;
            }

            state.pending_batch_size += batch_size;
            state.queue.advance_cursor();
            state.queued_batch_size = state
                .queued_batch_size
                .saturating_sub(state.queue.apply_policy_at_cursor());

            if self
                .config
                .preferred_batch_sizes
                .contains(&((state.pending_batch_size + payload_batch_size) as u32))
            {
                best_preferred_batch_size = state.pending_batch_size;
                state.queue.mark_cursor();
            }
        }

        let now = now_ns();
        let delay_ns = now.saturating_sub(state.queue.oldest_enqueue_time());
        let delay_is_exceeded =
            self.max_queue_delay_ns != 0 && delay_ns >= self.max_queue_delay_ns;

        // A preferred size was reached and requests aren't overdue: rewind
        // to the marked boundary and execute exactly that.
        if best_preferred_batch_size != 0 && !delay_is_exceeded {
            if self.max_queue_delay_ns == 0 {
                state.payload_saturated = true;
            }
            state.pending_batch_size = best_preferred_batch_size;
            state.queue.set_cursor_to_mark();
            return 0;
        }

        // Everything queued had expired; the caller picks up the rejections.
        if state.queue.pending_batch_count() == 0 {
            return 0;
        }

        // The batch can't grow any further: execute what is pending.
        if send_now
            || payload_batch_size + state.pending_batch_size >= self.max_preferred_batch_size
        {
            state.payload_saturated = true;
            return 0;
        }

        if delay_is_exceeded || self.max_queue_delay_ns == 0 {
            return 0;
        }

        // Tell the enqueue path how much more work would make waking the
        // batcher worthwhile.
        let total = (state.pending_batch_size + payload_batch_size) as u32;
        state.next_preferred_batch_size = match self
            .config
            .preferred_batch_sizes
            .range(total.saturating_add(1)..)
            .next()
        {
            Some(size) => u64::from(*size),
            None => self
                .config
                .preferred_batch_sizes
                .iter()
                .next()
                .copied()
                .map(u64::from)
                .unwrap_or(0),
        };
        if state.next_preferred_batch_size != 0 {
            state.next_preferred_batch_size = state
                .next_preferred_batch_size
                .saturating_sub(payload_batch_size);
        }

        // A growable payload that is not at a preferred size should reach
        // the model instance rather than idle here: let the rate limiter
        // start the imperfect batch.
        if !state.payload_saturated
            && payload_batch_size != 0
            && !self
                .config
                .preferred_batch_sizes
                .contains(&(payload_batch_size as u32))
        {
            return 0;
        }

        // Wait out the remaining queue delay, clipped to the closest
        // per-request deadline so expirations are noticed promptly.
        let mut wait_ns = self.max_queue_delay_ns - delay_ns;
        let closest_timeout = state.queue.closest_timeout();
        if closest_timeout != 0 {
            if now <= closest_timeout {
                wait_ns = wait_ns.min(closest_timeout - now);
            } else {
                // A pending request already timed out; force a near-immediate
                // pass so the rejection path runs.
                wait_ns = 1000;
            }
        }

        wait_ns / 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::SlotLimiter;
    use crate::payload::Payload;
    use crate::request::{InferenceRequest, Tensor};
    use crate::scheduler::BatcherConfig;
    use bytes::Bytes;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_core(config: BatcherConfig) -> Arc<SchedulerCore> {
        let limiter = SlotLimiter::new(1, Arc::new(|_: &mut [InferenceRequest]| {}));
        SchedulerCore::new(config, limiter, None, None)
    }

    fn config_4_8() -> BatcherConfig {
        BatcherConfig {
            max_batch_size: 16,
            preferred_batch_sizes: BTreeSet::from([4, 8]),
            max_queue_delay: Duration::from_millis(10),
            ..BatcherConfig::default()
        }
    }

    fn enqueue_n(core: &SchedulerCore, n: usize) {
        let mut state = core.state.lock().unwrap();
        for i in 0..n {
            state.queued_batch_size += 1;
            state
                .queue
                .enqueue(InferenceRequest::new(format!("r{i}"), vec![]))
                .unwrap();
        }
    }

    fn run_engine(core: &SchedulerCore) -> (u64, usize, u64) {
        let mut state = core.state.lock().unwrap();
        let payload = Arc::clone(&state.curr_payload);
        let mut inner = payload.lock();
        let wait_us = core.get_dynamic_batch(&mut state, &mut inner);
        (wait_us, state.queue.pending_batch_count(), state.pending_batch_size)
    }

    #[test]
    fn test_preferred_size_seals_immediately() {
        let core = test_core(config_4_8());
        enqueue_n(&core, 4);

        let (wait_us, pending_count, pending_size) = run_engine(&core);
        assert_eq!(wait_us, 0);
        assert_eq!(pending_count, 4);
        assert_eq!(pending_size, 4);
    }

    #[test]
    fn test_partial_batch_waits_out_the_delay() {
        let core = test_core(config_4_8());
        enqueue_n(&core, 3);

        let (wait_us, pending_count, pending_size) = run_engine(&core);
        assert!(wait_us > 0);
        assert!(wait_us <= 10_000);
        assert_eq!(pending_count, 3);
        assert_eq!(pending_size, 3);
        // The enqueue path now knows a 4th request completes a batch.
        assert_eq!(
            core.state.lock().unwrap().next_preferred_batch_size,
            4
        );
    }

    #[test]
    fn test_best_preferred_rewinds_cursor() {
        let core = test_core(config_4_8());
        enqueue_n(&core, 9);

        let (wait_us, pending_count, pending_size) = run_engine(&core);
        assert_eq!(wait_us, 0);
        // 9 would outgrow the largest preferred size of 8; the scan rewinds
        // to the marked boundary and the 9th stays queued.
        assert_eq!(pending_count, 8);
        assert_eq!(pending_size, 8);
        assert_eq!(core.state.lock().unwrap().queue.size(), 9);
    }

    #[test]
    fn test_max_batch_size_is_a_hard_stop() {
        let mut config = config_4_8();
        config.max_batch_size = 4;
        config.preferred_batch_sizes = BTreeSet::from([16]);
        let core = test_core(config);
        enqueue_n(&core, 6);

        let (wait_us, pending_count, pending_size) = run_engine(&core);
        assert_eq!(wait_us, 0);
        assert_eq!(pending_count, 4);
        assert_eq!(pending_size, 4);
        assert!(core.state.lock().unwrap().payload_saturated);
    }

    #[test]
    fn test_shape_mismatch_seals_batch() {
        let mut config = config_4_8();
        config.enforce_equal_shape_tensors = [("input".to_string(), true)].into();
        let core = test_core(config);

        {
            let mut state = core.state.lock().unwrap();
            for (id, cols) in [("a", 3), ("b", 4)] {
                state.queued_batch_size += 1;
                state
                    .queue
                    .enqueue(InferenceRequest::new(
                        id,
                        vec![Tensor::new("input", vec![1, cols], Bytes::new())],
                    ))
                    .unwrap();
            }
        }

        let (wait_us, pending_count, pending_size) = run_engine(&core);
        assert_eq!(wait_us, 0);
        assert_eq!(pending_count, 1);
        assert_eq!(pending_size, 1);

        let state = core.state.lock().unwrap();
        let payload = Arc::clone(&state.curr_payload);
        drop(state);
        assert!(payload.is_saturated());
    }

    #[test]
    fn test_zero_delay_always_sends() {
        let mut config = config_4_8();
        config.max_queue_delay = Duration::ZERO;
        let core = test_core(config);
        enqueue_n(&core, 1);

        let (wait_us, pending_count, _) = run_engine(&core);
        assert_eq!(wait_us, 0);
        assert_eq!(pending_count, 1);
    }

    #[test]
    fn test_all_expired_returns_zero_with_rejections() {
        let core = test_core(config_4_8());
        {
            let mut state = core.state.lock().unwrap();
            for i in 0..2 {
                state.queued_batch_size += 1;
                state
                    .queue
                    .enqueue(
                        InferenceRequest::new(format!("r{i}"), vec![])
                            .with_timeout(Duration::from_nanos(1)),
                    )
                    .unwrap();
            }
        }
        std::thread::sleep(Duration::from_millis(2));

        let (wait_us, pending_count, _) = run_engine(&core);
        assert_eq!(wait_us, 0);
        assert_eq!(pending_count, 0);

        let mut state = core.state.lock().unwrap();
        let rejected: Vec<_> = state
            .queue
            .release_rejected_requests()
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(rejected.len(), 2);
        assert_eq!(state.queued_batch_size, 0);
    }

    #[test]
    fn test_wait_clipped_by_closest_request_timeout() {
        let mut config = config_4_8();
        config.max_queue_delay = Duration::from_secs(10);
        let core = test_core(config);
        {
            let mut state = core.state.lock().unwrap();
            state.queued_batch_size += 1;
            state
                .queue
                .enqueue(
                    InferenceRequest::new("r0", vec![])
                        .with_timeout(Duration::from_millis(50)),
                )
                .unwrap();
        }

        let (wait_us, _, _) = run_engine(&core);
        assert!(wait_us > 0);
        assert!(wait_us <= 50_000);
    }

    #[test]
    fn test_rescan_without_changes_is_stable() {
        let core = test_core(config_4_8());
        enqueue_n(&core, 3);

        let (first_wait, first_count, first_size) = run_engine(&core);
        let (second_wait, second_count, second_size) = run_engine(&core);

        assert!(first_wait > 0);
        assert!(second_wait > 0);
        assert!(second_wait <= first_wait);
        assert_eq!(first_count, second_count);
        assert_eq!(first_size, second_size);
    }

    #[test]
    fn test_growable_payload_is_released_to_limiter() {
        let core = test_core(config_4_8());

        // A payload of size 2 is already scheduled (not a preferred size,
        // not saturated) and one more request arrives.
        {
            let mut state = core.state.lock().unwrap();
            state.curr_payload = Arc::new(Payload::new());
            state.curr_payload.add_request(
                InferenceRequest::new("p0", vec![]).with_batch_size(2),
            );
            state.queued_batch_size += 1;
            state
                .queue
                .enqueue(InferenceRequest::new("r0", vec![]))
                .unwrap();
        }

        // Rather than waiting out the delay, the scan releases the request
        // so the in-flight payload grows.
        let (wait_us, pending_count, _) = run_engine(&core);
        assert_eq!(wait_us, 0);
        assert_eq!(pending_count, 1);
        assert!(!core.state.lock().unwrap().payload_saturated);
    }

    #[test]
    fn test_empty_preferred_sizes_sends_singletons() {
        let mut config = config_4_8();
        config.preferred_batch_sizes = BTreeSet::new();
        let core = test_core(config);
        enqueue_n(&core, 3);

        // With no preferred sizes the first request alone is always the
        // "best" batch.
        let (wait_us, pending_count, pending_size) = run_engine(&core);
        assert_eq!(wait_us, 0);
        assert_eq!(pending_count, 1);
        assert_eq!(pending_size, 1);
    }
}
