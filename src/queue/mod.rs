//! Multi-level priority queue with a non-destructive scan cursor.
//!
//! Each priority level is an ordered queue with its own policy (capacity,
//! default timeout, overflow behavior). Batch formation walks the levels
//! lowest-numbered first through a cursor without dequeuing, so a scan can
//! be abandoned or rewound to a marked position. Requests whose queue
//! deadline expires are moved to per-level rejection lists as the cursor
//! reaches them and are surfaced to the scheduler in one batch.

mod policy;

pub use policy::{OverflowAction, QueuePolicy};

use std::collections::{HashMap, VecDeque};

use crate::error::{RejectedRequest, ScheduleError};
use crate::now_ns;
use crate::request::InferenceRequest;

/// One priority level: its policy, queued requests and rejected requests
/// awaiting release.
struct PolicyQueue {
    policy: QueuePolicy,
    queue: VecDeque<InferenceRequest>,
    rejected: Vec<(InferenceRequest, ScheduleError)>,
}

impl PolicyQueue {
    fn new(policy: QueuePolicy) -> Self {
        Self { policy, queue: VecDeque::new(), rejected: Vec::new() }
    }
}

/// Scan position: level index plus offset within the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct CursorPos {
    level: usize,
    index: usize,
}

/// Priority queue across all levels of one scheduler.
pub(crate) struct PriorityQueue {
    levels: Vec<PolicyQueue>,
    cursor: CursorPos,
    cursor_valid: bool,
    pending_count: usize,
    /// Earliest deadline among requests the cursor has accepted; once it
    /// passes, the scanned prefix is stale and the cursor reads as invalid.
    pending_closest_timeout_ns: u64,
    /// Saved cursor state for rewinding to the best preferred batch
    /// boundary: position, pending count, pending closest timeout.
    mark: Option<(CursorPos, usize, u64)>,
}

impl PriorityQueue {
    /// Create the queue with `priority_levels` levels (at least one).
    /// Level policies come from `overrides`, falling back to `default_policy`.
    pub(crate) fn new(
        default_policy: QueuePolicy,
        priority_levels: u32,
        overrides: &HashMap<u32, QueuePolicy>,
    ) -> Self {
        let count = priority_levels.max(1) as usize;
        let levels = (0..count)
            .map(|level| {
                let policy = overrides
                    .get(&(level as u32))
                    .cloned()
                    .unwrap_or_else(|| default_policy.clone());
                PolicyQueue::new(policy)
            })
            .collect();
        Self {
            levels,
            cursor: CursorPos::default(),
            cursor_valid: false,
            pending_count: 0,
            pending_closest_timeout_ns: 0,
            mark: None,
        }
    }

    /// Total queued requests across all levels
    pub(crate) fn size(&self) -> usize {
        self.levels.iter().map(|l| l.queue.len()).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.levels.iter().all(|l| l.queue.is_empty())
    }

    /// Append `request` to its priority level, applying the level's policy.
    ///
    /// On success the queue owns the request and its deadline is installed
    /// from the per-request timeout or the level's default; the returned
    /// value is the declared batch size of an entry evicted to make room
    /// (0 when nothing was evicted). Priorities beyond the configured level
    /// count are clamped to the last level.
    pub(crate) fn enqueue(
        &mut self,
        mut request: InferenceRequest,
    ) -> Result<u64, RejectedRequest> {
        let level = (request.priority() as usize).min(self.levels.len() - 1);
        let max = self.levels[level].policy.max_queue_size;
        let mut evicted_size = 0u64;

        if max > 0 && self.levels[level].queue.len() >= max {
            match self.levels[level].policy.overflow_action {
                OverflowAction::Reject => {
                    return Err(RejectedRequest {
                        request,
                        error: ScheduleError::Overflow { level: level as u32, max },
                    });
                }
                OverflowAction::Delay => {
                    // Evict the oldest entry at this level to make room. If
                    // the cursor has already scanned into or past it, the
                    // scanned prefix is no longer meaningful.
                    if let Some(evicted) = self.levels[level].queue.pop_front() {
                        if self.cursor_valid
                            && (self.cursor.level > level
                                || (self.cursor.level == level && self.cursor.index > 0))
                        {
                            self.invalidate_cursor();
                        }
                        tracing::debug!(
                            id = %evicted.id,
                            level,
                            "evicting oldest queued request to admit newcomer"
                        );
                        evicted_size = evicted.effective_batch_size();
                        self.levels[level].rejected.push((
                            evicted,
                            ScheduleError::Overflow { level: level as u32, max },
                        ));
                    }
                }
            }
        }

        let now = now_ns();
        if request.batcher_start_ns == 0 {
            request.batcher_start_ns = now;
        }
        let timeout = request
            .timeout()
            .or(self.levels[level].policy.default_timeout);
        request.deadline_ns = match timeout {
            Some(t) => now + t.as_nanos() as u64,
            None => 0,
        };

        // A request landing ahead of the cursor belongs to the region the
        // scan has already walked; force a rescan.
        if self.cursor_valid && level < self.cursor.level {
            self.invalidate_cursor();
        }

        self.levels[level].queue.push_back(request);
        Ok(evicted_size)
    }

    fn invalidate_cursor(&mut self) {
        self.cursor_valid = false;
        self.mark = None;
    }

    /// Skip levels the position has exhausted.
    fn normalized(&self, mut pos: CursorPos) -> CursorPos {
        while pos.level < self.levels.len() && pos.index >= self.levels[pos.level].queue.len() {
            pos.level += 1;
            pos.index = 0;
        }
        pos
    }

    /// Place the cursor at the global front and forget any scanned prefix
    pub(crate) fn reset_cursor(&mut self) {
        self.cursor = CursorPos::default();
        self.cursor_valid = true;
        self.pending_count = 0;
        self.pending_closest_timeout_ns = 0;
        self.mark = None;
    }

    /// A cursor is invalid after structural changes ahead of it, and also
    /// once any request it accepted runs past its deadline: the prefix must
    /// then be rescanned so the expired entry lands in the rejection list.
    pub(crate) fn is_cursor_valid(&self) -> bool {
        if !self.cursor_valid {
            return false;
        }
        self.pending_closest_timeout_ns == 0 || now_ns() < self.pending_closest_timeout_ns
    }

    /// Whether the cursor has walked past the last queued request
    pub(crate) fn cursor_end(&self) -> bool {
        self.normalized(self.cursor).level >= self.levels.len()
    }

    /// The request under the cursor. Callers must check `cursor_end` first.
    pub(crate) fn request_at_cursor(&self) -> &InferenceRequest {
        let pos = self.normalized(self.cursor);
        &self.levels[pos.level].queue[pos.index]
    }

    /// Accept the request under the cursor into the pending batch
    pub(crate) fn advance_cursor(&mut self) {
        let pos = self.normalized(self.cursor);
        if pos.level < self.levels.len() {
            let deadline = self.levels[pos.level].queue[pos.index].deadline_ns;
            if deadline != 0
                && (self.pending_closest_timeout_ns == 0
                    || deadline < self.pending_closest_timeout_ns)
            {
                self.pending_closest_timeout_ns = deadline;
            }
        }
        self.cursor = CursorPos { level: pos.level, index: pos.index + 1 };
        self.pending_count += 1;
    }

    /// Number of requests the cursor has accepted this scan
    pub(crate) fn pending_batch_count(&self) -> usize {
        self.pending_count
    }

    /// Save the current cursor position
    pub(crate) fn mark_cursor(&mut self) {
        self.mark = Some((
            self.normalized(self.cursor),
            self.pending_count,
            self.pending_closest_timeout_ns,
        ));
    }

    /// Rewind the cursor to the saved mark
    pub(crate) fn set_cursor_to_mark(&mut self) {
        if let Some((pos, pending, closest)) = self.mark {
            self.cursor = pos;
            self.pending_count = pending;
            self.pending_closest_timeout_ns = closest;
        }
    }

    /// Reject requests at the cursor whose deadline has expired, advancing
    /// past them. Returns the total declared batch size rejected.
    pub(crate) fn apply_policy_at_cursor(&mut self) -> u64 {
        let now = now_ns();
        let mut rejected_size = 0u64;
        loop {
            let pos = self.normalized(self.cursor);
            self.cursor = pos;
            if pos.level >= self.levels.len() {
                break;
            }
            if !self.levels[pos.level].queue[pos.index].is_expired(now) {
                break;
            }
            // Removal shifts later entries down, so the cursor index now
            // addresses the next request. The mark always sits at or before
            // the cursor and is unaffected.
            if let Some(expired) = self.levels[pos.level].queue.remove(pos.index) {
                tracing::debug!(id = %expired.id, level = pos.level, "queued request timed out");
                rejected_size += expired.effective_batch_size();
                self.levels[pos.level]
                    .rejected
                    .push((expired, ScheduleError::TimeoutExpired));
            }
        }
        rejected_size
    }

    /// Drain the per-level rejection lists
    pub(crate) fn release_rejected_requests(
        &mut self,
    ) -> Vec<Vec<(InferenceRequest, ScheduleError)>> {
        self.levels
            .iter_mut()
            .map(|l| std::mem::take(&mut l.rejected))
            .collect()
    }

    /// Enqueue timestamp of the oldest queued request, 0 when empty
    pub(crate) fn oldest_enqueue_time(&self) -> u64 {
        self.levels
            .iter()
            .flat_map(|l| l.queue.iter())
            .map(|r| r.batcher_start_ns)
            .min()
            .unwrap_or(0)
    }

    /// Earliest queued deadline in monotonic ns, 0 when no request has one
    pub(crate) fn closest_timeout(&self) -> u64 {
        self.levels
            .iter()
            .flat_map(|l| l.queue.iter())
            .filter(|r| r.deadline_ns != 0)
            .map(|r| r.deadline_ns)
            .min()
            .unwrap_or(0)
    }

    /// Pop the frontmost request (most urgent level first). The scheduler
    /// calls this exactly `pending_batch_count` times after a scan, which
    /// consumes precisely the scanned prefix. Any structural pop leaves the
    /// cursor invalid for the next scan.
    pub(crate) fn dequeue(&mut self) -> Result<InferenceRequest, ScheduleError> {
        for level in &mut self.levels {
            if let Some(request) = level.queue.pop_front() {
                self.pending_count = self.pending_count.saturating_sub(1);
                self.invalidate_cursor();
                return Ok(request);
            }
        }
        Err(ScheduleError::internal(
            "queue is empty but the pending batch expects more requests",
        ))
    }
}
