//! Custom batching hooks.
//!
//! A model may install its own include/exclude logic on top of the size and
//! shape policies. The hook owns an opaque state value whose lifetime is
//! bracketed by `init` (new payload) and `fini` (payload dispatch or cursor
//! reset); `include` is consulted for every candidate request during the
//! batch-formation scan.
//!
//! Hook errors never fail a request: the scheduler logs them, and a failing
//! `include` counts as "do not include".

use std::any::Any;

use crate::error::Result;
use crate::request::InferenceRequest;

/// Model-supplied batching hooks.
pub trait CustomBatcher: Send + Sync {
    /// Create the per-payload state. Called whenever the scheduler starts a
    /// new payload.
    fn init(&self) -> Result<Box<dyn Any + Send>>;

    /// Decide whether `request` may join the forming batch.
    fn include(&self, request: &InferenceRequest, state: &mut dyn Any) -> Result<bool>;

    /// Tear down the per-payload state. Called before the payload is handed
    /// to the rate limiter, and when the scan cursor is reset.
    fn fini(&self, state: Box<dyn Any + Send>) -> Result<()>;
}
