//! Equal-shape enforcement for batched inputs.
//!
//! Some backends can only batch requests whose named inputs have identical
//! shapes. The guard captures the expected shapes from the first request of
//! a forming batch and checks every later candidate against them. When the
//! model has optional inputs, the set of inputs present must also agree
//! across the batch.

use std::collections::HashMap;

use crate::error::{Result, ScheduleError};
use crate::request::InferenceRequest;

/// Shape descriptor for a forming batch.
#[derive(Debug, Default)]
pub struct RequiredEqualInputs {
    /// Tracked input name -> expected shape
    tracked: HashMap<String, Vec<i64>>,
    /// When optional inputs are possible, the exact set of inputs the first
    /// request carried. Presence must then match across the batch.
    check_presence: bool,
    input_count: usize,
}

impl RequiredEqualInputs {
    /// Capture the descriptor from the first request of a batch.
    ///
    /// Fails if a tensor named in `enforce_equal_shape` is missing from the
    /// request; the caller then seals the current batch.
    pub fn initialize(
        &mut self,
        request: &InferenceRequest,
        enforce_equal_shape: &HashMap<String, bool>,
        has_optional_input: bool,
    ) -> Result<()> {
        self.tracked.clear();
        self.check_presence = has_optional_input;
        self.input_count = request.inputs().len();

        for (name, enforced) in enforce_equal_shape {
            if !enforced {
                continue;
            }
            match request.input(name) {
                Some(tensor) => {
                    self.tracked.insert(name.clone(), tensor.shape.clone());
                }
                None => {
                    return Err(ScheduleError::internal(format!(
                        "request '{}' is missing enforced-equal-shape input '{}'",
                        request.id, name
                    )));
                }
            }
        }

        if has_optional_input {
            // Every input's presence and shape becomes part of the contract.
            for tensor in request.inputs() {
                self.tracked
                    .entry(tensor.name.clone())
                    .or_insert_with(|| tensor.shape.clone());
            }
        }

        Ok(())
    }

    /// Whether `request` is batchable with the captured descriptor.
    pub fn has_equal_inputs(&self, request: &InferenceRequest) -> bool {
        if self.check_presence {
            // Same inputs present, no extras and no absences.
            if request.inputs().len() != self.input_count {
                return false;
            }
            for tensor in request.inputs() {
                if !self.tracked.contains_key(&tensor.name) {
                    return false;
                }
            }
        }

        for (name, shape) in &self.tracked {
            match request.input(name) {
                Some(tensor) if &tensor.shape == shape => {}
                _ => return false,
            }
        }

        true
    }
}
