// src/dag/scheduler_step.rs

//! Result types for a single discovery pass.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{DataUnitId, OperatorName, SlotName};

/// A newly runnable operator invocation: the `(operator, inputs)` identity
/// key of a step that does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepInvocation {
    pub operator: OperatorName,
    pub inputs: BTreeMap<SlotName, DataUnitId>,
}

impl StepInvocation {
    /// Whether two slots are bound to the same data unit.
    pub fn reuses_a_unit(&self) -> bool {
        let distinct: BTreeSet<&DataUnitId> = self.inputs.values().collect();
        distinct.len() != self.inputs.len()
    }
}

/// Structured result of one scheduler pass.
///
/// The counters are for logging and tests that want to see how far each
/// candidate got through the filters.
#[derive(Debug, Clone, Default)]
pub struct SchedulerPass {
    /// One-based pass number within the run.
    pub pass: usize,
    /// Operators whose input kinds are all present in the pool.
    pub immediately_available: Vec<OperatorName>,
    /// Of those, operators with at least one eligible unit per slot.
    pub actually_available: Vec<OperatorName>,
    /// Raw cartesian bindings considered before filtering.
    pub bindings_considered: usize,
    /// Bindings dropped because they reuse a unit across slots.
    pub dropped_reused_unit: usize,
    /// Bindings dropped because an identical step already exists.
    pub dropped_existing: usize,
    /// New invocations to commit this pass.
    pub invocations: Vec<StepInvocation>,
}

impl SchedulerPass {
    /// No new invocations: the run has reached its fixed point.
    pub fn is_fixed_point(&self) -> bool {
        self.invocations.is_empty()
    }
}
