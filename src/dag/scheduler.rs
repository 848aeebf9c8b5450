use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::catalog::{Catalog, Operator};
use crate::dag::cartesian::{SlotOptions, cartesian_product, product_size};
use crate::dag::scheduler_step::{SchedulerPass, StepInvocation};
use crate::errors::{DatamillError, Result};
use crate::lineage::DataUnit;
use crate::run::Run;

/// Bounds that stop a run from diverging.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerLimits {
    /// Maximum number of discovery passes in one run.
    pub max_passes: usize,
    /// Maximum number of raw cartesian bindings examined in one pass.
    pub max_bindings_per_pass: usize,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self {
            max_passes: 1000,
            max_bindings_per_pass: 10_000,
        }
    }
}

/// Discovers newly runnable operator invocations from a run snapshot.
///
/// The scheduler holds only the immutable catalog snapshot and its limits;
/// every pass is a pure function of the run document it is given. Operators
/// are visited in name order, slots in slot-name order and candidate units in
/// pool order, so the same snapshot always yields the same invocations in the
/// same order.
#[derive(Debug, Clone)]
pub struct Scheduler {
    catalog: Arc<Catalog>,
    limits: SchedulerLimits,
}

impl Scheduler {
    pub fn new(catalog: Arc<Catalog>, limits: SchedulerLimits) -> Self {
        Self { catalog, limits }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn limits(&self) -> SchedulerLimits {
        self.limits
    }

    /// Run discovery pass number `pass` (one-based) against `run`.
    ///
    /// Fails with `ResourceExhausted` if the pass budget is used up or the
    /// pass would examine more bindings than allowed.
    pub fn run_pass(&self, pass: usize, run: &Run) -> Result<SchedulerPass> {
        if pass > self.limits.max_passes {
            return Err(DatamillError::ResourceExhausted(format!(
                "run {} exceeded {} scheduling passes",
                run.id, self.limits.max_passes
            )));
        }

        let mut outcome = self.discover(run)?;
        outcome.pass = pass;

        info!(
            run_id = %run.id,
            pass,
            available = outcome.actually_available.len(),
            considered = outcome.bindings_considered,
            new_steps = outcome.invocations.len(),
            "scheduler pass finished"
        );

        Ok(outcome)
    }

    /// Compute the invocations that are runnable against `run` and not yet
    /// represented by a step.
    pub fn discover(&self, run: &Run) -> Result<SchedulerPass> {
        let mut outcome = SchedulerPass::default();

        let immediately = self.immediately_available(&run.data_pool);
        outcome.immediately_available = immediately.iter().map(|op| op.name.clone()).collect();

        let mut per_operator: Vec<(&Operator, SlotOptions)> = Vec::new();
        for op in immediately {
            let options = slot_options(op, &run.data_pool);
            if options.iter().all(|(_, units)| !units.is_empty()) {
                per_operator.push((op, options));
            } else {
                debug!(
                    run_id = %run.id,
                    operator = %op.name,
                    "no eligible units for at least one slot; skipping"
                );
            }
        }
        outcome.actually_available = per_operator.iter().map(|(op, _)| op.name.clone()).collect();

        // Size the whole pass before materialising anything.
        let mut total = 0usize;
        for (op, options) in &per_operator {
            total = product_size(options)
                .and_then(|n| total.checked_add(n))
                .filter(|n| *n <= self.limits.max_bindings_per_pass)
                .ok_or_else(|| {
                    DatamillError::ResourceExhausted(format!(
                        "run {}: binding candidates for operator '{}' exceed the limit of {} per pass",
                        run.id, op.name, self.limits.max_bindings_per_pass
                    ))
                })?;
        }
        outcome.bindings_considered = total;

        for (op, options) in &per_operator {
            for inputs in cartesian_product(options) {
                let invocation = StepInvocation {
                    operator: op.name.clone(),
                    inputs,
                };

                if invocation.reuses_a_unit() {
                    outcome.dropped_reused_unit += 1;
                    continue;
                }
                if run.has_step_with_identity(&invocation.operator, &invocation.inputs) {
                    outcome.dropped_existing += 1;
                    continue;
                }
                outcome.invocations.push(invocation);
            }
        }

        Ok(outcome)
    }

    /// Operators whose every input kind is present somewhere in `pool`.
    pub fn immediately_available(&self, pool: &[DataUnit]) -> Vec<&Operator> {
        let kinds: BTreeSet<&str> = pool.iter().map(|u| u.data_kind.as_str()).collect();
        self.catalog
            .operators()
            .iter()
            .filter(|op| op.input_kinds().is_subset(&kinds))
            .collect()
    }

    /// Operators that could eventually run starting from `pool`: the
    /// transitive closure over the kinds each reachable operator may produce.
    ///
    /// This ignores lineage and bindings; it answers "which parameters may
    /// matter for this run" and never commits anything.
    pub fn eventually_available(&self, pool: &[DataUnit]) -> Vec<&Operator> {
        let mut kinds: BTreeSet<&str> = pool.iter().map(|u| u.data_kind.as_str()).collect();
        let mut reached: BTreeSet<&str> = BTreeSet::new();

        loop {
            let new_ops: Vec<&Operator> = self
                .catalog
                .operators()
                .iter()
                .filter(|op| !reached.contains(op.name.as_str()))
                .filter(|op| op.input_kinds().is_subset(&kinds))
                .collect();

            if new_ops.is_empty() {
                break;
            }

            for op in new_ops {
                reached.insert(op.name.as_str());
                kinds.extend(op.possible_output_kinds.iter().map(String::as_str));
            }
        }

        self.catalog
            .operators()
            .iter()
            .filter(|op| reached.contains(op.name.as_str()))
            .collect()
    }
}

/// Per-slot candidate units for `op`: units of the slot's kind whose
/// ancestry does not already contain `op`.
///
/// Excluding descendants of `op` is what keeps the dataflow acyclic: an
/// operator never consumes anything it helped produce.
pub fn slot_options(op: &Operator, pool: &[DataUnit]) -> SlotOptions {
    op.inputs
        .iter()
        .map(|slot| {
            let units = pool
                .iter()
                .filter(|u| u.data_kind == slot.data_kind && !u.descends_from(&op.name))
                .map(|u| u.id.clone())
                .collect();
            (slot.name.clone(), units)
        })
        .collect()
}
