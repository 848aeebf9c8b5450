// src/lineage.rs

//! Data units and their producing-operator lineage.
//!
//! Every data unit carries the set of operators that contributed to it,
//! directly or transitively. The scheduler refuses to bind a unit to an
//! operator that already appears in its ancestry, which is what keeps the
//! dataflow acyclic.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{DatamillError, Result};
use crate::run::Run;
use crate::types::{DataKindName, DataUnitId, OperatorName};

/// One concrete artifact in a run's data pool. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataUnit {
    pub id: DataUnitId,
    pub data_kind: DataKindName,
    pub ancestors: BTreeSet<OperatorName>,
}

impl DataUnit {
    pub fn new(data_kind: impl Into<DataKindName>, ancestors: BTreeSet<OperatorName>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            data_kind: data_kind.into(),
            ancestors,
        }
    }

    /// A unit uploaded from outside the run: no ancestry.
    pub fn uploaded(data_kind: impl Into<DataKindName>) -> Self {
        Self::new(data_kind, BTreeSet::new())
    }

    pub fn descends_from(&self, operator: &str) -> bool {
        self.ancestors.contains(operator)
    }
}

/// Ancestry for a unit produced by `step_id`: the union of the ancestors of
/// every input bound to that step, plus the step's own operator.
pub fn ancestors_for_step(run: &Run, step_id: &str) -> Result<BTreeSet<OperatorName>> {
    let step = run
        .step(step_id)
        .ok_or_else(|| DatamillError::step_not_found(step_id))?;

    let mut ancestors = BTreeSet::new();
    for unit_id in step.input_data_units.values() {
        let unit = run.data_unit(unit_id).ok_or_else(|| DatamillError::NotFound {
            kind: "data unit",
            id: unit_id.clone(),
        })?;
        ancestors.extend(unit.ancestors.iter().cloned());
    }
    ancestors.insert(step.operator.clone());

    Ok(ancestors)
}

/// Check the lineage invariants of a run document, returning a description of
/// every violation found.
///
/// - each step's output carries the step's operator and every ancestor of
///   the step's inputs
/// - no step consumes a unit its own operator helped produce
pub fn lineage_violations(run: &Run) -> Vec<String> {
    let mut violations = Vec::new();

    for step in &run.steps {
        let mut input_ancestors = BTreeSet::new();
        for (slot, unit_id) in &step.input_data_units {
            match run.data_unit(unit_id) {
                Some(unit) => {
                    if unit.descends_from(&step.operator) {
                        violations.push(format!(
                            "step {} ({}) consumes {} in slot {} which it helped produce",
                            step.id, step.operator, unit.id, slot
                        ));
                    }
                    input_ancestors.extend(unit.ancestors.iter().cloned());
                }
                None => violations.push(format!(
                    "step {} binds missing data unit {} to slot {}",
                    step.id, unit_id, slot
                )),
            }
        }

        for out_id in &step.output_data_units {
            let Some(unit) = run.data_unit(out_id) else {
                violations.push(format!(
                    "step {} lists missing output unit {}",
                    step.id, out_id
                ));
                continue;
            };
            if !unit.descends_from(&step.operator) {
                violations.push(format!(
                    "output {} of step {} lacks producer {} in its ancestry",
                    unit.id, step.id, step.operator
                ));
            }
            if !unit.ancestors.is_superset(&input_ancestors) {
                violations.push(format!(
                    "output {} of step {} drops ancestors of its inputs",
                    unit.id, step.id
                ));
            }
        }
    }

    violations
}
