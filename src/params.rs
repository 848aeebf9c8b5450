// src/params.rs

//! Operator parameter merging.

use crate::catalog::{EnvVar, Operator, ParamSpec};
use crate::run::{Param, ParamPool};

/// Resolve every parameter the operator declares.
///
/// The caller's value wins when one is supplied for that name and is not
/// null; otherwise the declared default is used. Supplied parameters the
/// operator does not declare are ignored.
pub fn merge_params(declared: &[ParamSpec], supplied: Option<&[Param]>) -> Vec<EnvVar> {
    declared
        .iter()
        .map(|spec| {
            let given = supplied
                .unwrap_or_default()
                .iter()
                .find(|p| p.name == spec.name)
                .and_then(|p| p.value.clone());

            EnvVar {
                name: spec.name.clone(),
                value: given.unwrap_or_else(|| spec.default_value.clone()),
            }
        })
        .collect()
}

/// The parameters an operator exposes, as listed to callers before a run.
pub fn listed_params(operator: &Operator) -> Vec<Param> {
    operator
        .configurable_env
        .iter()
        .map(|spec| Param {
            name: spec.name.clone(),
            value: None,
            default_value: Some(spec.default_value.clone()),
        })
        .collect()
}

/// Parameters for `operator` taken from a run's parameter pool.
pub fn params_for<'a>(pool: &'a ParamPool, operator: &str) -> Option<&'a [Param]> {
    pool.get(operator).map(Vec::as_slice)
}
