use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;

use datamill::catalog::Catalog;
use datamill::dag::{Scheduler, SchedulerLimits};
use datamill::errors::DatamillError;
use datamill::lineage::{DataUnit, ancestors_for_step, lineage_violations};
use datamill::run::{Run, RunStep};
use datamill_test_utils::builders::{CatalogBuilder, OperatorBuilder, RunBuilder};

#[derive(Debug, Clone)]
struct OpShape {
    inputs: Vec<usize>,
    outputs: BTreeSet<usize>,
}

/// (number of kinds, operators, kinds of the uploaded units)
fn world_strategy() -> impl Strategy<Value = (usize, Vec<OpShape>, Vec<usize>)> {
    (1..=4usize).prop_flat_map(|kinds| {
        let op = (
            proptest::collection::vec(0..kinds, 1..=2),
            proptest::collection::btree_set(0..kinds, 0..=2),
        )
            .prop_map(|(inputs, outputs)| OpShape { inputs, outputs });
        (
            Just(kinds),
            proptest::collection::vec(op, 1..=4),
            proptest::collection::vec(0..kinds, 1..=3),
        )
    })
}

fn build_catalog(kinds: usize, ops: &[OpShape]) -> Catalog {
    let kind_names: Vec<String> = (0..kinds).map(|k| format!("k{k}")).collect();
    let mut builder = CatalogBuilder::new();
    for name in &kind_names {
        builder = builder.kind(name);
    }
    for (i, shape) in ops.iter().enumerate() {
        let mut op = OperatorBuilder::new(&format!("op{i}"));
        for (slot, kind) in shape.inputs.iter().enumerate() {
            op = op.input(&format!("S{slot}"), &kind_names[*kind]);
        }
        for kind in &shape.outputs {
            op = op.output(&kind_names[*kind]);
        }
        builder = builder.operator(op.build());
    }
    builder.build()
}

fn seed_run(uploads: &[usize]) -> Run {
    let mut run = RunBuilder::new();
    for (i, kind) in uploads.iter().enumerate() {
        run = run.upload(&format!("up{i}"), &format!("k{kind}"));
    }
    run.build()
}

/// Run passes the way the driver does, with every step succeeding at once
/// and producing one unit of each kind its operator may produce.
///
/// Returns the final run and the number of passes, checking the lineage
/// invariants after every pass.
fn drive_to_fixed_point(sched: &Scheduler, mut run: Run) -> Result<(Run, usize), DatamillError> {
    let mut next_unit = 0usize;
    let mut pass = 0usize;

    loop {
        pass += 1;
        let outcome = sched.run_pass(pass, &run)?;
        if outcome.is_fixed_point() {
            return Ok((run, pass));
        }

        for invocation in outcome.invocations {
            let step = RunStep::new(invocation.operator, invocation.inputs);
            let step_id = step.id.clone();
            run.steps.push(step);

            let outputs = sched
                .catalog()
                .operator(&run.steps.last().unwrap().operator)
                .unwrap()
                .possible_output_kinds
                .clone();
            for kind in outputs {
                let ancestors = ancestors_for_step(&run, &step_id).unwrap();
                next_unit += 1;
                let unit = DataUnit {
                    id: format!("u{next_unit}"),
                    data_kind: kind,
                    ancestors,
                };
                run.step_mut(&step_id)
                    .unwrap()
                    .output_data_units
                    .push(unit.id.clone());
                run.data_pool.push(unit);
            }
        }

        let violations = lineage_violations(&run);
        assert!(violations.is_empty(), "pass {pass}: {violations:?}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn passes_never_create_cycles_and_terminate((kinds, ops, uploads) in world_strategy()) {
        let catalog = build_catalog(kinds, &ops);
        let sched = Scheduler::new(
            Arc::new(catalog),
            SchedulerLimits { max_passes: 50, max_bindings_per_pass: 5_000 },
        );

        match drive_to_fixed_point(&sched, seed_run(&uploads)) {
            Ok((run, passes)) => {
                // Every produced unit strictly grows its ancestry, so chains
                // are at most as long as the catalog.
                prop_assert!(passes <= ops.len() + 2, "took {passes} passes");

                let keys: BTreeSet<_> = run
                    .steps
                    .iter()
                    .map(|s| (s.operator.clone(), s.input_data_units.clone()))
                    .collect();
                prop_assert_eq!(keys.len(), run.steps.len(), "duplicate step identity");

                // Nothing is left to discover.
                prop_assert!(sched.discover(&run).unwrap().is_fixed_point());
            }
            Err(DatamillError::ResourceExhausted(_)) => {}
            Err(e) => prop_assert!(false, "unexpected error: {e}"),
        }
    }

    #[test]
    fn discovery_is_deterministic((kinds, ops, uploads) in world_strategy()) {
        let sched = Scheduler::new(Arc::new(build_catalog(kinds, &ops)), SchedulerLimits::default());
        let run = seed_run(&uploads);

        let first = sched.discover(&run).unwrap();
        let second = sched.discover(&run).unwrap();
        prop_assert_eq!(first.invocations, second.invocations);
    }
}
