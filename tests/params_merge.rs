// tests/params_merge.rs

use datamill::catalog::{EnvVar, ParamSpec};
use datamill::exec::JobSpec;
use datamill::exec::job_spec::OUTPUT_DIR_ENV;
use datamill::params::{listed_params, merge_params};
use datamill::run::{Param, RunStep};
use datamill_test_utils::builders::{OperatorBuilder, RunBuilder, bindings};

fn spec(name: &str, default_value: &str) -> ParamSpec {
    ParamSpec {
        name: name.to_string(),
        default_value: default_value.to_string(),
    }
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: value.to_string(),
    }
}

#[test]
fn defaults_apply_when_nothing_is_supplied() {
    let declared = vec![spec("PRECISION", "2"), spec("MODE", "fast")];
    assert_eq!(
        merge_params(&declared, None),
        vec![env("PRECISION", "2"), env("MODE", "fast")]
    );
}

#[test]
fn supplied_values_win_and_null_values_fall_back() {
    let declared = vec![spec("PRECISION", "2"), spec("MODE", "fast")];
    let supplied = vec![
        Param::with_value("PRECISION", "5"),
        Param {
            name: "MODE".to_string(),
            value: None,
            default_value: Some("ignored".to_string()),
        },
    ];

    assert_eq!(
        merge_params(&declared, Some(supplied.as_slice())),
        vec![env("PRECISION", "5"), env("MODE", "fast")]
    );
}

#[test]
fn undeclared_parameters_are_ignored() {
    let declared = vec![spec("PRECISION", "2")];
    let supplied = vec![Param::with_value("EXTRA", "1"), Param::with_value("PRECISION", "3")];

    assert_eq!(merge_params(&declared, Some(supplied.as_slice())), vec![env("PRECISION", "3")]);
}

#[test]
fn listed_params_carry_defaults_only() {
    let op = OperatorBuilder::new("sum").param("PRECISION", "2").build();
    let listed = listed_params(&op);
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "PRECISION");
    assert_eq!(listed[0].value, None);
    assert_eq!(listed[0].default_value.as_deref(), Some("2"));
}

#[test]
fn job_spec_environment_is_constant_then_params_then_slots() {
    let op = OperatorBuilder::new("sum")
        .input("A", "numbers")
        .output("total")
        .constant("MODE", "strict")
        .param("PRECISION", "2")
        .command("true")
        .build();

    let mut run = RunBuilder::new().upload("u1", "numbers").build();
    run.param_pool
        .insert("sum".to_string(), vec![Param::with_value("PRECISION", "7")]);
    let step = RunStep::new("sum", bindings(&[("A", "u1")]));

    let job = JobSpec::build(&run, &step, &op).unwrap();

    assert_eq!(job.job_name, format!("datamill-job-{}", step.id));
    assert_eq!(job.scratch_name, format!("datamill-job-{}-scratch", step.id));
    assert_eq!(job.stage_in.len(), 1);
    assert_eq!(job.stage_in[0].path, "inputs/u1");
    assert_eq!(
        job.operator.env,
        vec![
            env("MODE", "strict"),
            env("PRECISION", "7"),
            env("A", "inputs/u1"),
            env(OUTPUT_DIR_ENV, "output"),
        ]
    );
    assert_eq!(job.stage_out.allowed_kinds, vec!["total".to_string()]);
    assert_eq!(job.stage_out.run_id, run.id);
}

#[test]
fn job_spec_rejects_missing_inputs() {
    let op = OperatorBuilder::new("sum").input("A", "numbers").build();
    let run = RunBuilder::new().build();
    let step = RunStep::new("sum", bindings(&[("A", "ghost")]));

    let err = JobSpec::build(&run, &step, &op).unwrap_err();
    assert!(err.is_not_found());
}
