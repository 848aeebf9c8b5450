// tests/engine_lifecycle.rs

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use datamill::artifact::{ArtifactRegistrar, MemoryArtifactStore};
use datamill::dag::SchedulerLimits;
use datamill::engine::{Engine, EngineOptions};
use datamill::errors::DatamillError;
use datamill::exec::DispatcherOptions;
use datamill::lineage::lineage_violations;
use datamill::run::{Param, ParamPool, Run};
use datamill::store::{MemoryDocumentStore, RetryPolicy, RunStore};
use datamill::types::{RunStatus, StepStatus};
use datamill_test_utils::builders::{CatalogBuilder, OperatorBuilder};
use datamill_test_utils::fake_backend::FakeBackend;
use datamill_test_utils::{init_tracing, with_timeout};

struct Harness {
    engine: Engine,
    backend: Arc<FakeBackend>,
    artifacts: Arc<MemoryArtifactStore>,
}

fn options() -> EngineOptions {
    EngineOptions {
        limits: SchedulerLimits::default(),
        dispatcher: DispatcherOptions {
            poll_interval: Duration::from_millis(5),
        },
    }
}

fn harness_with(catalog: CatalogBuilder, options: EngineOptions) -> Harness {
    init_tracing();
    let retry = RetryPolicy {
        max_attempts: 200,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        multiplier: 2.0,
        jitter: true,
    };
    let store = RunStore::new(Arc::new(MemoryDocumentStore::new()), retry);
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let registrar = ArtifactRegistrar::new(store.clone(), artifacts.clone());
    let backend = FakeBackend::new(registrar.clone());
    let engine = Engine::new(catalog.source(), store, registrar, backend.clone(), options);
    Harness {
        engine,
        backend,
        artifacts,
    }
}

/// numbers --sum--> total --report--> report, plus an operator nobody feeds.
fn pipeline() -> CatalogBuilder {
    CatalogBuilder::new()
        .kinds(&["numbers", "total", "report", "other"])
        .operator(
            OperatorBuilder::new("sum")
                .input("A", "numbers")
                .output("total")
                .param("PRECISION", "2")
                .build(),
        )
        .operator(OperatorBuilder::new("report").input("T", "total").output("report").build())
        .operator(OperatorBuilder::new("lonely").input("O", "other").output("report").build())
}

fn harness() -> Harness {
    harness_with(pipeline(), options())
}

/// Poll the run until `done` holds.
async fn wait_until(engine: &Engine, run_id: &str, done: impl Fn(&Run) -> bool) -> Run {
    with_timeout(async {
        loop {
            let run = engine.get_run(run_id).await.unwrap();
            if done(&run) {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

#[tokio::test]
async fn pipeline_runs_to_fixed_point() {
    let h = harness();
    h.backend.produces("sum", "total", b"3");
    h.backend.produces("report", "report", b"ok");

    let run = h.engine.create_run().await.unwrap();
    let upload = h
        .engine
        .register_upload(&run.id, "numbers", b"1 2".to_vec(), None)
        .await
        .unwrap();
    assert!(upload.ancestors.is_empty());

    h.engine.start_run(&run.id, ParamPool::new()).await.unwrap();
    let run = with_timeout(h.engine.wait_for_run(&run.id)).await.unwrap();

    assert_eq!(run.status, RunStatus::Complete);
    assert!(run.ended_at.is_some());
    assert_eq!(run.steps.len(), 2);
    assert!(run.steps.iter().all(|s| s.status == StepStatus::Success));
    assert_eq!(run.data_pool.len(), 3);
    assert!(lineage_violations(&run).is_empty());

    let report = run.data_pool.iter().find(|u| u.data_kind == "report").unwrap();
    assert_eq!(
        report.ancestors,
        BTreeSet::from(["report".to_string(), "sum".to_string()])
    );
    assert_eq!(h.engine.read_artifact(&report.id).await.unwrap(), b"ok".to_vec());

    // Successful steps release their job and scratch area.
    assert_eq!(h.backend.torn_down().len(), 2);
    assert_eq!(h.backend.released().len(), 2);
    assert_eq!(h.backend.provisioned().len(), 2);
}

#[tokio::test]
async fn feedback_loop_stops_at_the_ancestor_rule() {
    let catalog = CatalogBuilder::new()
        .kinds(&["numbers", "total"])
        .operator(OperatorBuilder::new("sum").input("A", "numbers").output("total").build())
        .operator(OperatorBuilder::new("expand").input("T", "total").output("numbers").build());
    let h = harness_with(catalog, options());
    h.backend.produces("sum", "total", b"3");
    h.backend.produces("expand", "numbers", b"1 1 1");

    let run = h.engine.create_run().await.unwrap();
    h.engine
        .register_upload(&run.id, "numbers", b"1 2".to_vec(), None)
        .await
        .unwrap();
    h.engine.start_run(&run.id, ParamPool::new()).await.unwrap();
    let run = with_timeout(h.engine.wait_for_run(&run.id)).await.unwrap();

    assert_eq!(run.status, RunStatus::Complete);
    assert_eq!(h.backend.submitted_operators(), vec!["sum", "expand"]);
    assert_eq!(run.data_pool.len(), 3);
    assert!(lineage_violations(&run).is_empty());
}

#[tokio::test]
async fn failed_step_does_not_block_completion() {
    let h = harness();
    h.backend.fails("sum");

    let run = h.engine.create_run().await.unwrap();
    h.engine
        .register_upload(&run.id, "numbers", b"1".to_vec(), None)
        .await
        .unwrap();
    h.engine.start_run(&run.id, ParamPool::new()).await.unwrap();
    let run = with_timeout(h.engine.wait_for_run(&run.id)).await.unwrap();

    assert_eq!(run.status, RunStatus::Complete);
    assert_eq!(run.steps.len(), 1);
    assert_eq!(run.steps[0].status, StepStatus::Failure);
    assert!(run.steps[0].output_data_units.is_empty());
    // Failed steps keep their resources for diagnosis.
    assert!(h.backend.released().is_empty());
    assert!(h.backend.torn_down().is_empty());
}

#[tokio::test]
async fn rejected_submission_marks_the_step_failed() {
    let h = harness();
    h.backend.rejects("sum");

    let run = h.engine.create_run().await.unwrap();
    h.engine
        .register_upload(&run.id, "numbers", b"1".to_vec(), None)
        .await
        .unwrap();
    h.engine.start_run(&run.id, ParamPool::new()).await.unwrap();
    let run = with_timeout(h.engine.wait_for_run(&run.id)).await.unwrap();

    assert_eq!(run.status, RunStatus::Complete);
    assert_eq!(run.steps[0].status, StepStatus::Failure);
    assert!(run.steps[0].started_at.is_none());
    assert!(h.backend.submitted().is_empty());
}

#[tokio::test]
async fn run_parameters_reach_the_job() {
    let h = harness();
    h.backend.produces("sum", "total", b"3");

    let run = h.engine.create_run().await.unwrap();
    h.engine
        .register_upload(&run.id, "numbers", b"1".to_vec(), None)
        .await
        .unwrap();

    let mut params = ParamPool::new();
    params.insert("sum".to_string(), vec![Param::with_value("PRECISION", "7")]);
    h.engine.start_run(&run.id, params.clone()).await.unwrap();
    let run = with_timeout(h.engine.wait_for_run(&run.id)).await.unwrap();
    assert_eq!(run.param_pool, params);

    let jobs = h.backend.submitted();
    let sum = jobs.iter().find(|j| j.operator.name == "sum").unwrap();
    let precision = sum.operator.env.iter().find(|e| e.name == "PRECISION").unwrap();
    assert_eq!(precision.value, "7");

    let report = jobs.iter().find(|j| j.operator.name == "report").unwrap();
    assert!(report.operator.env.iter().all(|e| e.name != "PRECISION"));
}

#[tokio::test]
async fn terminate_stops_waiting_and_delete_cleans_up() {
    let h = harness();
    h.backend.hangs("sum");

    let run = h.engine.create_run().await.unwrap();
    h.engine
        .register_upload(&run.id, "numbers", b"1".to_vec(), None)
        .await
        .unwrap();
    h.engine.start_run(&run.id, ParamPool::new()).await.unwrap();

    wait_until(&h.engine, &run.id, |r| {
        r.steps.iter().any(|s| s.status == StepStatus::Running)
    })
    .await;

    // Running runs cannot be deleted.
    assert!(matches!(
        h.engine.delete_run(&run.id).await,
        Err(DatamillError::InvalidState(_))
    ));

    h.engine.terminate_run(&run.id).await.unwrap();
    let run = with_timeout(h.engine.wait_for_run(&run.id)).await.unwrap();
    assert_eq!(run.status, RunStatus::Terminated);
    assert!(run.error.is_none());
    assert_eq!(run.steps[0].status, StepStatus::Failure);
    // The backend job was not touched by termination.
    assert!(h.backend.torn_down().is_empty());

    assert!(matches!(
        h.engine.terminate_run(&run.id).await,
        Err(DatamillError::InvalidState(_))
    ));

    h.engine.delete_run(&run.id).await.unwrap();
    assert_eq!(h.backend.torn_down(), vec![run.steps[0].job_ref.job_name.clone()]);
    assert_eq!(h.backend.released(), vec![run.steps[0].job_ref.scratch_name.clone()]);
    assert!(h.artifacts.is_empty());
    assert!(h.engine.get_run(&run.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn created_run_can_be_terminated_but_not_restarted() {
    let h = harness();
    let run = h.engine.create_run().await.unwrap();

    h.engine.terminate_run(&run.id).await.unwrap();
    assert!(matches!(
        h.engine.start_run(&run.id, ParamPool::new()).await,
        Err(DatamillError::InvalidState(_))
    ));

    let run = h.engine.wait_for_run(&run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Terminated);
}

#[tokio::test]
async fn run_cannot_be_started_twice() {
    let h = harness();
    let run = h.engine.create_run().await.unwrap();
    h.engine.start_run(&run.id, ParamPool::new()).await.unwrap();

    let second = h.engine.start_run(&run.id, ParamPool::new()).await;
    // The first start may already have completed an empty run.
    assert!(matches!(second, Err(DatamillError::InvalidState(_))));

    let run = with_timeout(h.engine.wait_for_run(&run.id)).await.unwrap();
    assert_eq!(run.status, RunStatus::Complete);
    assert!(run.steps.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_keep_the_winners_parameters() {
    let h = harness();
    h.backend.hangs("sum");

    let run = h.engine.create_run().await.unwrap();
    h.engine
        .register_upload(&run.id, "numbers", b"1".to_vec(), None)
        .await
        .unwrap();

    let mut first = ParamPool::new();
    first.insert("sum".to_string(), vec![Param::with_value("PRECISION", "1")]);
    let mut second = ParamPool::new();
    second.insert("sum".to_string(), vec![Param::with_value("PRECISION", "9")]);

    let (a, b) = tokio::join!(
        h.engine.start_run(&run.id, first.clone()),
        h.engine.start_run(&run.id, second.clone())
    );
    assert!(a.is_ok() != b.is_ok(), "exactly one start wins");
    let (winner, loser) = if a.is_ok() { (first, b) } else { (second, a) };
    assert!(matches!(loser, Err(DatamillError::InvalidState(_))));

    // The losing start never touched the pool.
    wait_until(&h.engine, &run.id, |r| !r.steps.is_empty()).await;
    let current = h.engine.get_run(&run.id).await.unwrap();
    assert_eq!(current.param_pool, winner);

    h.engine.terminate_run(&run.id).await.unwrap();
    with_timeout(h.engine.wait_for_run(&run.id)).await.unwrap();
}

#[tokio::test]
async fn finished_runs_leave_the_driver_table() {
    let h = harness();
    h.backend.hangs("sum");

    let run = h.engine.create_run().await.unwrap();
    h.engine
        .register_upload(&run.id, "numbers", b"1".to_vec(), None)
        .await
        .unwrap();
    h.engine.start_run(&run.id, ParamPool::new()).await.unwrap();
    assert_eq!(h.engine.active_runs().unwrap(), vec![run.id.clone()]);

    h.engine.terminate_run(&run.id).await.unwrap();
    with_timeout(h.engine.wait_for_run(&run.id)).await.unwrap();
    assert!(h.engine.active_runs().unwrap().is_empty());

    // A completed run is dropped too, and waiting again still works.
    let done = h.engine.create_run().await.unwrap();
    h.engine.start_run(&done.id, ParamPool::new()).await.unwrap();
    with_timeout(h.engine.wait_for_run(&done.id)).await.unwrap();
    assert!(h.engine.active_runs().unwrap().is_empty());
    let again = h.engine.wait_for_run(&done.id).await.unwrap();
    assert_eq!(again.status, RunStatus::Complete);
}

#[tokio::test]
async fn upload_during_a_run_is_picked_up() {
    let h = harness();
    h.backend.hangs("lonely");
    h.backend.produces("sum", "total", b"3");

    let run = h.engine.create_run().await.unwrap();
    h.engine
        .register_upload(&run.id, "other", b"x".to_vec(), None)
        .await
        .unwrap();
    h.engine.start_run(&run.id, ParamPool::new()).await.unwrap();

    wait_until(&h.engine, &run.id, |r| !r.steps.is_empty()).await;
    h.engine
        .register_upload(&run.id, "numbers", b"4 5".to_vec(), None)
        .await
        .unwrap();

    let run = wait_until(&h.engine, &run.id, |r| {
        r.steps
            .iter()
            .any(|s| s.operator == "report" && s.status == StepStatus::Success)
    })
    .await;
    assert_eq!(run.status, RunStatus::Running);

    h.engine.terminate_run(&run.id).await.unwrap();
    let run = with_timeout(h.engine.wait_for_run(&run.id)).await.unwrap();
    assert_eq!(run.status, RunStatus::Terminated);
}

#[tokio::test]
async fn upload_validation() {
    let h = harness();
    let run = h.engine.create_run().await.unwrap();

    match h.engine.register_upload(&run.id, "pictures", vec![1], None).await {
        Err(DatamillError::NotFound { kind, id }) => {
            assert_eq!(kind, "data kind");
            assert_eq!(id, "pictures");
        }
        other => panic!("expected NotFound, got {other:?}"),
    }

    let err = h
        .engine
        .register_upload("no-such-run", "numbers", vec![1], None)
        .await
        .unwrap_err();
    assert!(matches!(err, DatamillError::NotFound { kind: "run", .. }));

    let err = h
        .engine
        .register_upload(&run.id, "numbers", vec![1], Some("no-such-step"))
        .await
        .unwrap_err();
    assert!(matches!(err, DatamillError::NotFound { kind: "step", .. }));

    // Nothing was stored for the rejected uploads.
    assert!(h.artifacts.is_empty());
}

#[tokio::test]
async fn upload_attributed_to_a_step_inherits_its_lineage() {
    let h = harness();
    h.backend.fails("sum");

    let run = h.engine.create_run().await.unwrap();
    h.engine
        .register_upload(&run.id, "numbers", b"1".to_vec(), None)
        .await
        .unwrap();
    h.engine.start_run(&run.id, ParamPool::new()).await.unwrap();
    let run = with_timeout(h.engine.wait_for_run(&run.id)).await.unwrap();
    let step = &run.steps[0];

    let unit = h
        .engine
        .register_upload(&run.id, "total", b"9".to_vec(), Some(&step.id))
        .await
        .unwrap();
    assert_eq!(unit.ancestors, BTreeSet::from(["sum".to_string()]));

    let run = h.engine.get_run(&run.id).await.unwrap();
    assert_eq!(run.step(&step.id).unwrap().output_data_units, vec![unit.id]);
}

#[tokio::test]
async fn applicable_params_cover_reachable_operators() {
    let h = harness();
    let run = h.engine.create_run().await.unwrap();
    h.engine
        .register_upload(&run.id, "numbers", b"1".to_vec(), None)
        .await
        .unwrap();

    let params = h.engine.list_applicable_operator_params(&run.id).await.unwrap();

    let ops: Vec<_> = params.keys().map(String::as_str).collect();
    assert_eq!(ops, vec!["report", "sum"]);
    assert!(params["report"].is_empty());
    assert_eq!(params["sum"].len(), 1);
    assert_eq!(params["sum"][0].name, "PRECISION");
    assert_eq!(params["sum"][0].default_value.as_deref(), Some("2"));
}

#[tokio::test]
async fn binding_explosion_terminates_the_run() {
    let catalog = CatalogBuilder::new()
        .kinds(&["numbers", "total"])
        .operator(
            OperatorBuilder::new("pair")
                .input("L", "numbers")
                .input("R", "numbers")
                .output("total")
                .build(),
        );
    let mut opts = options();
    opts.limits.max_bindings_per_pass = 3;
    let h = harness_with(catalog, opts);

    let run = h.engine.create_run().await.unwrap();
    for _ in 0..2 {
        h.engine
            .register_upload(&run.id, "numbers", b"1".to_vec(), None)
            .await
            .unwrap();
    }
    h.engine.start_run(&run.id, ParamPool::new()).await.unwrap();
    let run = with_timeout(h.engine.wait_for_run(&run.id)).await.unwrap();

    assert_eq!(run.status, RunStatus::Terminated);
    assert!(run.error.as_deref().unwrap().contains("limit of 3"));
    assert!(run.steps.is_empty());
    assert!(h.backend.submitted().is_empty());
}
