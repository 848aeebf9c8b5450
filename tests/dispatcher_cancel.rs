// tests/dispatcher_cancel.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use datamill::artifact::{ArtifactRegistrar, MemoryArtifactStore};
use datamill::catalog::Operator;
use datamill::exec::{DispatcherOptions, JobDispatcher};
use datamill::run::{Run, RunStep};
use datamill::store::{MemoryDocumentStore, RetryPolicy, RunStore};
use datamill::types::{RunStatus, StepStatus};
use datamill_test_utils::builders::{OperatorBuilder, bindings};
use datamill_test_utils::fake_backend::FakeBackend;
use datamill_test_utils::{init_tracing, with_timeout};

struct Setup {
    store: RunStore,
    backend: Arc<FakeBackend>,
    dispatcher: JobDispatcher,
    run: Run,
    step: RunStep,
    operator: Operator,
}

/// A run with one uploaded `numbers` unit and one committed `sum` step.
async fn setup() -> Setup {
    init_tracing();
    let store = RunStore::new(Arc::new(MemoryDocumentStore::new()), RetryPolicy::immediate(50));
    let registrar = ArtifactRegistrar::new(store.clone(), Arc::new(MemoryArtifactStore::new()));
    let backend = FakeBackend::new(registrar.clone());
    let dispatcher = JobDispatcher::new(
        backend.clone(),
        store.clone(),
        DispatcherOptions {
            poll_interval: Duration::from_millis(5),
        },
    );

    let run = store.create_run().await.unwrap();
    store.set_run_status(&run.id, RunStatus::Running).await.unwrap();
    let unit = registrar
        .register(&run.id, "numbers".to_string(), b"1".to_vec(), None)
        .await
        .unwrap();
    let step = RunStep::new("sum", bindings(&[("A", &unit.id)]));
    store.add_step_to_run(&run.id, step.clone()).await.unwrap();
    let run = store.get_run(&run.id).await.unwrap();

    let operator = OperatorBuilder::new("sum")
        .input("A", "numbers")
        .output("total")
        .build();

    Setup {
        store,
        backend,
        dispatcher,
        run,
        step,
        operator,
    }
}

#[tokio::test]
async fn cancelled_run_never_reaches_the_backend() {
    let s = setup().await;
    s.backend.produces("sum", "total", b"1");
    s.store
        .set_run_status(&s.run.id, RunStatus::Terminated)
        .await
        .unwrap();

    let (_cancel, cancelled) = watch::channel(true);
    let status = with_timeout(s.dispatcher.run_step(&s.run, &s.step, &s.operator, cancelled))
        .await
        .unwrap();

    assert_eq!(status, StepStatus::Failure);
    assert!(s.backend.provisioned().is_empty());
    assert!(s.backend.submitted().is_empty());

    let run = s.store.get_run(&s.run.id).await.unwrap();
    let step = run.step(&s.step.id).unwrap();
    assert_eq!(step.status, StepStatus::Failure);
    assert!(step.started_at.is_none());
    assert!(step.output_data_units.is_empty());
}

#[tokio::test]
async fn live_run_dispatches_normally() {
    let s = setup().await;
    s.backend.produces("sum", "total", b"1");

    let (_cancel, live) = watch::channel(false);
    let status = with_timeout(s.dispatcher.run_step(&s.run, &s.step, &s.operator, live))
        .await
        .unwrap();

    assert_eq!(status, StepStatus::Success);
    assert_eq!(s.backend.submitted_operators(), vec!["sum".to_string()]);
    assert_eq!(s.backend.provisioned(), vec![s.step.job_ref.scratch_name.clone()]);
}
