use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use datamill::artifact::ArtifactRegistrar;
use datamill::errors::{DatamillError, Result};
use datamill::exec::{JobBackend, JobHandle, JobSpec, JobState};
use datamill::types::BoxFuture;

/// What a fake job for one operator does.
#[derive(Debug, Clone, Default)]
struct Behaviour {
    outputs: Vec<(String, Vec<u8>)>,
    fail: bool,
    hang: bool,
    reject: bool,
}

#[derive(Debug)]
struct FakeJob {
    spec: JobSpec,
    state: JobState,
}

#[derive(Debug, Default)]
struct Journal {
    provisioned: Vec<String>,
    submitted: Vec<JobSpec>,
    torn_down: Vec<String>,
    released: Vec<String>,
}

/// A fake job backend that:
/// - records every call it receives
/// - on first poll, registers the outputs configured for the job's operator
///   and reports success (or failure, or stays pending forever)
pub struct FakeBackend {
    registrar: ArtifactRegistrar,
    behaviour: Mutex<HashMap<String, Behaviour>>,
    jobs: Mutex<HashMap<String, FakeJob>>,
    journal: Mutex<Journal>,
}

impl FakeBackend {
    pub fn new(registrar: ArtifactRegistrar) -> Arc<Self> {
        Arc::new(Self {
            registrar,
            behaviour: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            journal: Mutex::new(Journal::default()),
        })
    }

    fn configure(&self, operator: &str, f: impl FnOnce(&mut Behaviour)) {
        let mut guard = self.behaviour.lock().unwrap();
        f(guard.entry(operator.to_string()).or_default());
    }

    /// Jobs of `operator` produce one unit of `kind` holding `bytes`.
    pub fn produces(&self, operator: &str, kind: &str, bytes: &[u8]) {
        self.configure(operator, |b| b.outputs.push((kind.to_string(), bytes.to_vec())));
    }

    /// Jobs of `operator` end in failure without producing anything.
    pub fn fails(&self, operator: &str) {
        self.configure(operator, |b| b.fail = true);
    }

    /// Jobs of `operator` never finish.
    pub fn hangs(&self, operator: &str) {
        self.configure(operator, |b| b.hang = true);
    }

    /// Submissions for `operator` are rejected.
    pub fn rejects(&self, operator: &str) {
        self.configure(operator, |b| b.reject = true);
    }

    pub fn submitted(&self) -> Vec<JobSpec> {
        self.journal.lock().unwrap().submitted.clone()
    }

    pub fn submitted_operators(&self) -> Vec<String> {
        self.submitted().into_iter().map(|s| s.operator.name).collect()
    }

    pub fn provisioned(&self) -> Vec<String> {
        self.journal.lock().unwrap().provisioned.clone()
    }

    pub fn torn_down(&self) -> Vec<String> {
        self.journal.lock().unwrap().torn_down.clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.journal.lock().unwrap().released.clone()
    }

    fn behaviour_for(&self, operator: &str) -> Behaviour {
        self.behaviour
            .lock()
            .unwrap()
            .get(operator)
            .cloned()
            .unwrap_or_default()
    }

    async fn finish(&self, job_name: &str) -> Result<JobState> {
        let spec = {
            let jobs = self.jobs.lock().unwrap();
            let job = jobs.get(job_name).ok_or_else(|| DatamillError::NotFound {
                kind: "job",
                id: job_name.to_string(),
            })?;
            if job.state != JobState::Pending {
                return Ok(job.state);
            }
            job.spec.clone()
        };

        let behaviour = self.behaviour_for(&spec.operator.name);
        if behaviour.hang {
            return Ok(JobState::Pending);
        }

        let mut state = if behaviour.fail {
            JobState::Failed
        } else {
            JobState::Succeeded
        };
        if state == JobState::Succeeded {
            for (kind, bytes) in behaviour.outputs {
                let registered = self
                    .registrar
                    .register(&spec.stage_out.run_id, kind, bytes, Some(&spec.stage_out.step_id))
                    .await;
                if registered.is_err() {
                    state = JobState::Failed;
                    break;
                }
            }
        }

        if let Some(job) = self.jobs.lock().unwrap().get_mut(job_name) {
            job.state = state;
        }
        Ok(state)
    }
}

impl JobBackend for FakeBackend {
    fn provision_scratch<'a>(&'a self, scratch_name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.journal
                .lock()
                .unwrap()
                .provisioned
                .push(scratch_name.to_string());
            Ok(())
        })
    }

    fn submit(&self, spec: JobSpec) -> BoxFuture<'_, Result<JobHandle>> {
        Box::pin(async move {
            if self.behaviour_for(&spec.operator.name).reject {
                return Err(DatamillError::BackendDispatchFailure(format!(
                    "fake backend rejects {}",
                    spec.operator.name
                )));
            }

            let handle = JobHandle {
                job_name: spec.job_name.clone(),
            };
            self.journal.lock().unwrap().submitted.push(spec.clone());
            self.jobs.lock().unwrap().insert(
                spec.job_name.clone(),
                FakeJob {
                    spec,
                    state: JobState::Pending,
                },
            );
            Ok(handle)
        })
    }

    fn poll<'a>(&'a self, handle: &'a JobHandle) -> BoxFuture<'a, Result<JobState>> {
        Box::pin(self.finish(&handle.job_name))
    }

    fn teardown<'a>(&'a self, handle: &'a JobHandle) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.jobs.lock().unwrap().remove(&handle.job_name);
            self.journal
                .lock()
                .unwrap()
                .torn_down
                .push(handle.job_name.clone());
            Ok(())
        })
    }

    fn release_scratch<'a>(&'a self, scratch_name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.journal
                .lock()
                .unwrap()
                .released
                .push(scratch_name.to_string());
            Ok(())
        })
    }
}
