// src/exec/dispatcher.rs

//! Turns one committed step into a backend job and follows it to the end.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::catalog::Operator;
use crate::errors::{DatamillError, Result};
use crate::exec::backend::{JobBackend, JobHandle, JobState};
use crate::exec::job_spec::JobSpec;
use crate::run::{Run, RunStep};
use crate::store::RunStore;
use crate::types::StepStatus;

/// Dispatcher settings.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherOptions {
    /// How often a running job is polled.
    pub poll_interval: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct JobDispatcher {
    backend: Arc<dyn JobBackend>,
    store: RunStore,
    options: DispatcherOptions,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl JobDispatcher {
    pub fn new(backend: Arc<dyn JobBackend>, store: RunStore, options: DispatcherOptions) -> Self {
        Self {
            backend,
            store,
            options,
        }
    }

    pub fn backend(&self) -> &Arc<dyn JobBackend> {
        &self.backend
    }

    /// Provision the step's scratch area and submit its job.
    ///
    /// Any backend error comes back as `BackendDispatchFailure`.
    pub async fn dispatch(&self, run: &Run, step: &RunStep, operator: &Operator) -> Result<JobHandle> {
        let spec = JobSpec::build(run, step, operator)?;

        self.backend
            .provision_scratch(&spec.scratch_name)
            .await
            .map_err(|e| dispatch_failure("provisioning scratch", &step.job_ref.scratch_name, e))?;
        debug!(step_id = %step.id, scratch = %spec.scratch_name, "scratch provisioned");

        let handle = self
            .backend
            .submit(spec)
            .await
            .map_err(|e| dispatch_failure("submitting job", &step.job_ref.job_name, e))?;
        info!(
            run_id = %run.id,
            step_id = %step.id,
            operator = %operator.name,
            job = %handle.job_name,
            "job submitted"
        );

        Ok(handle)
    }

    /// Poll the job until the backend reports a terminal state.
    ///
    /// Returns `Success` or `Failure`, never anything else. A poll error, or
    /// `cancel` flipping to `true`, ends the wait with `Failure`; in the
    /// latter case the backend job is left alone.
    pub async fn await_completion(
        &self,
        step: &RunStep,
        handle: &JobHandle,
        cancel: &mut watch::Receiver<bool>,
    ) -> StepStatus {
        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut cancel_open = true;

        loop {
            if *cancel.borrow() {
                warn!(step_id = %step.id, job = %handle.job_name, "run terminated; no longer waiting for job");
                return StepStatus::Failure;
            }

            if cancel_open {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = cancel.changed() => {
                        if changed.is_err() {
                            debug!(step_id = %step.id, "cancel channel closed");
                            cancel_open = false;
                        }
                        continue;
                    }
                }
            } else {
                ticker.tick().await;
            }

            match self.backend.poll(handle).await {
                Ok(JobState::Succeeded) => return StepStatus::Success,
                Ok(JobState::Failed) => return StepStatus::Failure,
                Ok(JobState::Pending) => {
                    debug!(job = %handle.job_name, "waiting for job to finish");
                }
                Err(e) => {
                    error!(job = %handle.job_name, error = %e, "polling job failed; marking step failed");
                    return StepStatus::Failure;
                }
            }
        }
    }

    /// Release the step's job and scratch area. Errors are logged, not returned.
    pub async fn release(&self, step: &RunStep) {
        let handle = JobHandle {
            job_name: step.job_ref.job_name.clone(),
        };
        if let Err(e) = self.backend.teardown(&handle).await {
            warn!(step_id = %step.id, job = %handle.job_name, error = %e, "job teardown failed");
        }
        if let Err(e) = self.backend.release_scratch(&step.job_ref.scratch_name).await {
            warn!(
                step_id = %step.id,
                scratch = %step.job_ref.scratch_name,
                error = %e,
                "scratch release failed"
            );
        }
    }

    /// Full lifecycle of an already committed step: dispatch, mark running,
    /// wait, record the terminal status and release resources on success.
    ///
    /// Returns the terminal status. Only store errors are returned as `Err`;
    /// backend trouble becomes `Failure`.
    pub async fn run_step(
        &self,
        run: &Run,
        step: &RunStep,
        operator: &Operator,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<StepStatus> {
        if *cancel.borrow_and_update() {
            info!(run_id = %run.id, step_id = %step.id, "run cancelled before dispatch; not submitting");
            self.store
                .set_step_status(&run.id, &step.id, StepStatus::Failure)
                .await?;
            return Ok(StepStatus::Failure);
        }

        let handle = match self.dispatch(run, step, operator).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(run_id = %run.id, step_id = %step.id, error = %e, "dispatch failed");
                self.store
                    .set_step_status(&run.id, &step.id, StepStatus::Failure)
                    .await?;
                return Ok(StepStatus::Failure);
            }
        };

        self.store
            .set_step_status(&run.id, &step.id, StepStatus::Running)
            .await?;

        let status = self.await_completion(step, &handle, &mut cancel).await;
        self.store.set_step_status(&run.id, &step.id, status).await?;

        if status == StepStatus::Success {
            self.release(step).await;
        }

        info!(run_id = %run.id, step_id = %step.id, %status, "step finished");
        Ok(status)
    }
}

fn dispatch_failure(what: &str, name: &str, err: DatamillError) -> DatamillError {
    match err {
        DatamillError::BackendDispatchFailure(msg) => {
            DatamillError::BackendDispatchFailure(format!("{what} {name}: {msg}"))
        }
        other => DatamillError::BackendDispatchFailure(format!("{what} {name}: {other}")),
    }
}
