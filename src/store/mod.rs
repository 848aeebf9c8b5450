// src/store/mod.rs

//! Run state store.
//!
//! - [`DocumentStore`] is the backing medium: versioned run documents with
//!   a conditional write. [`memory`] and [`file`] provide implementations.
//! - [`RunStore`] layers the run/step/data-pool operations on top. Every
//!   mutation is "read latest revision, apply, write back conditioned on the
//!   revision". A lost race is retried from a fresh read with the backoff in
//!   [`retry`]; it is never surfaced and never overwrites the other writer.

pub mod file;
pub mod memory;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::ArtifactStore;
use crate::errors::{DatamillError, Result};
use crate::lineage::{DataUnit, ancestors_for_step};
use crate::run::{ParamPool, Run, RunStep, elapsed_ms};
use crate::types::{BoxFuture, DataKindName, DataUnitId, RunStatus, StepStatus};

pub use file::FileDocumentStore;
pub use memory::MemoryDocumentStore;
pub use retry::RetryPolicy;

/// A run document together with the revision it was read at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Versioned {
    pub revision: u64,
    pub run: Run,
}

/// Versioned document storage for runs.
pub trait DocumentStore: Send + Sync {
    /// Latest revision of a run document (tombstoned ones included), or
    /// `None` if it was never written.
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Versioned>>>;

    /// Write `run` if its current revision equals `expected` (`None`: the
    /// document must not exist yet). Returns the new revision, or
    /// [`DatamillError::Conflict`] if someone else wrote first.
    fn put(&self, run: Run, expected: Option<u64>) -> BoxFuture<'_, Result<u64>>;
}

/// How long `set_step_status` waits for a step that is not visible yet.
#[derive(Debug, Clone, Copy)]
pub struct StepVisibility {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for StepVisibility {
    fn default() -> Self {
        Self {
            retries: 30,
            delay: Duration::from_secs(1),
        }
    }
}

/// Concurrency-safe run/step/data-unit operations.
#[derive(Clone)]
pub struct RunStore {
    docs: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
    step_visibility: StepVisibility,
}

impl std::fmt::Debug for RunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStore")
            .field("retry", &self.retry)
            .field("step_visibility", &self.step_visibility)
            .finish_non_exhaustive()
    }
}

impl RunStore {
    pub fn new(docs: Arc<dyn DocumentStore>, retry: RetryPolicy) -> Self {
        Self {
            docs,
            retry,
            step_visibility: StepVisibility::default(),
        }
    }

    pub fn with_step_visibility(mut self, step_visibility: StepVisibility) -> Self {
        self.step_visibility = step_visibility;
        self
    }

    /// Create a fresh run in `Created` state.
    pub async fn create_run(&self) -> Result<Run> {
        for _ in 0..self.retry.max_attempts.max(1) {
            let run = Run::new();
            match self.docs.put(run.clone(), None).await {
                Ok(_) => {
                    info!(run_id = %run.id, "created run");
                    return Ok(run);
                }
                // Id collision: pick another one.
                Err(DatamillError::Conflict(id)) => warn!(run_id = %id, "run id already taken"),
                Err(e) => return Err(e),
            }
        }
        Err(DatamillError::StorageUnavailable(
            "could not allocate a unique run id".to_string(),
        ))
    }

    /// Snapshot of a run. Fails with `NotFound` if absent or deleted.
    pub async fn get_run(&self, id: &str) -> Result<Run> {
        Ok(self.load(id).await?.run)
    }

    pub async fn run_exists(&self, id: &str) -> Result<bool> {
        match self.load(id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn step_exists(&self, id: &str, step_id: &str) -> Result<bool> {
        match self.load(id).await {
            Ok(doc) => Ok(doc.run.step(step_id).is_some()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Append a step. Identity-key uniqueness is the caller's job.
    pub async fn add_step_to_run(&self, id: &str, step: RunStep) -> Result<()> {
        self.mutate(id, |run| {
            run.steps.push(step.clone());
            Ok(())
        })
        .await?;
        debug!(run_id = %id, step_id = %step.id, operator = %step.operator, "step added to run");
        Ok(())
    }

    /// Move the run to `status`, stamping start/end times.
    pub async fn set_run_status(&self, id: &str, status: RunStatus) -> Result<()> {
        self.mutate(id, |run| apply_run_status(run, status)).await?;
        info!(run_id = %id, %status, "run status changed");
        Ok(())
    }

    /// Record the run's parameters and move it from `Created` to `Running`
    /// in one write. A run that is not `Created` is left untouched.
    pub async fn begin_run(&self, id: &str, params: ParamPool) -> Result<()> {
        self.mutate(id, |run| {
            if run.status != RunStatus::Created {
                return Err(DatamillError::InvalidState(format!(
                    "run {} is {} and cannot be started",
                    run.id, run.status
                )));
            }
            run.param_pool = params.clone();
            apply_run_status(run, RunStatus::Running)
        })
        .await?;
        info!(run_id = %id, "run status changed to running");
        Ok(())
    }

    /// Terminate the run and record why.
    pub async fn fail_run(&self, id: &str, reason: &str) -> Result<()> {
        self.mutate(id, |run| {
            apply_run_status(run, RunStatus::Terminated)?;
            run.error = Some(reason.to_string());
            Ok(())
        })
        .await?;
        warn!(run_id = %id, reason, "run terminated with error");
        Ok(())
    }

    /// Move a step to `status`, stamping start/end times.
    ///
    /// A step that is not visible yet (its append may still be in flight) is
    /// waited for, up to the configured number of retries.
    pub async fn set_step_status(&self, id: &str, step_id: &str, status: StepStatus) -> Result<()> {
        let mut waited = 0;
        loop {
            let result = self
                .mutate(id, |run| {
                    let step = run
                        .step_mut(step_id)
                        .ok_or_else(|| DatamillError::step_not_found(step_id))?;
                    apply_step_status(step, status)
                })
                .await;

            match result {
                Err(DatamillError::NotFound { kind: "step", .. })
                    if waited < self.step_visibility.retries =>
                {
                    waited += 1;
                    debug!(
                        run_id = %id,
                        %step_id,
                        attempt = waited,
                        "step not visible yet; retrying status update"
                    );
                    tokio::time::sleep(self.step_visibility.delay).await;
                }
                Err(e) => return Err(e),
                Ok(()) => {
                    debug!(run_id = %id, %step_id, %status, "step status changed");
                    return Ok(());
                }
            }
        }
    }

    /// Replace the run's parameter pool wholesale.
    pub async fn set_run_param_pool(&self, id: &str, params: ParamPool) -> Result<()> {
        self.mutate(id, |run| {
            run.param_pool = params.clone();
            Ok(())
        })
        .await
    }

    /// Insert a data unit into the pool.
    ///
    /// With `step_id` the unit's ancestry is derived from that step's inputs
    /// (plus the step's operator) and the unit is appended to the step's
    /// outputs; without it the unit is an upload with empty ancestry.
    /// Ancestry is recomputed against the latest revision on every attempt.
    pub async fn add_to_data_pool(
        &self,
        id: &str,
        unit_id: DataUnitId,
        data_kind: DataKindName,
        step_id: Option<&str>,
    ) -> Result<DataUnit> {
        let unit = self
            .mutate(id, |run| {
                let ancestors = match step_id {
                    Some(step_id) => ancestors_for_step(run, step_id)?,
                    None => Default::default(),
                };
                let unit = DataUnit {
                    id: unit_id.clone(),
                    data_kind: data_kind.clone(),
                    ancestors,
                };

                if let Some(step_id) = step_id {
                    if let Some(step) = run.step_mut(step_id) {
                        step.output_data_units.push(unit.id.clone());
                    }
                }
                run.data_pool.push(unit.clone());
                Ok(unit)
            })
            .await?;

        debug!(
            run_id = %id,
            unit_id = %unit.id,
            data_kind = %unit.data_kind,
            step_id = ?step_id,
            "data unit added to pool"
        );
        Ok(unit)
    }

    /// Release every artifact held by the run's data units, then tombstone
    /// the run. Returns the tombstoned document.
    pub async fn delete_run(&self, id: &str, artifacts: &dyn ArtifactStore) -> Result<Run> {
        let snapshot = self.get_run(id).await?;
        for unit in &snapshot.data_pool {
            match artifacts.delete(&unit.id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(unit_id = %unit.id, "artifact already gone");
                }
                Err(e) => return Err(e),
            }
        }

        let run = self
            .mutate(id, |run| {
                run.deleted = true;
                Ok(run.clone())
            })
            .await?;
        info!(run_id = %id, "run deleted");
        Ok(run)
    }

    async fn load(&self, id: &str) -> Result<Versioned> {
        match self.docs.get(id).await? {
            Some(doc) if !doc.run.deleted => Ok(doc),
            _ => Err(DatamillError::run_not_found(id)),
        }
    }

    /// Optimistic-concurrency mutation loop.
    ///
    /// `apply` may run several times, each time against a freshly read
    /// document; an error from it aborts the mutation without writing.
    async fn mutate<T, F>(&self, id: &str, mut apply: F) -> Result<T>
    where
        F: FnMut(&mut Run) -> Result<T>,
    {
        let attempts = self.retry.max_attempts.max(1);
        for attempt in 0..attempts {
            let Versioned { revision, mut run } = self.load(id).await?;
            let out = apply(&mut run)?;

            match self.docs.put(run, Some(revision)).await {
                Ok(_) => return Ok(out),
                Err(DatamillError::Conflict(_)) => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        run_id = %id,
                        attempt,
                        revision,
                        delay_ms = delay.as_millis() as u64,
                        "revision conflict; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(run_id = %id, attempts, "giving up after repeated revision conflicts");
        Err(DatamillError::StorageUnavailable(format!(
            "run {id}: {attempts} consecutive revision conflicts"
        )))
    }
}

fn apply_run_status(run: &mut Run, status: RunStatus) -> Result<()> {
    if !run.status.can_transition_to(status) {
        return Err(DatamillError::InvalidState(format!(
            "run {} cannot go from {} to {}",
            run.id, run.status, status
        )));
    }

    let now = Utc::now();
    run.status = status;
    match status {
        RunStatus::Running => run.started_at = Some(now),
        RunStatus::Complete | RunStatus::Terminated => {
            run.ended_at = Some(now);
            run.duration_ms = elapsed_ms(run.started_at, now);
        }
        RunStatus::Created => {}
    }
    Ok(())
}

fn apply_step_status(step: &mut RunStep, status: StepStatus) -> Result<()> {
    if !step.status.can_transition_to(status) {
        return Err(DatamillError::InvalidState(format!(
            "step {} cannot go from {} to {}",
            step.id, step.status, status
        )));
    }

    let now = Utc::now();
    step.status = status;
    match status {
        StepStatus::Running => step.started_at = Some(now),
        StepStatus::Success | StepStatus::Failure => {
            step.ended_at = Some(now);
            step.duration_ms = elapsed_ms(step.started_at, now);
        }
        StepStatus::Created => {}
    }
    Ok(())
}
