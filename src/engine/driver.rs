// src/engine/driver.rs

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dag::{Scheduler, StepInvocation};
use crate::errors::{DatamillError, Result};
use crate::exec::JobDispatcher;
use crate::run::{Run, RunStep};
use crate::store::RunStore;
use crate::types::{RunId, RunStatus, StepStatus};

/// Drives one run: scheduler passes in sequence, the steps of each pass
/// dispatched concurrently.
///
/// The scheduler is the pure part; this struct is the IO shell around it.
/// It reads fresh run snapshots, commits the invocations a pass discovers,
/// spawns one dispatcher task per step and decides when the run is done.
pub(crate) struct RunDriver {
    run_id: RunId,
    scheduler: Scheduler,
    dispatcher: JobDispatcher,
    store: RunStore,
    cancel: Arc<watch::Sender<bool>>,
    pool_changed: Arc<Notify>,
    in_flight: JoinSet<Result<StepStatus>>,
}

impl fmt::Debug for RunDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunDriver")
            .field("run_id", &self.run_id)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

/// Why the pass loop stopped.
enum Stop {
    FixedPoint,
    Terminated,
}

impl RunDriver {
    pub(crate) fn new(
        run_id: RunId,
        scheduler: Scheduler,
        dispatcher: JobDispatcher,
        store: RunStore,
        cancel: Arc<watch::Sender<bool>>,
        pool_changed: Arc<Notify>,
    ) -> Self {
        Self {
            run_id,
            scheduler,
            dispatcher,
            store,
            cancel,
            pool_changed,
            in_flight: JoinSet::new(),
        }
    }

    /// Run until the fixed point is reached or the run is terminated.
    ///
    /// In-flight steps are always drained before returning, so every step
    /// this driver started has a terminal status afterwards.
    pub(crate) async fn run(mut self) -> Result<()> {
        info!(run_id = %self.run_id, "run driver started");

        let outcome = self.pass_loop().await;
        match &outcome {
            Ok(Stop::FixedPoint) => {}
            Ok(Stop::Terminated) => self.cancel_steps(),
            Err(DatamillError::ResourceExhausted(reason)) => {
                if let Err(e) = self.store.fail_run(&self.run_id, reason).await {
                    error!(run_id = %self.run_id, error = %e, "could not record run failure");
                }
                self.cancel_steps();
            }
            Err(e) => {
                error!(run_id = %self.run_id, error = %e, "run driver failed");
                if let Err(e2) = self.store.fail_run(&self.run_id, &e.to_string()).await {
                    warn!(run_id = %self.run_id, error = %e2, "could not record run failure");
                }
                self.cancel_steps();
            }
        }

        self.drain().await;

        if let Ok(Stop::FixedPoint) = outcome {
            match self.store.set_run_status(&self.run_id, RunStatus::Complete).await {
                Ok(()) => info!(run_id = %self.run_id, "run complete"),
                // Terminated while the last steps were finishing.
                Err(DatamillError::InvalidState(msg)) => {
                    debug!(run_id = %self.run_id, %msg, "run not completed")
                }
                Err(e) => return Err(e),
            }
        }

        info!(run_id = %self.run_id, "run driver finished");
        outcome.map(|_| ())
    }

    async fn pass_loop(&mut self) -> Result<Stop> {
        let mut cancel_rx = self.cancel.subscribe();
        let mut pass = 0usize;

        loop {
            if *cancel_rx.borrow_and_update() {
                return Ok(Stop::Terminated);
            }

            let run = Arc::new(self.store.get_run(&self.run_id).await?);
            if run.status != RunStatus::Running {
                info!(run_id = %self.run_id, status = %run.status, "run no longer running; stopping");
                return Ok(Stop::Terminated);
            }

            pass += 1;
            let outcome = self.scheduler.run_pass(pass, &run)?;

            if !outcome.invocations.is_empty() {
                self.commit(&run, outcome.invocations).await?;
                continue;
            }

            if self.in_flight.is_empty() {
                info!(run_id = %self.run_id, pass, "fixed point reached");
                return Ok(Stop::FixedPoint);
            }

            // Nothing new yet: wait for a step to finish, an upload, or
            // cancellation, then look again.
            debug!(run_id = %self.run_id, in_flight = self.in_flight.len(), "waiting for progress");
            let joined = tokio::select! {
                joined = self.in_flight.join_next() => joined,
                _ = self.pool_changed.notified() => {
                    debug!(run_id = %self.run_id, "data pool changed");
                    None
                }
                _ = cancel_rx.changed() => None,
            };
            if let Some(joined) = joined {
                self.record(joined);
            }
        }
    }

    /// Append every invocation as a step, then dispatch them all.
    ///
    /// Appending stops once the run is cancelled. Steps already appended are
    /// still handed to the dispatcher, which fails them without submitting.
    async fn commit(&mut self, run: &Arc<Run>, invocations: Vec<StepInvocation>) -> Result<()> {
        let mut committed = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            if *self.cancel.borrow() {
                info!(
                    run_id = %self.run_id,
                    appended = committed.len(),
                    "run cancelled while committing; remaining invocations dropped"
                );
                break;
            }
            let step = RunStep::new(invocation.operator, invocation.inputs);
            self.store.add_step_to_run(&self.run_id, step.clone()).await?;
            committed.push(step);
        }

        for step in committed {
            let Some(operator) = self.scheduler.catalog().operator(&step.operator).cloned() else {
                return Err(DatamillError::InvalidState(format!(
                    "operator '{}' vanished from the catalog snapshot",
                    step.operator
                )));
            };
            let dispatcher = self.dispatcher.clone();
            let run = Arc::clone(run);
            let cancel = self.cancel.subscribe();

            debug!(run_id = %self.run_id, step_id = %step.id, operator = %operator.name, "dispatching step");
            self.in_flight
                .spawn(async move { dispatcher.run_step(&run, &step, &operator, cancel).await });
        }
        Ok(())
    }

    fn record(&self, joined: std::result::Result<Result<StepStatus>, tokio::task::JoinError>) {
        match joined {
            Ok(Ok(status)) => debug!(run_id = %self.run_id, %status, "step task finished"),
            Ok(Err(e)) => error!(run_id = %self.run_id, error = %e, "step bookkeeping failed"),
            Err(e) => error!(run_id = %self.run_id, error = %e, "step task panicked"),
        }
    }

    fn cancel_steps(&self) {
        self.cancel.send_replace(true);
    }

    async fn drain(&mut self) {
        while let Some(joined) = self.in_flight.join_next().await {
            self.record(joined);
        }
    }
}
