// src/engine/mod.rs

//! Orchestration engine for datamill.
//!
//! [`Engine`] is the surface collaborators use: create, start, terminate and
//! delete runs, register uploads and list the parameters that may matter for
//! a run. Each started run is driven by its own supervised task (see
//! [`driver`]) with a cancellation channel tied to run termination.

mod driver;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactRegistrar;
use crate::catalog::{Catalog, CatalogSource};
use crate::dag::{Scheduler, SchedulerLimits};
use crate::errors::{DatamillError, Result};
use crate::exec::{DispatcherOptions, JobBackend, JobDispatcher};
use crate::lineage::DataUnit;
use crate::params::listed_params;
use crate::run::{Param, ParamPool, Run};
use crate::store::RunStore;
use crate::types::{DataKindName, OperatorName, RunId, RunStatus, StepStatus};

use driver::RunDriver;

/// Engine options shared by every run.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    pub limits: SchedulerLimits,
    pub dispatcher: DispatcherOptions,
}

/// Control handles for a run that has a driver.
struct DriverHandle {
    cancel: Arc<watch::Sender<bool>>,
    pool_changed: Arc<Notify>,
    finished: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct Engine {
    catalog_source: Arc<dyn CatalogSource>,
    store: RunStore,
    registrar: ArtifactRegistrar,
    dispatcher: JobDispatcher,
    options: EngineOptions,
    drivers: Arc<Mutex<HashMap<RunId, DriverHandle>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// `registrar` must write into the same `store` the engine is given.
    pub fn new(
        catalog_source: Arc<dyn CatalogSource>,
        store: RunStore,
        registrar: ArtifactRegistrar,
        backend: Arc<dyn JobBackend>,
        options: EngineOptions,
    ) -> Self {
        let dispatcher = JobDispatcher::new(backend, store.clone(), options.dispatcher);
        Self {
            catalog_source,
            store,
            registrar,
            dispatcher,
            options,
            drivers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub async fn create_run(&self) -> Result<Run> {
        self.store.create_run().await
    }

    pub async fn get_run(&self, id: &str) -> Result<Run> {
        self.store.get_run(id).await
    }

    /// Record the parameters, move the run to `Running` and start driving
    /// it in the background. Returns as soon as the driver is spawned.
    ///
    /// The catalog is fetched once here; the run sees that snapshot for its
    /// whole life.
    pub async fn start_run(&self, id: &str, params: ParamPool) -> Result<()> {
        let run = self.store.get_run(id).await?;
        if run.status != RunStatus::Created {
            return Err(DatamillError::InvalidState(format!(
                "run {id} is {} and cannot be started",
                run.status
            )));
        }

        let catalog = Arc::new(Catalog::fetch(self.catalog_source.as_ref()).await?);
        self.store.begin_run(id, params).await?;

        let (cancel, _) = watch::channel(false);
        let cancel = Arc::new(cancel);
        let pool_changed = Arc::new(Notify::new());
        let (finished_tx, finished) = watch::channel(false);

        let driver = RunDriver::new(
            id.to_string(),
            Scheduler::new(catalog, self.options.limits),
            self.dispatcher.clone(),
            self.store.clone(),
            Arc::clone(&cancel),
            Arc::clone(&pool_changed),
        );

        self.with_drivers(|drivers| {
            drivers.insert(
                id.to_string(),
                DriverHandle {
                    cancel,
                    pool_changed,
                    finished,
                },
            );
        })?;

        let run_id = id.to_string();
        let drivers = Arc::clone(&self.drivers);
        tokio::spawn(async move {
            if let Err(e) = driver.run().await {
                error!(run_id = %run_id, error = %e, "run ended with error");
            }
            // Waiters holding a receiver still see the flag flip; later
            // callers find no handle and read the final run directly.
            match drivers.lock() {
                Ok(mut drivers) => {
                    drivers.remove(&run_id);
                }
                Err(_) => warn!(run_id = %run_id, "driver table poisoned; handle not removed"),
            }
            finished_tx.send_replace(true);
        });

        info!(run_id = %id, "run started");
        Ok(())
    }

    /// Move the run to `Terminated` and stop waiting on its steps.
    ///
    /// Steps that were still running are recorded as failed; their backend
    /// jobs are left in place until the run is deleted.
    pub async fn terminate_run(&self, id: &str) -> Result<()> {
        let run = self.store.get_run(id).await?;
        if run.status.is_terminal() {
            return Err(DatamillError::InvalidState(format!(
                "run {id} is already {}",
                run.status
            )));
        }

        self.store.set_run_status(id, RunStatus::Terminated).await?;

        self.with_drivers(|drivers| {
            if let Some(handle) = drivers.get(id) {
                handle.cancel.send_replace(true);
            }
        })?;
        info!(run_id = %id, "run terminated");
        Ok(())
    }

    /// Delete a run that has no work in flight.
    ///
    /// Jobs and scratch areas of steps that did not succeed are released
    /// first (best effort), then the run's artifacts, then the run itself.
    pub async fn delete_run(&self, id: &str) -> Result<()> {
        let run = self.store.get_run(id).await?;
        if run.status == RunStatus::Running {
            return Err(DatamillError::InvalidState(format!(
                "run {id} is running and cannot be deleted"
            )));
        }
        if let Some(step) = run.unfinished_steps().next() {
            return Err(DatamillError::InvalidState(format!(
                "run {id} still has step {} in state {}",
                step.id, step.status
            )));
        }

        for step in run.steps.iter().filter(|s| s.status == StepStatus::Failure) {
            debug!(run_id = %id, step_id = %step.id, "releasing resources of failed step");
            self.dispatcher.release(step).await;
        }

        self.store
            .delete_run(id, self.registrar.artifacts().as_ref())
            .await?;
        self.with_drivers(|drivers| drivers.remove(id))?;
        Ok(())
    }

    /// Store uploaded bytes as a data unit of `data_kind` in the run's pool.
    ///
    /// With `step_id`, the unit is attributed to that step (its ancestry is
    /// derived from the step). A running driver is woken up so it can
    /// consider the new unit.
    pub async fn register_upload(
        &self,
        run_id: &str,
        data_kind: impl Into<DataKindName>,
        bytes: Vec<u8>,
        step_id: Option<&str>,
    ) -> Result<DataUnit> {
        let data_kind = data_kind.into();
        let catalog = Catalog::fetch(self.catalog_source.as_ref()).await?;
        if !catalog.has_data_kind(&data_kind) {
            return Err(DatamillError::NotFound {
                kind: "data kind",
                id: data_kind,
            });
        }
        if !self.store.run_exists(run_id).await? {
            return Err(DatamillError::run_not_found(run_id));
        }
        if let Some(step_id) = step_id {
            if !self.store.step_exists(run_id, step_id).await? {
                return Err(DatamillError::step_not_found(step_id));
            }
        }

        let unit = self
            .registrar
            .register(run_id, data_kind, bytes, step_id)
            .await?;
        info!(run_id, unit_id = %unit.id, data_kind = %unit.data_kind, "upload registered");

        self.with_drivers(|drivers| {
            if let Some(handle) = drivers.get(run_id) {
                handle.pool_changed.notify_one();
            }
        })?;
        Ok(unit)
    }

    /// Declared parameters of every operator that could eventually run from
    /// the run's current pool, with their defaults.
    pub async fn list_applicable_operator_params(
        &self,
        run_id: &str,
    ) -> Result<BTreeMap<OperatorName, Vec<Param>>> {
        let run = self.store.get_run(run_id).await?;
        let catalog = Arc::new(Catalog::fetch(self.catalog_source.as_ref()).await?);
        let scheduler = Scheduler::new(catalog, self.options.limits);

        Ok(scheduler
            .eventually_available(&run.data_pool)
            .into_iter()
            .map(|op| (op.name.clone(), listed_params(op)))
            .collect())
    }

    /// Bytes of a data unit's artifact.
    pub async fn read_artifact(&self, unit_id: &str) -> Result<Vec<u8>> {
        self.registrar.artifacts().get(unit_id).await
    }

    /// Wait until the run's driver has finished and return the final run.
    ///
    /// Returns the current snapshot right away if the run has no driver.
    pub async fn wait_for_run(&self, id: &str) -> Result<Run> {
        let finished = self.with_drivers(|drivers| drivers.get(id).map(|h| h.finished.clone()))?;
        if let Some(mut finished) = finished {
            if finished.wait_for(|done| *done).await.is_err() {
                warn!(run_id = %id, "run driver went away without reporting");
            }
        }
        self.store.get_run(id).await
    }

    /// Ids of runs whose driver is still working.
    pub fn active_runs(&self) -> Result<Vec<RunId>> {
        self.with_drivers(|drivers| {
            let mut ids: Vec<RunId> = drivers.keys().cloned().collect();
            ids.sort();
            ids
        })
    }

    fn with_drivers<T>(&self, f: impl FnOnce(&mut HashMap<RunId, DriverHandle>) -> T) -> Result<T> {
        let mut guard = self
            .drivers
            .lock()
            .map_err(|_| DatamillError::InvalidState("driver table poisoned".to_string()))?;
        Ok(f(&mut guard))
    }
}
