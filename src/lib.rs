// src/lib.rs

pub mod artifact;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod lineage;
pub mod logging;
pub mod params;
pub mod run;
pub mod store;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use crate::artifact::{ArtifactRegistrar, ArtifactStore, FsArtifactStore, MemoryArtifactStore};
use crate::cli::{CliArgs, ParamArg};
use crate::config::loader::load_and_validate;
use crate::engine::Engine;
use crate::exec::ProcessBackend;
use crate::run::{Param, ParamPool, Run};
use crate::store::{DocumentStore, FileDocumentStore, MemoryDocumentStore, RunStore};
use crate::types::{RunStatus, StepStatus};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading (which also provides the catalog)
/// - run store, artifact store and the local process backend
/// - the engine, seeded with the uploads given on the command line
/// - Ctrl-C handling (terminates the run)
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let (docs, artifacts): (Arc<dyn DocumentStore>, Arc<dyn ArtifactStore>) = if args.memory {
        (
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MemoryArtifactStore::new()),
        )
    } else {
        (
            Arc::new(FileDocumentStore::open(&args.work_dir).await?),
            Arc::new(FsArtifactStore::open(args.work_dir.join("artifacts")).await?),
        )
    };

    let store = RunStore::new(docs, cfg.config.retry.policy())
        .with_step_visibility(cfg.config.step_visibility());
    let registrar = ArtifactRegistrar::new(store.clone(), artifacts);
    let backend = ProcessBackend::new(args.work_dir.join("scratch"), registrar.clone());

    let engine = Engine::new(
        cfg.catalog().shared(),
        store,
        registrar,
        Arc::new(backend),
        cfg.engine_options(),
    );

    let run = engine.create_run().await?;
    info!(run_id = %run.id, "run created");

    for upload in &args.uploads {
        let bytes = tokio::fs::read(&upload.path)
            .await
            .with_context(|| format!("reading upload {}", upload.path.display()))?;
        let unit = engine
            .register_upload(&run.id, upload.data_kind.clone(), bytes, None)
            .await
            .with_context(|| format!("uploading {}", upload.path.display()))?;
        info!(unit_id = %unit.id, data_kind = %unit.data_kind, path = %upload.path.display(), "seeded data pool");
    }

    if args.dry_run {
        let listed = engine.list_applicable_operator_params(&run.id).await?;
        println!("{}", serde_json::to_string_pretty(&overlay_params(listed, &args.params))?);
        return Ok(());
    }

    engine.start_run(&run.id, param_pool(&args.params)).await?;

    // Ctrl-C → terminate the run; the driver then winds down.
    {
        let engine = engine.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            warn!(run_id = %run_id, "interrupted; terminating run");
            if let Err(e) = engine.terminate_run(&run_id).await {
                warn!(run_id = %run_id, error = %e, "could not terminate run");
            }
        });
    }

    let finished = engine.wait_for_run(&run.id).await?;
    println!("{}", serde_json::to_string_pretty(&RunSummary::from(&finished))?);

    if finished.status != RunStatus::Complete {
        bail!(
            "run {} ended {}{}",
            finished.id,
            finished.status,
            finished
                .error
                .as_deref()
                .map(|e| format!(": {e}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn param_pool(args: &[ParamArg]) -> ParamPool {
    let mut pool = ParamPool::new();
    for arg in args {
        pool.entry(arg.operator.clone())
            .or_default()
            .push(Param::with_value(arg.name.clone(), arg.value.clone()));
    }
    pool
}

/// Fill listed parameters with the values given on the command line.
fn overlay_params(mut listed: ParamPool, args: &[ParamArg]) -> ParamPool {
    for arg in args {
        let Some(params) = listed.get_mut(&arg.operator) else {
            continue;
        };
        if let Some(param) = params.iter_mut().find(|p| p.name == arg.name) {
            param.value = Some(arg.value.clone());
        }
    }
    listed
}

/// What `datamill` prints when a run ends.
#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    id: &'a str,
    status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    duration_ms: Option<i64>,
    steps: BTreeMap<StepStatus, usize>,
    data_units: Vec<UnitSummary<'a>>,
}

#[derive(Debug, Serialize)]
struct UnitSummary<'a> {
    id: &'a str,
    data_kind: &'a str,
    ancestors: Vec<&'a str>,
}

impl<'a> From<&'a Run> for RunSummary<'a> {
    fn from(run: &'a Run) -> Self {
        let mut steps = BTreeMap::new();
        for step in &run.steps {
            *steps.entry(step.status).or_insert(0) += 1;
        }
        Self {
            id: &run.id,
            status: run.status,
            error: run.error.as_deref(),
            duration_ms: run.duration_ms,
            steps,
            data_units: run
                .data_pool
                .iter()
                .map(|unit| UnitSummary {
                    id: &unit.id,
                    data_kind: &unit.data_kind,
                    ancestors: unit.ancestors.iter().map(String::as_str).collect(),
                })
                .collect(),
        }
    }
}
