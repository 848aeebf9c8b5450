// src/exec/process.rs

//! Local job backend that runs operators as child processes.
//!
//! Each job gets a scratch directory `<root>/<scratch name>` with `inputs/`
//! and `output/` below it. The operator's `command` is run through `sh -c`
//! inside that directory, with the job name as `$0` and the operator's
//! `args` as positional parameters. The container `image` is recorded but
//! not used: this backend runs everything on the host.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactRegistrar;
use crate::errors::{DatamillError, Result};
use crate::exec::backend::{JobBackend, JobHandle, JobState};
use crate::exec::job_spec::{INPUT_DIR, JobSpec, MANIFEST_FILE, OUTPUT_DIR, OutputManifest};
use crate::types::BoxFuture;

/// Internal handle for a job this backend started.
///
/// `cancel` stops the child process; `state` is updated by the task that
/// owns the process.
struct ActiveJob {
    state: JobState,
    cancel: Option<oneshot::Sender<()>>,
}

type JobTable = Arc<Mutex<HashMap<String, ActiveJob>>>;

#[derive(Clone)]
pub struct ProcessBackend {
    root: PathBuf,
    registrar: ArtifactRegistrar,
    jobs: JobTable,
}

impl std::fmt::Debug for ProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessBackend")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ProcessBackend {
    /// Backend keeping scratch directories under `root`. Produced artifacts
    /// are registered through `registrar`, which is also where inputs are
    /// fetched from.
    pub fn new(root: impl Into<PathBuf>, registrar: ArtifactRegistrar) -> Self {
        Self {
            root: root.into(),
            registrar,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scratch_dir(&self, scratch_name: &str) -> Result<PathBuf> {
        if scratch_name.is_empty()
            || !scratch_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(DatamillError::BackendDispatchFailure(format!(
                "invalid scratch name '{scratch_name}'"
            )));
        }
        Ok(self.root.join(scratch_name))
    }

    fn with_jobs<T>(&self, f: impl FnOnce(&mut HashMap<String, ActiveJob>) -> T) -> Result<T> {
        with_table(&self.jobs, f)
    }

    async fn submit_inner(&self, spec: JobSpec) -> Result<JobHandle> {
        let Some(command) = spec.operator.command.clone() else {
            return Err(DatamillError::BackendDispatchFailure(format!(
                "job {}: operator image '{}' has no command to run locally",
                spec.job_name, spec.operator.image
            )));
        };
        let scratch = self.scratch_dir(&spec.scratch_name)?;
        if !tokio::fs::try_exists(&scratch).await.unwrap_or(false) {
            return Err(DatamillError::BackendDispatchFailure(format!(
                "job {}: scratch {} was not provisioned",
                spec.job_name, spec.scratch_name
            )));
        }

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let job_name = spec.job_name.clone();

        let inserted = self.with_jobs(|jobs| {
            if jobs.contains_key(&job_name) {
                return false;
            }
            jobs.insert(
                job_name.clone(),
                ActiveJob {
                    state: JobState::Pending,
                    cancel: Some(cancel_tx),
                },
            );
            true
        })?;
        if !inserted {
            return Err(DatamillError::BackendDispatchFailure(format!(
                "job {job_name} already exists"
            )));
        }

        let registrar = self.registrar.clone();
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            let name = spec.job_name.clone();
            let state = match run_job(&spec, &command, &scratch, &registrar, cancel_rx).await {
                Ok(Some(state)) => state,
                Ok(None) => {
                    debug!(job = %name, "job cancelled");
                    return;
                }
                Err(err) => {
                    error!(job = %name, error = %err, "job execution error");
                    JobState::Failed
                }
            };

            let recorded = with_table(&jobs, |jobs| {
                if let Some(job) = jobs.get_mut(&name) {
                    job.state = state;
                    job.cancel = None;
                }
            });
            if let Err(e) = recorded {
                warn!(job = %name, error = %e, "could not record job state");
            }
        });

        Ok(JobHandle { job_name })
    }
}

fn with_table<T>(jobs: &JobTable, f: impl FnOnce(&mut HashMap<String, ActiveJob>) -> T) -> Result<T> {
    let mut guard = jobs
        .lock()
        .map_err(|_| DatamillError::BackendDispatchFailure("job table poisoned".to_string()))?;
    Ok(f(&mut guard))
}

impl JobBackend for ProcessBackend {
    fn provision_scratch<'a>(&'a self, scratch_name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let dir = self.scratch_dir(scratch_name)?;
            for sub in [INPUT_DIR, OUTPUT_DIR] {
                tokio::fs::create_dir_all(dir.join(sub))
                    .await
                    .with_context(|| format!("creating {}", dir.join(sub).display()))?;
            }
            Ok(())
        })
    }

    fn submit(&self, spec: JobSpec) -> BoxFuture<'_, Result<JobHandle>> {
        Box::pin(self.submit_inner(spec))
    }

    fn poll<'a>(&'a self, handle: &'a JobHandle) -> BoxFuture<'a, Result<JobState>> {
        Box::pin(async move {
            self.with_jobs(|jobs| jobs.get(&handle.job_name).map(|job| job.state))?
                .ok_or_else(|| DatamillError::NotFound {
                    kind: "job",
                    id: handle.job_name.clone(),
                })
        })
    }

    fn teardown<'a>(&'a self, handle: &'a JobHandle) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let removed = self.with_jobs(|jobs| jobs.remove(&handle.job_name))?;
            match removed.and_then(|mut job| job.cancel.take()) {
                Some(cancel) => {
                    info!(job = %handle.job_name, "stopping job");
                    let _ = cancel.send(());
                }
                None => debug!(job = %handle.job_name, "nothing left to stop"),
            }
            Ok(())
        })
    }

    fn release_scratch<'a>(&'a self, scratch_name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let dir = self.scratch_dir(scratch_name)?;
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(DatamillError::IoError(e)),
            }
        })
    }
}

/// Stage in, run the operator, stage out.
///
/// Returns `None` if the job was cancelled before it finished.
async fn run_job(
    spec: &JobSpec,
    command: &str,
    scratch: &Path,
    registrar: &ArtifactRegistrar,
    mut cancel_rx: oneshot::Receiver<()>,
) -> anyhow::Result<Option<JobState>> {
    for input in &spec.stage_in {
        let bytes = registrar
            .artifacts()
            .get(&input.unit_id)
            .await
            .with_context(|| format!("fetching input {} for slot {}", input.unit_id, input.slot))?;
        tokio::fs::write(scratch.join(&input.path), bytes)
            .await
            .with_context(|| format!("staging input {}", input.unit_id))?;
    }

    info!(
        job = %spec.job_name,
        step_id = %spec.stage_out.step_id,
        cmd = %command,
        "starting operator process"
    );

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .arg(&spec.job_name)
        .args(&spec.operator.args)
        .current_dir(scratch)
        .envs(spec.operator.env.iter().map(|e| (&e.name, &e.value)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning process for job '{}'", spec.job_name))?;

    if let Some(stdout) = child.stdout.take() {
        log_lines(spec.job_name.clone(), "stdout", stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        log_lines(spec.job_name.clone(), "stderr", stderr);
    }

    tokio::select! {
        status_res = child.wait() => {
            let status = status_res
                .with_context(|| format!("waiting for process of job '{}'", spec.job_name))?;
            let code = status.code().unwrap_or(-1);
            info!(
                job = %spec.job_name,
                exit_code = code,
                success = status.success(),
                "operator process exited"
            );
            if !status.success() {
                return Ok(Some(JobState::Failed));
            }
        }

        cancel = &mut cancel_rx => {
            if cancel.is_ok() {
                info!(job = %spec.job_name, "job torn down while running; killing process");
                if let Err(e) = child.kill().await {
                    warn!(job = %spec.job_name, error = %e, "failed to kill operator process");
                }
            }
            return Ok(None);
        }
    }

    stage_out(spec, scratch, registrar).await?;
    Ok(Some(JobState::Succeeded))
}

/// Register everything listed in the output manifest with the producing
/// step. No manifest means the operator produced nothing.
async fn stage_out(spec: &JobSpec, scratch: &Path, registrar: &ArtifactRegistrar) -> anyhow::Result<()> {
    let output_dir = scratch.join(&spec.stage_out.output_dir);
    let manifest_path = output_dir.join(MANIFEST_FILE);

    let manifest: OutputManifest = match tokio::fs::read(&manifest_path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .with_context(|| format!("parsing {}", manifest_path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(job = %spec.job_name, "no output manifest; nothing to register");
            OutputManifest::default()
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", manifest_path.display())),
    };

    // Check the whole manifest before registering anything.
    if let Some(bad) = manifest
        .outputs
        .iter()
        .find(|entry| !spec.stage_out.allowed_kinds.contains(&entry.data_kind))
    {
        return Err(anyhow!(
            "job {} produced data kind '{}' which its operator does not declare",
            spec.job_name,
            bad.data_kind
        ));
    }

    // Read every file before registering anything, so a failed job never
    // leaves outputs behind in the pool.
    let output_root = tokio::fs::canonicalize(&output_dir)
        .await
        .with_context(|| format!("resolving {}", output_dir.display()))?;
    let mut staged = Vec::with_capacity(manifest.outputs.len());
    for entry in manifest.outputs {
        let path = output_file(&output_root, &entry.file)
            .await
            .with_context(|| format!("job {}: output '{}'", spec.job_name, entry.file))?;
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading output {}", path.display()))?;
        staged.push((entry.data_kind, bytes));
    }

    for (data_kind, bytes) in staged {
        let unit = registrar
            .register(
                &spec.stage_out.run_id,
                data_kind,
                bytes,
                Some(&spec.stage_out.step_id),
            )
            .await?;
        info!(
            job = %spec.job_name,
            unit_id = %unit.id,
            data_kind = %unit.data_kind,
            "output registered"
        );
    }

    Ok(())
}

/// Resolve a manifest entry to a file inside `output_root`.
///
/// Absolute paths, `..` components and symlinks leading out of the output
/// directory are refused.
async fn output_file(output_root: &Path, file: &str) -> anyhow::Result<PathBuf> {
    let relative = Path::new(file);
    if file.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
        return Err(anyhow!("path must be relative to the output directory"));
    }
    let resolved = tokio::fs::canonicalize(output_root.join(relative))
        .await
        .context("resolving output path")?;
    if !resolved.starts_with(output_root) {
        return Err(anyhow!("path leaves the output directory"));
    }
    Ok(resolved)
}

/// Consume a child stream so its buffer never fills; log at debug.
fn log_lines<R>(job: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(job = %job, stream, "{}", line);
        }
    });
}
