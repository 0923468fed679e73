//! One build from `pending` to a terminal state.
//!
//! All status writes here are conditional. A stop request that already moved
//! the task to `failed` wins; the pipeline's own terminal write then does not
//! apply and the outcome is [`BuildOutcome::Superseded`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use minici_core::{BuildStatus, BuildTask, Error, Project, ResourceId, Result};
use minici_db::{BuildRepo, BuildTransition, DbError, DbResult, ProjectRepo};
use minici_executor::{BuildJob, LogSink, RunControl, StepError, execute_build, marker};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(250);

/// Where builds keep their files and how long they may run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub logs_dir: PathBuf,
    pub workspaces_dir: PathBuf,
    pub timeout: Duration,
}

impl PipelineSettings {
    /// `<logs>/project_<id>/build_<id>.log`
    pub fn log_path(&self, project_id: ResourceId, build_id: ResourceId) -> PathBuf {
        self.logs_dir
            .join(format!("project_{}", project_id))
            .join(format!("build_{}.log", build_id))
    }

    /// `<workspaces>/<project id>`, reused by every build of the project.
    pub fn workspace(&self, project_id: ResourceId) -> PathBuf {
        self.workspaces_dir.join(project_id.to_string())
    }
}

/// How a pipeline run ended, from the pipeline's point of view.
#[derive(Debug)]
pub enum BuildOutcome {
    Succeeded { duration_secs: i64 },
    Failed { error: Error, duration_secs: i64 },
    /// Someone else moved the task to a terminal state first.
    Superseded,
    /// The terminal state could not be persisted.
    Unrecorded { error: DbError },
}

pub struct BuildPipeline {
    projects: Arc<dyn ProjectRepo>,
    builds: Arc<dyn BuildRepo>,
    settings: PipelineSettings,
}

impl BuildPipeline {
    pub fn new(
        projects: Arc<dyn ProjectRepo>,
        builds: Arc<dyn BuildRepo>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            projects,
            builds,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Create the build's log file and record its path on the task.
    pub async fn open_log(&self, task: &mut BuildTask) -> Result<Arc<LogSink>> {
        let path = self.settings.log_path(task.project_id, task.id);
        let sink = LogSink::create(&path).map_err(|e| Error::Storage(e.to_string()))?;

        let path = path.to_string_lossy().into_owned();
        if let Err(e) = self.builds.set_log_path(task.id, &path).await {
            if let Err(close_err) = sink.close() {
                warn!(build_id = %task.id, error = %close_err, "Closing build log failed");
            }
            return Err(Error::Storage(format!("could not record log path: {}", e)));
        }
        task.log_path = Some(path);
        Ok(Arc::new(sink))
    }

    /// Run the build to completion. Always closes `sink`.
    pub async fn run(
        &self,
        project: Project,
        task: BuildTask,
        sink: Arc<LogSink>,
        cancel: CancellationToken,
    ) -> BuildOutcome {
        let control = RunControl::new(cancel, self.settings.timeout);
        let outcome = self.drive(&project, &task, &sink, &control).await;
        if let Err(e) = sink.close() {
            warn!(build_id = %task.id, error = %e, "Closing build log failed");
        }
        outcome
    }

    async fn drive(
        &self,
        project: &Project,
        task: &BuildTask,
        sink: &Arc<LogSink>,
        control: &RunControl,
    ) -> BuildOutcome {
        let started_at = Utc::now();
        match self
            .builds
            .transition(task.id, &[BuildStatus::Pending], BuildTransition::start(started_at))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(build_id = %task.id, "Build was stopped before it started");
                marker(sink, "✗ build cancelled");
                return BuildOutcome::Superseded;
            }
            Err(e) => {
                error!(build_id = %task.id, error = %e, "Could not mark build running");
                marker(sink, &format!("✗ build failed after 0s: {}", e));
                let failed = self
                    .record(task.id, &BuildStatus::ACTIVE, BuildStatus::Failed, Utc::now(), 0)
                    .await;
                if let Err(db_err) = failed {
                    warn!(build_id = %task.id, error = %db_err, "Build failure could not be recorded either");
                }
                return BuildOutcome::Failed {
                    error: Error::Internal(format!("could not start build: {}", e)),
                    duration_secs: 0,
                };
            }
        }
        info!(build_id = %task.id, project_id = %project.id, "Build started");

        let job = BuildJob::for_project(project, self.settings.workspace(project.id));
        let result = execute_build(&job, sink, control).await;
        let finished_at = Utc::now();
        let duration_secs = (finished_at - started_at).num_seconds().max(0);

        match result {
            Ok(()) => {
                marker(sink, &format!("✓ build succeeded in {}s", duration_secs));
                let recorded = self
                    .record(
                        task.id,
                        &[BuildStatus::Running],
                        BuildStatus::Success,
                        finished_at,
                        duration_secs,
                    )
                    .await;
                match recorded {
                    Ok(None) => {
                        if let Err(e) = self.projects.set_last_build_at(project.id, finished_at).await {
                            warn!(project_id = %project.id, error = %e, "Failed to update last build time");
                        }
                        BuildOutcome::Succeeded { duration_secs }
                    }
                    Ok(Some(outcome)) => outcome,
                    Err(error) => BuildOutcome::Unrecorded { error },
                }
            }
            Err(err) => {
                let line = match &err {
                    StepError::TimedOut => {
                        format!("✗ build timed out after {}s", control.timeout().as_secs())
                    }
                    StepError::Cancelled => "✗ build cancelled".to_string(),
                    other => format!("✗ build failed after {}s: {}", duration_secs, other),
                };
                marker(sink, &line);

                let error = Error::from(err);
                let recorded = self
                    .record(
                        task.id,
                        &[BuildStatus::Running],
                        BuildStatus::Failed,
                        finished_at,
                        duration_secs,
                    )
                    .await;
                match recorded {
                    Ok(None) => BuildOutcome::Failed {
                        error,
                        duration_secs,
                    },
                    Ok(Some(outcome)) => outcome,
                    Err(error) => BuildOutcome::Unrecorded { error },
                }
            }
        }
    }

    /// Persist a terminal state. `Ok(None)` means it applied,
    /// `Ok(Some(Superseded))` means another writer got there first.
    async fn record(
        &self,
        id: ResourceId,
        from: &[BuildStatus],
        status: BuildStatus,
        at: DateTime<Utc>,
        duration_secs: i64,
    ) -> DbResult<Option<BuildOutcome>> {
        let transition = BuildTransition::finish(status, at, duration_secs);
        let applied = persist_terminal(self.builds.as_ref(), id, from, transition).await?;
        Ok((!applied).then_some(BuildOutcome::Superseded))
    }
}

/// Conditional terminal write with a few retries on storage errors.
pub(crate) async fn persist_terminal(
    builds: &dyn BuildRepo,
    id: ResourceId,
    from: &[BuildStatus],
    transition: BuildTransition,
) -> DbResult<bool> {
    let mut attempt = 1;
    loop {
        match builds.transition(id, from, transition.clone()).await {
            Ok(applied) => return Ok(applied),
            Err(e @ DbError::NotFound(_)) => return Err(e),
            Err(e) if attempt < TERMINAL_WRITE_ATTEMPTS => {
                warn!(build_id = %id, attempt, error = %e, "Terminal status write failed, retrying");
                tokio::time::sleep(TERMINAL_WRITE_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                error!(build_id = %id, status = %transition.status, error = %e, "Giving up on terminal status write");
                return Err(e);
            }
        }
    }
}
