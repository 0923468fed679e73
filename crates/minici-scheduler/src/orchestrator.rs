//! Build orchestrator: start, stop and observe builds.
//!
//! The registry maps every build that has a live pipeline task to its
//! cancellation token and log sink. One mutex guards it, and `start_build`
//! holds that mutex across the conflict check, task creation and insertion,
//! so two concurrent starts for one project cannot both pass the check.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use minici_core::{BuildStatus, BuildTask, Error, Project, ResourceId, Result};
use minici_db::{BuildRepo, BuildTransition, ProjectRepo};
use minici_executor::{LogSink, LogSubscription, SinkError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::pipeline::{BuildOutcome, BuildPipeline, PipelineSettings, persist_terminal};

/// Default and maximum page size for [`Orchestrator::list_builds`].
pub const DEFAULT_LIST_LIMIT: i64 = 20;
pub const MAX_LIST_LIMIT: i64 = 100;

struct RunningBuild {
    project_id: ResourceId,
    cancel: CancellationToken,
    sink: Arc<LogSink>,
}

type Registry = Arc<Mutex<HashMap<ResourceId, RunningBuild>>>;

pub struct Orchestrator {
    projects: Arc<dyn ProjectRepo>,
    builds: Arc<dyn BuildRepo>,
    pipeline: Arc<BuildPipeline>,
    running: Registry,
}

impl Orchestrator {
    pub fn new(
        projects: Arc<dyn ProjectRepo>,
        builds: Arc<dyn BuildRepo>,
        settings: PipelineSettings,
    ) -> Self {
        let pipeline = BuildPipeline::new(projects.clone(), builds.clone(), settings);
        Self {
            projects,
            builds,
            pipeline: Arc::new(pipeline),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        self.pipeline.settings()
    }

    /// Accept a build for `project_id` and run it in the background.
    ///
    /// Returns the new task in `pending`, with its log path set. Fails with
    /// `Conflict` while another build of the project is pending or running.
    pub async fn start_build(&self, project_id: ResourceId) -> Result<BuildTask> {
        let project = self.projects.get_by_id(project_id).await?;

        let mut running = self.running.lock().await;
        if running.values().any(|b| b.project_id == project_id) {
            return Err(Error::Conflict(format!(
                "project {} already has a running build",
                project_id
            )));
        }
        let active = self.builds.find_active_for_project(project_id).await?;
        if let Some(existing) = active.first() {
            return Err(Error::Conflict(format!(
                "project {} already has build {} in {}",
                project_id, existing.id, existing.status
            )));
        }

        let mut task = self.builds.create(project_id).await?;
        let sink = match self.pipeline.open_log(&mut task).await {
            Ok(sink) => sink,
            Err(e) => {
                if let Err(cleanup) = self.builds.delete(task.id).await {
                    warn!(build_id = %task.id, error = %cleanup, "Failed to remove unstarted build");
                }
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        running.insert(
            task.id,
            RunningBuild {
                project_id,
                cancel: cancel.clone(),
                sink: sink.clone(),
            },
        );
        drop(running);

        info!(build_id = %task.id, project_id = %project_id, "Build accepted");
        self.spawn_pipeline(project, task.clone(), sink, cancel);
        Ok(task)
    }

    fn spawn_pipeline(
        &self,
        project: Project,
        task: BuildTask,
        sink: Arc<LogSink>,
        cancel: CancellationToken,
    ) {
        let build_id = task.id;
        let pipeline = self.pipeline.clone();
        let handle = tokio::spawn(async move { pipeline.run(project, task, sink, cancel).await });

        let running = self.running.clone();
        let builds = self.builds.clone();
        tokio::spawn(async move {
            let outcome = handle.await;
            running.lock().await.remove(&build_id);

            match outcome {
                Ok(BuildOutcome::Succeeded { duration_secs }) => {
                    info!(build_id = %build_id, duration_secs, "Build succeeded");
                }
                Ok(BuildOutcome::Failed {
                    error,
                    duration_secs,
                }) => {
                    warn!(build_id = %build_id, duration_secs, error = %error, "Build failed");
                }
                Ok(BuildOutcome::Superseded) => {
                    info!(build_id = %build_id, "Build finished after being stopped");
                }
                Ok(BuildOutcome::Unrecorded { error }) => {
                    error!(build_id = %build_id, error = %error, "Build finished but its status was not saved");
                }
                Err(join_err) => {
                    error!(build_id = %build_id, error = %join_err, "Build task panicked");
                    let now = Utc::now();
                    let transition = BuildTransition::finish(BuildStatus::Failed, now, 0);
                    if let Err(e) =
                        persist_terminal(builds.as_ref(), build_id, &BuildStatus::ACTIVE, transition)
                            .await
                    {
                        error!(build_id = %build_id, error = %e, "Could not fail panicked build");
                    }
                }
            }
        });
    }

    /// Cancel a running build and mark it `failed` immediately.
    ///
    /// Only builds in the registry can be stopped; anything else is
    /// `NotFound`, including a build whose pipeline has already recorded its
    /// outcome but not yet left the registry. The process group is killed
    /// asynchronously.
    pub async fn stop_build(&self, build_id: ResourceId) -> Result<()> {
        let entry = self
            .running
            .lock()
            .await
            .remove(&build_id)
            .ok_or_else(|| Error::NotFound(format!("build {} is not running", build_id)))?;
        entry.cancel.cancel();

        let task = self.builds.get_by_id(build_id).await?;
        let now = Utc::now();
        let transition = BuildTransition::finish(BuildStatus::Failed, now, task.elapsed_secs(now));
        let applied = self
            .builds
            .transition(build_id, &BuildStatus::ACTIVE, transition)
            .await?;
        if !applied {
            info!(build_id = %build_id, "Stop raced with build completion");
            return Err(Error::NotFound(format!("build {} already finished", build_id)));
        }

        info!(build_id = %build_id, "Build stopped");
        Ok(())
    }

    pub async fn get_status(&self, build_id: ResourceId) -> Result<BuildStatus> {
        Ok(self.builds.get_by_id(build_id).await?.status)
    }

    pub async fn get_build(&self, build_id: ResourceId) -> Result<BuildTask> {
        Ok(self.builds.get_by_id(build_id).await?)
    }

    /// Newest first. `limit` defaults to 20 and is clamped to `1..=100`.
    pub async fn list_builds(
        &self,
        project_id: ResourceId,
        limit: Option<i64>,
    ) -> Result<Vec<BuildTask>> {
        self.projects.get_by_id(project_id).await?;
        let limit = limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        Ok(self.builds.list_for_project(project_id, limit).await?)
    }

    /// Live output of a build that is still in the registry.
    ///
    /// Only output written from now on is delivered; earlier output is in the
    /// log file.
    pub async fn subscribe(&self, build_id: ResourceId) -> Result<LogSubscription> {
        let running = self.running.lock().await;
        let entry = running
            .get(&build_id)
            .ok_or_else(|| Error::NotFound(format!("build {} is not running", build_id)))?;
        entry.sink.subscribe().map_err(|e| match e {
            SinkError::Closed => Error::NotFound(format!("build {} has finished", build_id)),
            other => Error::Storage(other.to_string()),
        })
    }

    /// Fail every `pending`/`running` task left by a previous process.
    ///
    /// Call once at startup, before accepting requests.
    pub async fn reconcile_orphans(&self) -> Result<Vec<ResourceId>> {
        let running = self.running.lock().await;
        if !running.is_empty() {
            return Err(Error::Internal(
                "cannot reconcile while builds are running".to_string(),
            ));
        }
        let failed = self.builds.fail_orphaned(Utc::now()).await?;
        for id in &failed {
            warn!(build_id = %id, "Marked orphaned build failed");
        }
        Ok(failed)
    }

    /// Ids of builds with a live pipeline task.
    pub async fn running_builds(&self) -> Vec<ResourceId> {
        self.running.lock().await.keys().copied().collect()
    }

    /// Cancel every running build. Their pipelines record the failure.
    pub async fn cancel_all(&self) -> usize {
        let running = self.running.lock().await;
        for (id, build) in running.iter() {
            info!(build_id = %id, "Cancelling build for shutdown");
            build.cancel.cancel();
        }
        running.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use minici_db::{DbResult, MemoryStore, NewProject};
    use std::path::{Path, PathBuf};
    use std::process::Command;
    use std::time::Duration;

    struct Harness {
        dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        orchestrator: Orchestrator,
        origin: PathBuf,
    }

    fn init_origin(dir: &Path) -> PathBuf {
        let origin = dir.join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .args(["-c", "user.name=minici", "-c", "user.email=minici@localhost"])
                .args(args)
                .current_dir(&origin)
                .status()
                .unwrap();
            assert!(status.success(), "git {:?} failed", args);
        };
        run(&["init", "-q", "-b", "main"]);
        std::fs::write(origin.join("build.sh"), "echo built\n").unwrap();
        run(&["add", "build.sh"]);
        run(&["commit", "-q", "-m", "initial"]);
        origin
    }

    /// Holds the pipeline between its terminal write and leaving the registry.
    struct SlowStamp {
        inner: Arc<MemoryStore>,
        delay: Duration,
    }

    #[async_trait]
    impl ProjectRepo for SlowStamp {
        async fn create(&self, project: NewProject) -> DbResult<Project> {
            ProjectRepo::create(self.inner.as_ref(), project).await
        }

        async fn get_by_id(&self, id: ResourceId) -> DbResult<Project> {
            ProjectRepo::get_by_id(self.inner.as_ref(), id).await
        }

        async fn set_last_build_at(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.set_last_build_at(id, at).await
        }
    }

    fn harness(timeout: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_origin(dir.path());
        let store = Arc::new(MemoryStore::new());
        let settings = PipelineSettings {
            logs_dir: dir.path().join("logs"),
            workspaces_dir: dir.path().join("projects"),
            timeout,
        };
        let orchestrator = Orchestrator::new(store.clone(), store.clone(), settings);
        Harness {
            dir,
            store,
            orchestrator,
            origin,
        }
    }

    impl Harness {
        async fn project(&self, build_cmd: &str) -> Project {
            self.project_at(&self.origin.to_string_lossy(), build_cmd)
                .await
        }

        async fn project_at(&self, repo_url: &str, build_cmd: &str) -> Project {
            ProjectRepo::create(
                self.store.as_ref(),
                NewProject::new("demo", repo_url, "main", build_cmd),
            )
            .await
            .unwrap()
        }

        async fn wait_terminal(&self, build_id: ResourceId) -> BuildTask {
            for _ in 0..600 {
                let task = self.orchestrator.get_build(build_id).await.unwrap();
                if task.status.is_terminal() {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("build {} never finished", build_id);
        }

        async fn wait_idle(&self) {
            for _ in 0..600 {
                if self.orchestrator.running_builds().await.is_empty() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("pipelines never left the registry");
        }

        fn log(&self, task: &BuildTask) -> String {
            std::fs::read_to_string(task.log_path.as_ref().unwrap()).unwrap()
        }
    }

    #[tokio::test]
    async fn test_successful_build() {
        let h = harness(Duration::from_secs(60));
        let project = h.project("sh build.sh").await;

        let task = h.orchestrator.start_build(project.id).await.unwrap();
        assert_eq!(task.status, BuildStatus::Pending);
        let expected_log = h.orchestrator.settings().log_path(project.id, task.id);
        assert_eq!(task.log_path.as_deref(), expected_log.to_str());

        let done = h.wait_terminal(task.id).await;
        h.wait_idle().await;
        assert_eq!(done.status, BuildStatus::Success);
        assert!(done.started_at.is_some());
        assert!(done.finished_at.is_some());
        assert!(done.duration.unwrap() >= 0);

        let log = h.log(&done);
        assert!(log.contains("✓ clone succeeded"));
        assert!(log.contains("built"));
        assert!(log.contains("✓ build succeeded"));

        let project = ProjectRepo::get_by_id(h.store.as_ref(), project.id)
            .await
            .unwrap();
        assert_eq!(project.last_build_at, done.finished_at);
        assert_eq!(
            h.orchestrator.get_status(task.id).await.unwrap(),
            BuildStatus::Success
        );
    }

    #[tokio::test]
    async fn test_failed_build_keeps_last_build_time() {
        let h = harness(Duration::from_secs(60));
        let project = h.project("echo nope >&2; exit 1").await;

        let task = h.orchestrator.start_build(project.id).await.unwrap();
        let done = h.wait_terminal(task.id).await;
        assert_eq!(done.status, BuildStatus::Failed);
        assert!(h.log(&done).contains("✗ build failed after"));

        let project = ProjectRepo::get_by_id(h.store.as_ref(), project.id)
            .await
            .unwrap();
        assert!(project.last_build_at.is_none());
    }

    #[tokio::test]
    async fn test_second_start_conflicts() {
        let h = harness(Duration::from_secs(60));
        let project = h.project("sleep 30").await;

        let first = h.orchestrator.start_build(project.id).await.unwrap();
        let err = h.orchestrator.start_build(project.id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        h.orchestrator.stop_build(first.id).await.unwrap();
        h.wait_idle().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_starts_create_one_build() {
        let h = harness(Duration::from_secs(60));
        let project = h.project("sleep 30").await;

        let (a, b) = tokio::join!(
            h.orchestrator.start_build(project.id),
            h.orchestrator.start_build(project.id)
        );
        let (started, rejected) = match (a, b) {
            (Ok(task), Err(err)) | (Err(err), Ok(task)) => (task, err),
            (a, b) => panic!("expected one start and one conflict, got {:?} and {:?}", a, b),
        };
        assert!(matches!(rejected, Error::Conflict(_)));
        assert_eq!(h.store.all_builds().len(), 1);

        h.orchestrator.stop_build(started.id).await.unwrap();
        h.wait_idle().await;
    }

    #[tokio::test]
    async fn test_conflict_from_stored_active_build() {
        let h = harness(Duration::from_secs(60));
        let project = h.project("true").await;
        // Left behind by another process; not in this registry.
        BuildRepo::create(h.store.as_ref(), project.id).await.unwrap();

        let err = h.orchestrator.start_build(project.id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_stop_running_build() {
        let h = harness(Duration::from_secs(60));
        let project = h.project("echo started; sleep 30").await;

        let task = h.orchestrator.start_build(project.id).await.unwrap();
        let mut sub = h.orchestrator.subscribe(task.id).await.unwrap();
        // Wait until the build command is actually running.
        let mut seen = String::new();
        while !seen.contains("started") {
            let chunk = sub.recv().await.expect("log ended before the command ran");
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }

        h.orchestrator.stop_build(task.id).await.unwrap();
        let stopped = h.orchestrator.get_build(task.id).await.unwrap();
        assert_eq!(stopped.status, BuildStatus::Failed);
        assert!(stopped.finished_at.is_some());

        // The pipeline closes the log once the killed process group is reaped,
        // and its own terminal write does not override the stop.
        tokio::time::timeout(Duration::from_secs(10), async {
            while sub.recv().await.is_some() {}
        })
        .await
        .unwrap();
        let after = h.orchestrator.get_build(task.id).await.unwrap();
        assert_eq!(after.finished_at, stopped.finished_at);
        assert!(h.log(&after).contains("✗ build cancelled"));

        // A fresh build is accepted right away.
        let next = h.orchestrator.start_build(project.id).await.unwrap();
        h.orchestrator.stop_build(next.id).await.unwrap();
        h.wait_idle().await;
    }

    #[tokio::test]
    async fn test_stop_unknown_build() {
        let h = harness(Duration::from_secs(60));
        let err = h
            .orchestrator
            .stop_build(ResourceId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stop_finished_build_is_not_found() {
        let h = harness(Duration::from_secs(60));
        let project = h.project("true").await;
        let task = h.orchestrator.start_build(project.id).await.unwrap();
        h.wait_terminal(task.id).await;
        h.wait_idle().await;

        let err = h.orchestrator.stop_build(task.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(
            h.orchestrator.get_status(task.id).await.unwrap(),
            BuildStatus::Success
        );
    }

    #[tokio::test]
    async fn test_stop_after_completion_recorded_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_origin(dir.path());
        let store = Arc::new(MemoryStore::new());
        let projects = Arc::new(SlowStamp {
            inner: store.clone(),
            delay: Duration::from_millis(1500),
        });
        let orchestrator = Orchestrator::new(
            projects,
            store.clone(),
            PipelineSettings {
                logs_dir: dir.path().join("logs"),
                workspaces_dir: dir.path().join("projects"),
                timeout: Duration::from_secs(60),
            },
        );
        let project = ProjectRepo::create(
            store.as_ref(),
            NewProject::new("demo", origin.to_string_lossy(), "main", "true"),
        )
        .await
        .unwrap();

        let task = orchestrator.start_build(project.id).await.unwrap();
        let mut finished = None;
        for _ in 0..600 {
            let current = orchestrator.get_build(task.id).await.unwrap();
            if current.status.is_terminal() {
                finished = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let finished = finished.expect("build never finished");
        assert_eq!(finished.status, BuildStatus::Success);
        // Still registered while the project stamp is pending.
        assert!(orchestrator.running_builds().await.contains(&task.id));

        let err = orchestrator.stop_build(task.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let after = orchestrator.get_build(task.id).await.unwrap();
        assert_eq!(after.status, BuildStatus::Success);
        assert_eq!(after.finished_at, finished.finished_at);
    }

    #[tokio::test]
    async fn test_timeout_fails_build() {
        let h = harness(Duration::from_secs(2));
        let project = h.project("sleep 30").await;

        let started = std::time::Instant::now();
        let task = h.orchestrator.start_build(project.id).await.unwrap();
        let done = h.wait_terminal(task.id).await;
        assert_eq!(done.status, BuildStatus::Failed);
        assert!(started.elapsed() < Duration::from_secs(20));
        assert!(done.finished_at.is_some());
        assert!(done.duration.is_some());
        assert!(h.log(&done).contains("✗ build timed out after 2s"));
    }

    #[tokio::test]
    async fn test_sync_failure_skips_build_command() {
        let h = harness(Duration::from_secs(60));
        let missing = h.dir.path().join("no-such-repo");
        let marker = h.dir.path().join("built");
        let project = h
            .project_at(
                &missing.to_string_lossy(),
                &format!("touch {}", marker.display()),
            )
            .await;

        let task = h.orchestrator.start_build(project.id).await.unwrap();
        let done = h.wait_terminal(task.id).await;
        assert_eq!(done.status, BuildStatus::Failed);
        assert!(!marker.exists());
        let log = h.log(&done);
        assert!(log.contains("✗ clone failed"));
        assert!(!log.contains("==> running build command"));
    }

    #[tokio::test]
    async fn test_unwritable_log_dir_leaves_no_task() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("logs");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::new(
            store.clone(),
            store.clone(),
            PipelineSettings {
                logs_dir: blocker,
                workspaces_dir: dir.path().join("projects"),
                timeout: Duration::from_secs(60),
            },
        );
        let project = ProjectRepo::create(
            store.as_ref(),
            NewProject::new("demo", "file:///nowhere", "main", "true"),
        )
        .await
        .unwrap();

        let err = orchestrator.start_build(project.id).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(store.all_builds().is_empty());
        assert!(orchestrator.running_builds().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_unknown_project() {
        let h = harness(Duration::from_secs(60));
        let err = h
            .orchestrator
            .start_build(ResourceId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_subscriber_sees_live_output_until_close() {
        let h = harness(Duration::from_secs(60));
        let project = h.project("sleep 1; echo live-line").await;

        let task = h.orchestrator.start_build(project.id).await.unwrap();
        let mut sub = h.orchestrator.subscribe(task.id).await.unwrap();

        let mut received = String::new();
        while let Some(chunk) = sub.recv().await {
            received.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(received.contains("live-line"));
        assert!(received.contains("✓ build succeeded"));

        h.wait_idle().await;
        let err = h.orchestrator.subscribe(task.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_builds_newest_first() {
        let h = harness(Duration::from_secs(60));
        let project = h.project("true").await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            let task = h.orchestrator.start_build(project.id).await.unwrap();
            h.wait_terminal(task.id).await;
            h.wait_idle().await;
            ids.push(task.id);
        }

        let listed = h.orchestrator.list_builds(project.id, Some(2)).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, ids[2]);

        let err = h
            .orchestrator
            .list_builds(ResourceId::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reconcile_orphans() {
        let h = harness(Duration::from_secs(60));
        let project = h.project("true").await;
        let orphan = BuildRepo::create(h.store.as_ref(), project.id).await.unwrap();

        let failed = h.orchestrator.reconcile_orphans().await.unwrap();
        assert_eq!(failed, vec![orphan.id]);
        assert_eq!(
            h.orchestrator.get_status(orphan.id).await.unwrap(),
            BuildStatus::Failed
        );

        // The project is free again.
        let task = h.orchestrator.start_build(project.id).await.unwrap();
        h.wait_terminal(task.id).await;
        h.wait_idle().await;
    }
}
