//! In-memory store implementing both repositories.
//!
//! Used by tests and by the CLI's local `run` command, where there is no
//! database. Semantics match the PostgreSQL implementation, including the
//! conditional transition and the one-running-build-per-project constraint.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minici_core::{BuildStatus, BuildTask, Project, ResourceId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::{BuildRepo, BuildTransition, DbError, DbResult, NewProject, ProjectRepo};

#[derive(Default)]
struct State {
    projects: HashMap<ResourceId, Project>,
    builds: HashMap<ResourceId, BuildTask>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test thread panicked mid-update; the
        // maps themselves are still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every build task, unordered.
    pub fn all_builds(&self) -> Vec<BuildTask> {
        self.lock().builds.values().cloned().collect()
    }
}

#[async_trait]
impl ProjectRepo for MemoryStore {
    async fn create(&self, project: NewProject) -> DbResult<Project> {
        let now = Utc::now();
        let project = Project {
            id: ResourceId::new(),
            name: project.name,
            repo_url: project.repo_url,
            branch: project.branch,
            build_cmd: project.build_cmd,
            created_at: now,
            updated_at: now,
            last_build_at: None,
        };
        self.lock().projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_by_id(&self, id: ResourceId) -> DbResult<Project> {
        self.lock()
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("project {}", id)))
    }

    async fn set_last_build_at(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<()> {
        let mut state = self.lock();
        let project = state
            .projects
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("project {}", id)))?;
        project.last_build_at = Some(at);
        project.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl BuildRepo for MemoryStore {
    async fn create(&self, project_id: ResourceId) -> DbResult<BuildTask> {
        let mut state = self.lock();
        if !state.projects.contains_key(&project_id) {
            return Err(DbError::NotFound(format!("project {}", project_id)));
        }
        let task = BuildTask {
            id: ResourceId::new(),
            project_id,
            status: BuildStatus::Pending,
            log_path: None,
            duration: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        state.builds.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_by_id(&self, id: ResourceId) -> DbResult<BuildTask> {
        self.lock()
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    async fn list_for_project(
        &self,
        project_id: ResourceId,
        limit: i64,
    ) -> DbResult<Vec<BuildTask>> {
        let mut builds: Vec<BuildTask> = self
            .lock()
            .builds
            .values()
            .filter(|b| b.project_id == project_id)
            .cloned()
            .collect();
        builds.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        builds.truncate(limit.max(0) as usize);
        Ok(builds)
    }

    async fn find_active_for_project(&self, project_id: ResourceId) -> DbResult<Vec<BuildTask>> {
        Ok(self
            .lock()
            .builds
            .values()
            .filter(|b| b.project_id == project_id && !b.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn set_log_path(&self, id: ResourceId, path: &str) -> DbResult<()> {
        let mut state = self.lock();
        let task = state
            .builds
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        task.log_path = Some(path.to_string());
        Ok(())
    }

    async fn transition(
        &self,
        id: ResourceId,
        from: &[BuildStatus],
        transition: BuildTransition,
    ) -> DbResult<bool> {
        let mut state = self.lock();
        let current = state
            .builds
            .get(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        if !from.contains(&current.status) {
            return Ok(false);
        }

        if transition.status == BuildStatus::Running {
            let project_id = current.project_id;
            let clash = state.builds.values().any(|b| {
                b.id != id && b.project_id == project_id && b.status == BuildStatus::Running
            });
            if clash {
                return Err(DbError::Duplicate(format!("another build is running ({})", id)));
            }
        }

        let Some(task) = state.builds.get_mut(&id) else {
            return Err(DbError::NotFound(format!("build {}", id)));
        };
        task.status = transition.status;
        if transition.started_at.is_some() {
            task.started_at = transition.started_at;
        }
        if transition.finished_at.is_some() {
            task.finished_at = transition.finished_at;
        }
        if transition.duration.is_some() {
            task.duration = transition.duration;
        }
        Ok(true)
    }

    async fn delete(&self, id: ResourceId) -> DbResult<()> {
        self.lock().builds.remove(&id);
        Ok(())
    }

    async fn fail_orphaned(&self, finished_at: DateTime<Utc>) -> DbResult<Vec<ResourceId>> {
        let mut state = self.lock();
        let mut ids = Vec::new();
        for task in state.builds.values_mut().filter(|b| !b.status.is_terminal()) {
            task.duration = Some(task.elapsed_secs(finished_at));
            task.status = BuildStatus::Failed;
            task.finished_at = Some(finished_at);
            ids.push(task.id);
        }
        Ok(ids)
    }
}
