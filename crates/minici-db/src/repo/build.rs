//! Build task repository.
//!
//! Status changes go through [`BuildRepo::transition`], a conditional update
//! that only applies while the task is in one of the expected states. This is
//! how a stop request and a finishing pipeline race without either one
//! overwriting a terminal state written by the other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minici_core::{BuildStatus, BuildTask, ResourceId};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A status change plus the timestamps that go with it.
///
/// `None` fields leave the stored value untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildTransition {
    pub status: BuildStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
}

impl BuildTransition {
    /// `pending -> running`.
    pub fn start(at: DateTime<Utc>) -> Self {
        Self {
            status: BuildStatus::Running,
            started_at: Some(at),
            finished_at: None,
            duration: None,
        }
    }

    /// Move to a terminal state.
    pub fn finish(status: BuildStatus, at: DateTime<Utc>, duration_secs: i64) -> Self {
        debug_assert!(status.is_terminal());
        Self {
            status,
            started_at: None,
            finished_at: Some(at),
            duration: Some(duration_secs.max(0)),
        }
    }
}

#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Create a task in `pending`.
    async fn create(&self, project_id: ResourceId) -> DbResult<BuildTask>;
    async fn get_by_id(&self, id: ResourceId) -> DbResult<BuildTask>;
    /// Newest first.
    async fn list_for_project(&self, project_id: ResourceId, limit: i64)
    -> DbResult<Vec<BuildTask>>;
    /// Tasks for the project that are `pending` or `running`.
    async fn find_active_for_project(&self, project_id: ResourceId) -> DbResult<Vec<BuildTask>>;
    async fn set_log_path(&self, id: ResourceId, path: &str) -> DbResult<()>;
    /// Apply `transition` only if the current status is in `from`.
    ///
    /// Returns whether the update was applied. Fails with `NotFound` when the
    /// task does not exist.
    async fn transition(
        &self,
        id: ResourceId,
        from: &[BuildStatus],
        transition: BuildTransition,
    ) -> DbResult<bool>;
    async fn delete(&self, id: ResourceId) -> DbResult<()>;
    /// Mark every non-terminal task `failed`. Returns the affected ids.
    async fn fail_orphaned(&self, finished_at: DateTime<Utc>) -> DbResult<Vec<ResourceId>>;
}

#[derive(Debug, sqlx::FromRow)]
struct BuildRow {
    id: uuid::Uuid,
    project_id: uuid::Uuid,
    status: String,
    log_path: Option<String>,
    duration: Option<i64>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<BuildRow> for BuildTask {
    type Error = DbError;

    fn try_from(row: BuildRow) -> DbResult<Self> {
        let status = row
            .status
            .parse()
            .map_err(|_| DbError::Corrupt(format!("build {} has status {:?}", row.id, row.status)))?;
        Ok(BuildTask {
            id: ResourceId::from_uuid(row.id),
            project_id: ResourceId::from_uuid(row.project_id),
            status,
            log_path: row.log_path,
            duration: row.duration,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

fn status_list(statuses: &[BuildStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn map_unique_violation(err: sqlx::Error, what: impl FnOnce() -> String) -> DbError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => DbError::Duplicate(what()),
        _ => DbError::Database(err),
    }
}

/// PostgreSQL implementation of BuildRepo.
pub struct PgBuildRepo {
    pool: PgPool,
}

impl PgBuildRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn exists(&self, id: ResourceId) -> DbResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM build_tasks WHERE id = $1)")
                .bind(id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}

#[async_trait]
impl BuildRepo for PgBuildRepo {
    async fn create(&self, project_id: ResourceId) -> DbResult<BuildTask> {
        let row = sqlx::query_as::<_, BuildRow>(
            r#"
            INSERT INTO build_tasks (id, project_id, status, created_at)
            VALUES ($1, $2, 'pending', NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(project_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_by_id(&self, id: ResourceId) -> DbResult<BuildTask> {
        sqlx::query_as::<_, BuildRow>("SELECT * FROM build_tasks WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?
            .try_into()
    }

    async fn list_for_project(
        &self,
        project_id: ResourceId,
        limit: i64,
    ) -> DbResult<Vec<BuildTask>> {
        let rows = sqlx::query_as::<_, BuildRow>(
            r#"
            SELECT * FROM build_tasks
            WHERE project_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(project_id.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BuildTask::try_from).collect()
    }

    async fn find_active_for_project(&self, project_id: ResourceId) -> DbResult<Vec<BuildTask>> {
        let rows = sqlx::query_as::<_, BuildRow>(
            r#"
            SELECT * FROM build_tasks
            WHERE project_id = $1 AND status = ANY($2)
            ORDER BY created_at DESC
            "#,
        )
        .bind(project_id.as_uuid())
        .bind(status_list(&BuildStatus::ACTIVE))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BuildTask::try_from).collect()
    }

    async fn set_log_path(&self, id: ResourceId, path: &str) -> DbResult<()> {
        let result = sqlx::query("UPDATE build_tasks SET log_path = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(path)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("build {}", id)));
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: ResourceId,
        from: &[BuildStatus],
        transition: BuildTransition,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE build_tasks
            SET status = $2,
                started_at = COALESCE($3, started_at),
                finished_at = COALESCE($4, finished_at),
                duration = COALESCE($5, duration)
            WHERE id = $1 AND status = ANY($6)
            "#,
        )
        .bind(id.as_uuid())
        .bind(transition.status.as_str())
        .bind(transition.started_at)
        .bind(transition.finished_at)
        .bind(transition.duration)
        .bind(status_list(from))
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, || format!("another build is running ({})", id)))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if !self.exists(id).await? {
            return Err(DbError::NotFound(format!("build {}", id)));
        }
        Ok(false)
    }

    async fn delete(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("DELETE FROM build_tasks WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail_orphaned(&self, finished_at: DateTime<Utc>) -> DbResult<Vec<ResourceId>> {
        let ids: Vec<uuid::Uuid> = sqlx::query_scalar(
            r#"
            UPDATE build_tasks
            SET status = 'failed',
                finished_at = $1,
                duration = COALESCE(FLOOR(EXTRACT(EPOCH FROM ($1 - started_at)))::BIGINT, 0)
            WHERE status = ANY($2)
            RETURNING id
            "#,
        )
        .bind(finished_at)
        .bind(status_list(&BuildStatus::ACTIVE))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ResourceId::from_uuid).collect())
    }
}
