//! Project repository.
//!
//! Project administration lives outside the build service. The build side
//! needs to look projects up and stamp the last build time; `create` exists
//! for seeding and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minici_core::{Project, ResourceId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// Fields needed to register a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub build_cmd: String,
}

impl NewProject {
    pub fn new(
        name: impl Into<String>,
        repo_url: impl Into<String>,
        branch: impl Into<String>,
        build_cmd: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            repo_url: repo_url.into(),
            branch: branch.into(),
            build_cmd: build_cmd.into(),
        }
    }
}

#[async_trait]
pub trait ProjectRepo: Send + Sync {
    async fn create(&self, project: NewProject) -> DbResult<Project>;
    async fn get_by_id(&self, id: ResourceId) -> DbResult<Project>;
    async fn set_last_build_at(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<()>;
}

#[derive(Debug, sqlx::FromRow)]
struct ProjectRow {
    id: uuid::Uuid,
    name: String,
    repo_url: String,
    branch: String,
    build_cmd: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_build_at: Option<DateTime<Utc>>,
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        Project {
            id: ResourceId::from_uuid(row.id),
            name: row.name,
            repo_url: row.repo_url,
            branch: row.branch,
            build_cmd: row.build_cmd,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_build_at: row.last_build_at,
        }
    }
}

/// PostgreSQL implementation of ProjectRepo.
pub struct PgProjectRepo {
    pool: PgPool,
}

impl PgProjectRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectRepo for PgProjectRepo {
    async fn create(&self, project: NewProject) -> DbResult<Project> {
        let row = sqlx::query_as::<_, ProjectRow>(
            r#"
            INSERT INTO projects (id, name, repo_url, branch, build_cmd, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(&project.name)
        .bind(&project.repo_url)
        .bind(&project.branch)
        .bind(&project.build_cmd)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_by_id(&self, id: ResourceId) -> DbResult<Project> {
        let row = sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("project {}", id)))?;
        Ok(row.into())
    }

    async fn set_last_build_at(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE projects SET last_build_at = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("project {}", id)));
        }
        Ok(())
    }
}
