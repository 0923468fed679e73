//! Build control endpoints.

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use minici_core::{BuildTaskSummary, ResourceId};

/// Routes under `/projects`.
pub fn project_router() -> Router<AppState> {
    Router::new().route("/{id}/builds", get(list_builds).post(start_build))
}

/// Routes under `/builds`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(get_build))
        .route("/{id}/status", get(get_status))
        .route("/{id}/stop", post(stop_build))
        .route("/{id}/logs", get(get_logs))
}

async fn start_build(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<(StatusCode, Json<BuildTaskSummary>), ApiError> {
    let task = state
        .orchestrator
        .start_build(ResourceId::from_uuid(project_id))
        .await?;
    Ok((StatusCode::CREATED, Json(task.summary())))
}

#[derive(Debug, Deserialize)]
struct ListBuildsQuery {
    limit: Option<i64>,
}

async fn list_builds(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<ListBuildsQuery>,
) -> Result<Json<Vec<BuildTaskSummary>>, ApiError> {
    let builds = state
        .orchestrator
        .list_builds(ResourceId::from_uuid(project_id), query.limit)
        .await?;
    Ok(Json(builds.iter().map(BuildTaskSummary::from).collect()))
}

async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BuildTaskSummary>, ApiError> {
    let task = state
        .orchestrator
        .get_build(ResourceId::from_uuid(id))
        .await?;
    Ok(Json(task.summary()))
}

async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let status = state
        .orchestrator
        .get_status(ResourceId::from_uuid(id))
        .await?;
    Ok(Json(json!({ "id": id, "status": status })))
}

async fn stop_build(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .stop_build(ResourceId::from_uuid(id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The durable log file, whatever has been written so far.
async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .orchestrator
        .get_build(ResourceId::from_uuid(id))
        .await?;
    let path = task
        .log_path
        .ok_or_else(|| ApiError::NotFound(format!("build {} has no log", id)))?;

    let content = match tokio::fs::read(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound(format!("log file for build {} is gone", id)));
        }
        Err(e) => return Err(ApiError::Internal(format!("reading log failed: {}", e))),
    };

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        content,
    ))
}
