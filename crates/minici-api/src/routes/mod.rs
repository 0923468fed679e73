//! API routes.

pub mod builds;
pub mod health;

use crate::AppState;
use crate::ws::build_logs_ws;
use axum::Router;
use axum::routing::get;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .route("/ws/builds/{id}/logs", get(build_logs_ws))
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/projects", builds::project_router())
        .nest("/builds", builds::router())
}
