//! Application state.

use minici_scheduler::Orchestrator;
use sqlx::PgPool;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Checked by `/health/ready`. `None` when running on the in-memory store.
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, pool: Option<PgPool>) -> Self {
        Self { orchestrator, pool }
    }
}
