//! minici API server

use anyhow::Context;
use clap::Parser;
use minici_api::{AppState, routes};
use minici_config::SystemConfig;
use minici_db::{PgBuildRepo, PgProjectRepo, create_pool, run_migrations};
use minici_scheduler::{Orchestrator, PipelineSettings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long running builds get to record their failure on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "minici-server")]
#[command(about = "minici build server", version)]
struct Args {
    /// Path to a KDL config file
    #[arg(short, long, env = "MINICI_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = SystemConfig::load(args.config.as_deref()).context("Failed to load config")?;

    info!("Connecting to database...");
    let pool = create_pool(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool).await.context("Failed to run migrations")?;
    info!("Database connected");

    let settings = PipelineSettings {
        logs_dir: config.storage.logs_dir(),
        workspaces_dir: config.storage.workspaces_dir(),
        timeout: config.builds.timeout(),
    };
    info!(
        logs_dir = %settings.logs_dir.display(),
        workspaces_dir = %settings.workspaces_dir.display(),
        timeout_secs = settings.timeout.as_secs(),
        "Build settings"
    );
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(PgProjectRepo::new(pool.clone())),
        Arc::new(PgBuildRepo::new(pool.clone())),
        settings,
    ));

    let orphans = orchestrator.reconcile_orphans().await?;
    if !orphans.is_empty() {
        warn!(count = orphans.len(), "Failed builds left over from a previous run");
    }

    let state = AppState::new(orchestrator.clone(), Some(pool));
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", config.server.listen);
    let listener = TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.listen))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let cancelled = orchestrator.cancel_all().await;
    if cancelled > 0 {
        info!(cancelled, "Waiting for cancelled builds to finish");
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while !orchestrator.running_builds().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("Builds still running at exit; they will be failed on next start");
        }
    }

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutting down...");
}
