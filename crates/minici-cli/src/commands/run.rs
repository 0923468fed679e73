//! Local one-shot build.
//!
//! Runs the same pipeline the server runs, backed by the in-memory store, and
//! prints the build output as it is produced. Ctrl+C cancels the build.

use anyhow::{Context, Result, bail};
use minici_db::{BuildRepo, MemoryStore, NewProject, ProjectRepo};
use minici_scheduler::{BuildOutcome, BuildPipeline, PipelineSettings};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct LocalBuild {
    pub repo: String,
    pub branch: String,
    pub build_cmd: String,
    pub data_dir: PathBuf,
    pub timeout: Duration,
}

pub async fn run_local(build: LocalBuild) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let project = ProjectRepo::create(
        store.as_ref(),
        NewProject::new(
            project_name(&build.repo),
            build.repo.as_str(),
            build.branch.as_str(),
            build.build_cmd.as_str(),
        ),
    )
    .await?;

    let settings = PipelineSettings {
        logs_dir: build.data_dir.join("logs"),
        workspaces_dir: build.data_dir.join("projects"),
        timeout: build.timeout,
    };
    let pipeline = Arc::new(BuildPipeline::new(store.clone(), store.clone(), settings));

    let mut task = BuildRepo::create(store.as_ref(), project.id).await?;
    let sink = pipeline.open_log(&mut task).await?;
    let mut output = sink.subscribe().context("Failed to attach to build output")?;
    println!(
        "Build {} of {} (log: {})",
        task.id.short(),
        project.name,
        sink.path().display()
    );

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling build...");
                cancel.cancel();
            }
        })
    };

    let build_id = task.id;
    let runner = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run(project, task, sink, cancel).await })
    };

    let mut stdout = std::io::stdout();
    while let Some(chunk) = output.recv().await {
        stdout.write_all(&chunk)?;
        stdout.flush()?;
    }

    let outcome = runner.await.context("Build task failed")?;
    interrupt.abort();

    let stored = BuildRepo::get_by_id(store.as_ref(), build_id).await?;
    match outcome {
        BuildOutcome::Succeeded { duration_secs } => {
            println!("\n✓ Build {} succeeded in {}s", build_id.short(), duration_secs);
            Ok(())
        }
        BuildOutcome::Failed { error, .. } => bail!("Build {} failed: {}", build_id.short(), error),
        BuildOutcome::Superseded => bail!("Build {} was cancelled ({})", build_id.short(), stored.status),
        BuildOutcome::Unrecorded { error } => bail!("Build {} status was not recorded: {}", build_id.short(), error),
    }
}

/// Last path segment of the repository, without `.git`.
fn project_name(repo: &str) -> String {
    let trimmed = repo.trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next().unwrap_or(trimmed);
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        "local".to_string()
    } else {
        name.to_string()
    }
}
