//! Workspace sync and the build command.
//!
//! A project's workspace is a plain git checkout reused across builds. The
//! first build clones it; later builds fetch, check out and pull the branch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use minici_core::Project;
use tracing::{info, warn};

use crate::error::StepError;
use crate::process::{RunControl, StepCommand, run_step};
use crate::sink::LogSink;

/// Everything needed to sync and build one project.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub repo_url: String,
    pub branch: String,
    pub build_cmd: String,
    pub workspace: PathBuf,
}

impl BuildJob {
    pub fn for_project(project: &Project, workspace: impl Into<PathBuf>) -> Self {
        Self {
            repo_url: project.repo_url.clone(),
            branch: project.branch.clone(),
            build_cmd: project.build_cmd.clone(),
            workspace: workspace.into(),
        }
    }

    /// A workspace counts as present once it holds a git repository.
    pub fn has_checkout(&self) -> bool {
        self.workspace.join(".git").exists()
    }
}

/// Sync the workspace, then run the build command inside it.
///
/// Progress markers go to `sink` before and after each phase. Marker write
/// failures are logged and otherwise ignored; only the steps decide the result.
pub async fn execute_build(
    job: &BuildJob,
    sink: &Arc<LogSink>,
    control: &RunControl,
) -> Result<(), StepError> {
    sync_workspace(job, sink, control).await?;
    run_build_command(job, sink, control).await
}

pub async fn sync_workspace(
    job: &BuildJob,
    sink: &Arc<LogSink>,
    control: &RunControl,
) -> Result<(), StepError> {
    if job.has_checkout() {
        update_checkout(job, sink, control).await
    } else {
        clone_checkout(job, sink, control).await
    }
}

async fn clone_checkout(
    job: &BuildJob,
    sink: &Arc<LogSink>,
    control: &RunControl,
) -> Result<(), StepError> {
    marker(
        sink,
        &format!("==> cloning {} (branch {})", job.repo_url, job.branch),
    );
    info!(repo = %job.repo_url, branch = %job.branch, workspace = %job.workspace.display(), "Cloning workspace");

    if let Err(e) = prepare_clone_target(&job.workspace).await {
        marker(sink, &format!("✗ clone failed: {}", e));
        return Err(StepError::Workspace(e));
    }

    let clone = git("clone")
        .args(["clone", "-b", job.branch.as_str(), job.repo_url.as_str()])
        .arg(job.workspace.to_string_lossy());
    match run_step(&clone, sink, control).await {
        Ok(()) => {
            marker(sink, "✓ clone succeeded");
            Ok(())
        }
        Err(e) => {
            marker(sink, &format!("✗ clone failed: {}", e));
            Err(e)
        }
    }
}

async fn update_checkout(
    job: &BuildJob,
    sink: &Arc<LogSink>,
    control: &RunControl,
) -> Result<(), StepError> {
    marker(
        sink,
        &format!("==> updating workspace (branch {})", job.branch),
    );
    info!(workspace = %job.workspace.display(), branch = %job.branch, "Updating workspace");

    let steps = [
        git("fetch").current_dir(&job.workspace).args(["fetch", "--all"]),
        git("checkout")
            .current_dir(&job.workspace)
            .args(["checkout", job.branch.as_str()]),
        git("pull")
            .current_dir(&job.workspace)
            .args(["pull", "origin", job.branch.as_str()]),
    ];

    for step in &steps {
        if let Err(e) = run_step(step, sink, control).await {
            marker(sink, &format!("✗ {} failed: {}", step.step(), e));
            return Err(e);
        }
    }

    marker(sink, "✓ workspace updated");
    Ok(())
}

async fn run_build_command(
    job: &BuildJob,
    sink: &Arc<LogSink>,
    control: &RunControl,
) -> Result<(), StepError> {
    marker(sink, &format!("==> running build command: {}", job.build_cmd));

    let cmd = StepCommand::shell("build command", job.build_cmd.as_str()).current_dir(&job.workspace);
    match run_step(&cmd, sink, control).await {
        Ok(()) => {
            marker(sink, "✓ build command succeeded");
            Ok(())
        }
        Err(e) => {
            marker(sink, &format!("✗ build command failed: {}", e));
            Err(e)
        }
    }
}

fn git(step: &str) -> StepCommand {
    // Never wait on a credential prompt; there is no terminal.
    StepCommand::new(step, "git").env("GIT_TERMINAL_PROMPT", "0")
}

/// Make sure the parent exists and nothing non-repo sits at the target.
async fn prepare_clone_target(workspace: &Path) -> std::io::Result<()> {
    if tokio::fs::try_exists(workspace).await? {
        warn!(workspace = %workspace.display(), "Removing stale workspace without a git checkout");
        tokio::fs::remove_dir_all(workspace).await?;
    }
    if let Some(parent) = workspace.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Write a progress line; a failure here never changes the build outcome.
pub fn marker(sink: &LogSink, line: &str) {
    if let Err(e) = sink.write_line(line) {
        warn!(log = %sink.path().display(), error = %e, "Failed to write log marker");
    }
}
