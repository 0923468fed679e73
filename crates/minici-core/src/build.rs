//! Projects and build tasks.
//!
//! A [`Project`] is owned by the administration side of the system; the build
//! subsystem only reads its repository settings and stamps `last_build_at`.
//! A [`BuildTask`] is one execution attempt with its own lifecycle and log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, ResourceId};

/// A registered source repository that can be built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ResourceId,
    pub name: String,
    /// Clone URL of the repository.
    pub repo_url: String,
    /// Branch checked out for every build.
    pub branch: String,
    /// Shell command run from the workspace root.
    pub build_cmd: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Finish time of the last successful build.
    pub last_build_at: Option<DateTime<Utc>>,
}

/// Lifecycle state of a build task.
///
/// `pending -> running -> success | failed`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl BuildStatus {
    /// States a task can still leave.
    pub const ACTIVE: [BuildStatus; 2] = [BuildStatus::Pending, BuildStatus::Running];

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "running" => Ok(BuildStatus::Running),
            "success" => Ok(BuildStatus::Success),
            "failed" => Ok(BuildStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown build status: {}", other))),
        }
    }
}

/// One execution attempt of a project's build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTask {
    pub id: ResourceId,
    pub project_id: ResourceId,
    pub status: BuildStatus,
    /// Location of the durable log, set once the log file exists.
    pub log_path: Option<String>,
    /// Wall-clock duration in whole seconds, set on terminal transition.
    pub duration: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildTask {
    /// Whole seconds between `started_at` and `now`, clamped at zero.
    ///
    /// Builds that never started report zero.
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> i64 {
        self.started_at
            .map(|started| (now - started).num_seconds().max(0))
            .unwrap_or(0)
    }

    pub fn summary(&self) -> BuildTaskSummary {
        BuildTaskSummary::from(self)
    }
}

/// Transport view of a [`BuildTask`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTaskSummary {
    pub id: ResourceId,
    pub project_id: ResourceId,
    pub status: BuildStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&BuildTask> for BuildTaskSummary {
    fn from(task: &BuildTask) -> Self {
        Self {
            id: task.id,
            project_id: task.project_id,
            status: task.status,
            log_path: task.log_path.clone(),
            duration: task.duration,
            started_at: task.started_at,
            finished_at: task.finished_at,
            created_at: task.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_task(status: BuildStatus) -> BuildTask {
        BuildTask {
            id: ResourceId::new(),
            project_id: ResourceId::new(),
            status,
            log_path: None,
            duration: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
        assert!(BuildStatus::Success.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_string_forms() {
        for status in [
            BuildStatus::Pending,
            BuildStatus::Running,
            BuildStatus::Success,
            BuildStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
        assert!("queued".parse::<BuildStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&BuildStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }

    #[test]
    fn test_elapsed_without_start_is_zero() {
        let task = make_task(BuildStatus::Pending);
        assert_eq!(task.elapsed_secs(Utc::now()), 0);
    }

    #[test]
    fn test_elapsed_counts_whole_seconds() {
        let mut task = make_task(BuildStatus::Running);
        let started = Utc::now();
        task.started_at = Some(started);
        assert_eq!(task.elapsed_secs(started + Duration::milliseconds(2900)), 2);
        assert_eq!(task.elapsed_secs(started - Duration::seconds(5)), 0);
    }

    #[test]
    fn test_summary_omits_unset_fields() {
        let task = make_task(BuildStatus::Pending);
        let json = serde_json::to_value(task.summary()).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json.get("log_path").is_none());
        assert!(json.get("finished_at").is_none());
    }
}
