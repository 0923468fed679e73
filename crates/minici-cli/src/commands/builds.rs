//! Build commands against a running server.

use anyhow::{Context, Result, bail};
use minici_core::{BuildStatus, BuildTaskSummary, ResourceId};
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::time::Duration;

const FOLLOW_INTERVAL: Duration = Duration::from_secs(1);

pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: BuildStatus,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

impl ApiClient {
    pub fn new(api_url: &str) -> Self {
        Self {
            base: api_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base))?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) => bail!("{}: {}", status, err.error),
            Err(_) => bail!("{}: {}", status, body.trim()),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(self.http.get(self.url(path))).await?;
        response.json().await.context("Unexpected response body")
    }

    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let response = self.send(self.http.get(self.url(path))).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(self.http.post(self.url(path))).await?;
        response.json().await.context("Unexpected response body")
    }

    async fn post(&self, path: &str) -> Result<()> {
        self.send(self.http.post(self.url(path))).await?;
        Ok(())
    }
}

fn parse_id(kind: &str, raw: &str) -> Result<ResourceId> {
    raw.parse()
        .map_err(|_| anyhow::anyhow!("{} is not a valid {} id", raw, kind))
}

pub async fn start(client: &ApiClient, project: &str) -> Result<()> {
    let project_id = parse_id("project", project)?;
    let task: BuildTaskSummary = client
        .post_json(&format!("/projects/{}/builds", project_id))
        .await?;
    println!("Started build {}", task.id);
    print_summary(&task);
    Ok(())
}

pub async fn stop(client: &ApiClient, id: &str) -> Result<()> {
    let id = parse_id("build", id)?;
    client.post(&format!("/builds/{}/stop", id)).await?;
    println!("Stopped build {}", id);
    Ok(())
}

pub async fn status(client: &ApiClient, id: &str) -> Result<()> {
    let id = parse_id("build", id)?;
    let response: StatusResponse = client.get_json(&format!("/builds/{}/status", id)).await?;
    println!("{}", response.status);
    Ok(())
}

pub async fn show(client: &ApiClient, id: &str) -> Result<()> {
    let id = parse_id("build", id)?;
    let task: BuildTaskSummary = client.get_json(&format!("/builds/{}", id)).await?;
    print_summary(&task);
    Ok(())
}

pub async fn list(client: &ApiClient, project: &str, limit: u32) -> Result<()> {
    let project_id = parse_id("project", project)?;
    let builds: Vec<BuildTaskSummary> = client
        .get_json(&format!("/projects/{}/builds?limit={}", project_id, limit))
        .await?;

    if builds.is_empty() {
        println!("No builds");
        return Ok(());
    }
    println!("{:<10} {:<8} {:<20} {:>8}", "BUILD", "STATUS", "CREATED", "DURATION");
    for build in &builds {
        println!(
            "{:<10} {:<8} {:<20} {:>8}",
            build.id.short(),
            build.status,
            build.created_at.format("%Y-%m-%d %H:%M:%S"),
            format_duration(build.duration),
        );
    }
    Ok(())
}

/// Print the log; with `follow`, poll until the build is terminal.
pub async fn logs(client: &ApiClient, id: &str, follow: bool) -> Result<()> {
    let id = parse_id("build", id)?;
    let path = format!("/builds/{}/logs", id);
    let mut stdout = std::io::stdout();
    let mut printed = 0;

    loop {
        // Status first: once terminal, one more read is guaranteed complete.
        let done = if follow {
            let response: StatusResponse =
                client.get_json(&format!("/builds/{}/status", id)).await?;
            response.status.is_terminal()
        } else {
            true
        };

        let content = client.get_bytes(&path).await?;
        if content.len() > printed {
            stdout.write_all(&content[printed..])?;
            stdout.flush()?;
            printed = content.len();
        }

        if done {
            return Ok(());
        }
        tokio::time::sleep(FOLLOW_INTERVAL).await;
    }
}

fn print_summary(task: &BuildTaskSummary) {
    println!("  id:       {}", task.id);
    println!("  project:  {}", task.project_id);
    println!("  status:   {}", task.status);
    println!("  created:  {}", task.created_at.to_rfc3339());
    if let Some(started) = task.started_at {
        println!("  started:  {}", started.to_rfc3339());
    }
    if let Some(finished) = task.finished_at {
        println!("  finished: {}", finished.to_rfc3339());
    }
    if task.duration.is_some() {
        println!("  duration: {}", format_duration(task.duration));
    }
    if let Some(log) = &task.log_path {
        println!("  log:      {}", log);
    }
}

fn format_duration(secs: Option<i64>) -> String {
    match secs {
        None => "-".to_string(),
        Some(s) if s < 60 => format!("{}s", s),
        Some(s) => format!("{}m{:02}s", s / 60, s % 60),
    }
}
