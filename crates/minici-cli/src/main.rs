//! minici CLI tool.

use clap::{Parser, Subcommand};
use minici_config::system::DEFAULT_BUILD_TIMEOUT_SECS;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "minici")]
#[command(about = "minici build CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "MINICI_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Control builds on the server
    Builds {
        #[command(subcommand)]
        command: BuildCommands,
    },
    /// Build a repository locally, without a server or database
    Run {
        /// Repository URL or local path
        repo: String,
        /// Branch to build
        #[arg(short, long, default_value = "master")]
        branch: String,
        /// Shell command run inside the checkout
        #[arg(short = 'c', long = "cmd")]
        build_cmd: String,
        /// Directory for logs and the checkout
        #[arg(long, default_value = ".minici")]
        data_dir: PathBuf,
        /// Build timeout in seconds
        #[arg(long, default_value_t = DEFAULT_BUILD_TIMEOUT_SECS)]
        timeout: u64,
    },
}

#[derive(Subcommand)]
enum BuildCommands {
    /// Start a build for a project
    Start {
        /// Project ID
        project: String,
    },
    /// Stop a running build
    Stop {
        /// Build ID
        id: String,
    },
    /// Print a build's status
    Status {
        /// Build ID
        id: String,
    },
    /// Show build details
    Show {
        /// Build ID
        id: String,
    },
    /// List recent builds of a project
    List {
        /// Project ID
        project: String,
        /// Maximum number of builds to show
        #[arg(long, default_value = "10")]
        limit: u32,
    },
    /// Print a build's log
    Logs {
        /// Build ID
        id: String,
        /// Keep printing until the build finishes
        #[arg(short, long)]
        follow: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Builds { command } => {
            let client = commands::builds::ApiClient::new(&cli.api_url);
            match command {
                BuildCommands::Start { project } => {
                    commands::builds::start(&client, &project).await?;
                }
                BuildCommands::Stop { id } => {
                    commands::builds::stop(&client, &id).await?;
                }
                BuildCommands::Status { id } => {
                    commands::builds::status(&client, &id).await?;
                }
                BuildCommands::Show { id } => {
                    commands::builds::show(&client, &id).await?;
                }
                BuildCommands::List { project, limit } => {
                    commands::builds::list(&client, &project, limit).await?;
                }
                BuildCommands::Logs { id, follow } => {
                    commands::builds::logs(&client, &id, follow).await?;
                }
            }
        }
        Commands::Run {
            repo,
            branch,
            build_cmd,
            data_dir,
            timeout,
        } => {
            commands::run::run_local(commands::run::LocalBuild {
                repo,
                branch,
                build_cmd,
                data_dir,
                timeout: std::time::Duration::from_secs(timeout),
            })
            .await?;
        }
    }

    Ok(())
}
