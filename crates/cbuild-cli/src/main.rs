//! cbuild CLI tool.

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "cbuild")]
#[command(about = "cbuild CI CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "CBUILD_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a build manifest and print its build order
    Validate {
        /// Path to the manifest
        #[arg(default_value = "cbuild.kdl")]
        path: String,
        /// System config providing defaults and allowed projects
        #[arg(long, env = "CBUILD_CONFIG")]
        config: Option<String>,
        /// Repository the manifest belongs to, as host/owner/name
        #[arg(long, default_value = "github.com/local/repo")]
        repo: String,
        /// Commit used for variable interpolation
        #[arg(long, default_value = "0000000")]
        commit: String,
    },
    /// Inspect and stop executions
    Executions {
        #[command(subcommand)]
        command: ExecutionCommands,
    },
}

#[derive(Subcommand)]
enum ExecutionCommands {
    /// List recent executions of a repository
    List {
        /// Repository as host/owner/name
        repo: String,
        /// Only executions of this commit
        #[arg(long)]
        commit: Option<String>,
        /// Maximum number of executions to show
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Show execution details
    Show {
        /// Repository as host/owner/name
        repo: String,
        /// Execution ID, as commit/number
        id: String,
    },
    /// Request a stop of a running execution
    Stop {
        /// Repository as host/owner/name
        repo: String,
        /// Execution ID, as commit/number
        id: String,
        /// Recorded as the user requesting the stop
        #[arg(long, env = "USER", default_value = "cli")]
        user: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate {
            path,
            config,
            repo,
            commit,
        } => {
            commands::validate(&path, config.as_deref(), &repo, &commit)?;
        }
        Commands::Executions { command } => match command {
            ExecutionCommands::List {
                repo,
                commit,
                limit,
            } => {
                commands::executions::list(&cli.api_url, &repo, commit, limit).await?;
            }
            ExecutionCommands::Show { repo, id } => {
                commands::executions::show(&cli.api_url, &repo, &id).await?;
            }
            ExecutionCommands::Stop { repo, id, user } => {
                commands::executions::stop(&cli.api_url, &repo, &id, &user).await?;
            }
        },
    }

    Ok(())
}
