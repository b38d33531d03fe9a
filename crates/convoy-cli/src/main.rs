//! Convoy CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(about = "Provision infrastructure and run the deployment pipeline", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, env = "CONVOY_CONFIG", default_value = "convoy.kdl")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration
    Validate,
    /// Show the provisioning order and the pipeline as it would run
    Plan {
        /// Branch of the simulated push (defaults to the trigger branch)
        #[arg(long)]
        branch: Option<String>,
        /// Commit of the simulated push
        #[arg(long, default_value = "HEAD")]
        sha: String,
    },
    /// Provision every unit and print the stack outputs as JSON
    Provision {
        #[command(flatten)]
        backends: commands::run::Backends,
    },
    /// Provision the stack and run the pipeline for a simulated push
    Run {
        /// Branch of the simulated push (defaults to the trigger branch)
        #[arg(long)]
        branch: Option<String>,
        /// Commit to build (defaults to the branch head)
        #[arg(long)]
        sha: Option<String>,
        #[command(flatten)]
        backends: commands::run::Backends,
    },
    /// Check a running server's liveness endpoint
    Health {
        /// Server URL
        #[arg(long, env = "CONVOY_API_URL", default_value = "http://localhost:3000")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate => {
            commands::validate(&cli.config)?;
        }
        Commands::Plan { branch, sha } => {
            commands::plan(&cli.config, branch, &sha)?;
        }
        Commands::Provision { backends } => {
            commands::run::provision(&cli.config, &backends).await?;
        }
        Commands::Run {
            branch,
            sha,
            backends,
        } => {
            commands::run::run(&cli.config, branch, sha, &backends).await?;
        }
        Commands::Health { url } => {
            commands::health(&url).await?;
        }
    }

    Ok(())
}
