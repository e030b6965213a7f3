use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Topic-driven action coordination engine")]
pub struct Cli {
    /// Log at debug level (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory to look for conductor.toml in (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Explicit path to a configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the configured actions over HTTP
    Serve {
        /// Address to bind, overrides [server] bind and CONDUCTOR_BIND
        #[arg(long)]
        bind: Option<String>,
    },
    /// Show the phase plan a topic would run, without running it
    Plan {
        /// Concrete topic, e.g. http/get/users/42
        topic: String,
    },
    /// List registered topic patterns and their actions
    Routes,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default conductor.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Config { command } => {
            cmd::cmd_config(&project_dir, cli.config.as_deref(), command.clone())?
        }
        Commands::Serve { bind } => {
            let config = cmd::load_config(&cli, &project_dir)?;
            cmd::cmd_serve(config, bind.clone()).await?;
        }
        Commands::Plan { topic } => {
            let config = cmd::load_config(&cli, &project_dir)?;
            cmd::cmd_plan(&config, topic)?;
        }
        Commands::Routes => {
            let config = cmd::load_config(&cli, &project_dir)?;
            cmd::cmd_routes(&config)?;
        }
    }

    Ok(())
}
