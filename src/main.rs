use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use fabtrack::config::FabtrackConfig;
use fabtrack::telemetry;

mod cmd;

#[derive(Parser)]
#[command(name = "fabtrack")]
#[command(version, about = "Production tracker for jobs, process chains and procedures")]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API server
    Serve {
        /// Port to serve on (overrides FABTRACK_PORT and fabtrack.toml)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, bind on all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database with default data
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Add demo users, workstations and a pending job
        #[arg(long)]
        demo: bool,
    },
    /// View, validate or create fabtrack.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default fabtrack.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = FabtrackConfig::new(project_dir)?;

    let filter = if cli.verbose {
        "debug"
    } else {
        config.toml.logging.filter.as_str()
    };
    telemetry::init_tracing(filter, config.log_json());

    match &cli.command {
        Commands::Serve { port, db_path, dev } => {
            cmd::cmd_serve(&config, *port, db_path.clone(), *dev).await?;
        }
        Commands::InitDb { db_path, demo } => {
            cmd::cmd_init_db(&config, db_path.clone(), *demo)?;
        }
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
