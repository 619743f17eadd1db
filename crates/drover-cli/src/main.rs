//! Drover CLI - inspect and manage tasks in a drover SQLite store

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "droverctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the task database (overrides the config file)
    #[arg(short, long)]
    db_path: Option<PathBuf>,

    /// JSON config file with `store` and `manager` sections
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Task counts per status and what is claimable now
    Status,

    /// List tasks
    List {
        /// Only tasks with this status
        #[arg(short, long)]
        status: Option<String>,

        /// Only tasks of this type
        #[arg(short = 't', long)]
        task_type: Option<String>,

        /// Maximum number of tasks to show
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Show one task document as JSON
    Show { id: String },

    /// Make tasks due now
    RunNow { ids: Vec<String> },

    /// Enable tasks
    Enable {
        ids: Vec<String>,

        /// Also make them due now
        #[arg(long)]
        run_soon: bool,
    },

    /// Disable tasks
    Disable { ids: Vec<String> },

    /// Remove tasks
    Remove {
        ids: Vec<String>,

        /// Also remove tasks that are currently claimed or running
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let config = config::CliConfig::load(cli.config.as_deref())?;
    let store = config.open_store(cli.db_path)?;

    match cli.command {
        Commands::Status => {
            commands::status::execute(&store, &config.manager).await?;
        }
        Commands::List {
            status,
            task_type,
            limit,
        } => {
            commands::list::list(&store, status, task_type, limit).await?;
        }
        Commands::Show { id } => {
            commands::list::show(&store, &id).await?;
        }
        Commands::RunNow { ids } => {
            commands::tasks::run_now(&store, &ids).await?;
        }
        Commands::Enable { ids, run_soon } => {
            commands::tasks::set_enabled(&store, &ids, true, run_soon).await?;
        }
        Commands::Disable { ids } => {
            commands::tasks::set_enabled(&store, &ids, false, false).await?;
        }
        Commands::Remove { ids, force } => {
            commands::tasks::remove(&store, &ids, force).await?;
        }
    }

    Ok(())
}
