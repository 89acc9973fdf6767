//! fetchq CLI - queue and run downloads from the terminal
//!
//! Downloads run in-process; the job ledger in the data directory keeps
//! their state between runs.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fetchq_types::{NotificationPolicy, Settings};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// fetchq - download queue with retries and resume
#[derive(Parser)]
#[command(name = "fetchq")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for settings and the job ledger
    #[arg(long, env = "FETCHQ_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human", global = true)]
    output: OutputFormat,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one or more URLs
    Get {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Output file, or directory when several URLs are given
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Do not show the job in download lists
        #[arg(long)]
        hidden: bool,

        /// Notification policy recorded with the job
        #[arg(long, value_parser = parse_policy)]
        notify: Option<NotificationPolicy>,
    },

    /// List jobs
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,

        /// Include hidden jobs
        #[arg(short, long)]
        all: bool,
    },

    /// Show job details
    Info {
        /// Job ID
        id: String,
    },

    /// Cancel a job
    Cancel {
        /// Job ID
        id: String,
    },

    /// Remove a job from the ledger
    Purge {
        /// Job ID
        id: String,

        /// Also delete the downloaded file and any partial data
        #[arg(long)]
        with_file: bool,
    },

    /// Resume paused jobs and run them to completion
    Resume {
        /// Job IDs; defaults to every interrupted job
        ids: Vec<String>,
    },

    /// Show or create settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show effective settings
    Show,

    /// Print where settings and the ledger live
    Path,

    /// Write default settings
    Init {
        /// Overwrite an existing settings file
        #[arg(long)]
        force: bool,
    },
}

fn parse_policy(value: &str) -> Result<NotificationPolicy, String> {
    value.parse()
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(Settings::default_data_dir);

    match cli.command {
        Commands::Get {
            urls,
            output,
            hidden,
            notify,
        } => commands::get(&data_dir, urls, output, hidden, notify, cli.output).await?,

        Commands::List { status, all } => commands::list(&data_dir, status, all, cli.output).await?,

        Commands::Info { id } => commands::info(&data_dir, &id, cli.output).await?,

        Commands::Cancel { id } => commands::cancel(&data_dir, &id, cli.output).await?,

        Commands::Purge { id, with_file } => {
            commands::purge(&data_dir, &id, with_file, cli.output).await?
        }

        Commands::Resume { ids } => commands::resume(&data_dir, ids, cli.output).await?,

        Commands::Config { action } => commands::config(&data_dir, action, cli.output).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "fetchq", &mut std::io::stdout());
        }
    }

    Ok(())
}
