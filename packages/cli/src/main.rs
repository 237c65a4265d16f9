#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the CHIRPS COG batch pipeline.
//!
//! Uses `indicatif-log-bridge` (via [`chirps_cog_cli_utils::init_logger`])
//! to route `log` output through `indicatif::MultiProgress` so that log
//! lines and progress bars never fight for the terminal.

mod commands;

use std::path::PathBuf;

use chirps_cog_config::PipelineConfig;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chirps_cog", about = "CHIRPS rainfall archive to clipped COG pipeline")]
struct Cli {
    /// TOML file merged over the built-in defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the source archive's year listings and file counts
    Discover {
        /// Also sum the size column of every year listing
        #[arg(long)]
        estimate_size: bool,
    },
    /// Chunk work items and submit one batch task per chunk
    Dispatch {
        /// JSON file of work items to dispatch instead of running discovery
        #[arg(long)]
        items: Option<PathBuf>,
        /// Print the planned tasks without creating a job
        #[arg(long)]
        dry_run: bool,
    },
    /// Process the chunk handed to this batch task (worker entry point)
    RunTask {
        /// Scratch directory for downloads and outputs
        #[arg(long, default_value = "/tmp/processing")]
        workspace: PathBuf,
    },
    /// Convert files on this machine without uploading
    LocalRun {
        /// Files converted at once (defaults to `local_concurrency`)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Only process the first N discovered files
        #[arg(long)]
        limit: Option<usize>,
        /// Output directory
        #[arg(long, default_value = "data/local")]
        workspace: PathBuf,
    },
    /// Report progress from the tasks' checkpoint records
    Status {
        /// Keep polling until Ctrl-C
        #[arg(long)]
        continuous: bool,
        /// Minutes between polls (defaults to `poll_interval_minutes`)
        #[arg(long)]
        interval_minutes: Option<u64>,
        /// List every failed file instead of the summary
        #[arg(long)]
        failed: bool,
        /// With `--failed`, also write the failed items to this JSON file
        /// for `dispatch --items`
        #[arg(long, requires = "failed")]
        write_items: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = chirps_cog_cli_utils::init_logger();
    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Discover { estimate_size } => {
            commands::discover(&config, estimate_size).await?;
        }
        Commands::Dispatch { items, dry_run } => {
            commands::dispatch(&config, items.as_deref(), dry_run).await?;
        }
        Commands::RunTask { workspace } => {
            commands::run_task(&config, workspace).await?;
        }
        Commands::LocalRun {
            concurrency,
            limit,
            workspace,
        } => {
            commands::local_run(
                &config,
                &multi,
                concurrency.unwrap_or(config.local_concurrency),
                limit,
                &workspace,
            )
            .await?;
        }
        Commands::Status {
            continuous,
            interval_minutes,
            failed,
            write_items,
        } => {
            let interval =
                interval_minutes.map_or_else(|| config.poll_interval(), chirps_cog_config::minutes);
            commands::status(&config, continuous, interval, failed, write_items.as_deref())
                .await?;
        }
    }

    Ok(())
}
