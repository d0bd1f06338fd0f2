mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands::{
    config::ConfigCommands,
    failures::FailureCommands,
    order::{OrderCommands, SummaryCommands},
    pipeline::ReconcileArgs,
    queue::QueueCommands,
};

#[derive(Parser)]
#[command(author, version, about = "Change-feed CQRS pipeline for order summaries")]
struct Cli {
    /// Path to the configuration file. Defaults to ~/.streamcqrs/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write order records through the command gateway
    Order {
        #[command(subcommand)]
        command: OrderCommands,
    },
    /// Read account summaries through the query gateway
    Summary {
        #[command(subcommand)]
        command: SummaryCommands,
    },
    /// Run the dispatcher and queue workers until interrupted
    Run,
    /// Process all outstanding change events and queue messages, then exit
    Drain,
    /// Replay stored orders and compare them with the stored summary
    Reconcile(ReconcileArgs),
    /// Inspect and manage parked dispatcher failures
    Failures {
        #[command(subcommand)]
        command: FailureCommands,
    },
    /// Inspect and manage the summary delta queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Show or update configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Print this process's metrics in Prometheus text format
    Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;
    streamcqrs::observability::init()?;

    let Cli { config, command } = Cli::parse();

    match command {
        Commands::Order { command } => commands::order::execute(config, command)?,
        Commands::Summary { command } => commands::order::execute_summary(config, command)?,
        Commands::Run => commands::pipeline::run(config).await?,
        Commands::Drain => commands::pipeline::drain(config)?,
        Commands::Reconcile(args) => commands::pipeline::reconcile(config, args)?,
        Commands::Failures { command } => commands::failures::execute(config, command)?,
        Commands::Queue { command } => commands::queue::execute(config, command)?,
        Commands::Config { command } => commands::config::execute(config, command)?,
        Commands::Metrics => commands::pipeline::metrics(config)?,
    }

    Ok(())
}
