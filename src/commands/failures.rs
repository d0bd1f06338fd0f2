use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};

use streamcqrs::checkpoint::FailureId;

use crate::commands::{confirm, open_pipeline};

#[derive(Subcommand)]
pub enum FailureCommands {
    /// List parked sub-batches
    List,
    /// Run a parked sub-batch through the pipeline again
    Redrive {
        /// Failure id as printed by `failures list` (shard:first-last)
        id: FailureId,
    },
    /// Remove every parked sub-batch
    Clear(ClearArgs),
}

#[derive(Args)]
pub struct ClearArgs {
    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

pub fn execute(config_path: Option<PathBuf>, command: FailureCommands) -> Result<()> {
    let pipeline = open_pipeline(config_path)?;
    let dispatcher = pipeline.dispatcher();

    match command {
        FailureCommands::List => {
            let failures = dispatcher.failures()?;
            if failures.is_empty() {
                println!("no parked failures");
                return Ok(());
            }
            for failure in failures {
                let tokens: Vec<String> = failure
                    .events
                    .iter()
                    .map(|event| event.token().to_string())
                    .collect();
                println!(
                    "id={} consumer={} events={} attempts={} parked_at={} tokens=[{}] last_error={}",
                    failure.id,
                    failure.consumer,
                    failure.events.len(),
                    failure.attempts,
                    failure.parked_at.to_rfc3339(),
                    tokens.join(","),
                    failure.last_error
                );
            }
        }
        FailureCommands::Redrive { id } => {
            let outcome = dispatcher.redrive(&id)?;
            println!(
                "redrive {}: delivered {} event(s), {} still parked",
                id, outcome.delivered, outcome.remaining
            );
        }
        FailureCommands::Clear(args) => {
            let count = dispatcher.failures()?.len();
            if count == 0 {
                println!("no parked failures to clear");
                return Ok(());
            }
            if !args.yes
                && !confirm(&format!("This will remove {count} parked failure(s)."))?
            {
                println!("clear cancelled");
                return Ok(());
            }
            let cleared = dispatcher.clear_failures()?;
            println!("cleared {cleared} parked failure(s)");
        }
    }
    Ok(())
}
