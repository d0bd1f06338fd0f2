use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Args, Subcommand};

use streamcqrs::{
    config::load_or_default,
    queue::{DeltaQueue, MessageId, QueueMessage},
};

use crate::commands::confirm;

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Show message counts and details by state
    Status,
    /// Return dead messages to the queue, optionally a single one
    Retry(RetryArgs),
    /// Remove all dead messages
    Clear(ClearArgs),
}

#[derive(Args)]
pub struct RetryArgs {
    /// Retry only the dead message with this id
    #[arg(long)]
    pub id: Option<MessageId>,
}

#[derive(Args)]
pub struct ClearArgs {
    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

pub fn execute(config_path: Option<PathBuf>, command: QueueCommands) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let queue = DeltaQueue::open(&config.queue_store_path(), &config.queue)
        .with_context(|| format!("failed to open queue '{}'", config.queue.name))?;

    match command {
        QueueCommands::Status => print_status(&queue)?,
        QueueCommands::Retry(args) => {
            let status = queue.status()?;
            let targets: Vec<QueueMessage> = status
                .dead
                .into_iter()
                .filter(|message| args.id.is_none_or(|id| message.id == id))
                .collect();

            if targets.is_empty() {
                if args.id.is_some() {
                    println!("no dead messages match the provided id");
                } else {
                    println!("no dead messages to retry");
                }
                return Ok(());
            }

            for message in &targets {
                queue.retry_dead(&message.id)?;
            }
            println!(
                "returned {} dead message(s) to queue '{}'",
                targets.len(),
                queue.name()
            );
        }
        QueueCommands::Clear(args) => {
            let dead = queue.status()?.dead.len();
            if dead == 0 {
                println!("no dead messages to clear");
                return Ok(());
            }
            if !args.yes && !confirm(&format!("This will remove {dead} dead message(s)."))? {
                println!("clear cancelled");
                return Ok(());
            }
            let cleared = queue.clear_dead()?;
            println!("cleared {cleared} dead message(s) from queue '{}'", queue.name());
        }
    }
    Ok(())
}

fn print_status(queue: &DeltaQueue) -> Result<()> {
    let status = queue.status()?;
    println!(
        "queue={} pending={} in_flight={} dead={}",
        queue.name(),
        status.pending.len(),
        status.in_flight.len(),
        status.dead.len()
    );

    for (label, messages) in [
        ("Pending", &status.pending),
        ("In flight", &status.in_flight),
        ("Dead", &status.dead),
    ] {
        if messages.is_empty() {
            continue;
        }
        println!("\n{label} messages:");
        for message in messages {
            print_message(message);
        }
    }
    Ok(())
}

fn print_message(message: &QueueMessage) {
    let visible_at = Utc
        .timestamp_millis_opt(message.visible_at)
        .single()
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| "-".into());
    println!(
        "  id={} token={} receives={} visible_at={} last_error={}",
        message.id,
        message.body.token,
        message.receive_count,
        visible_at,
        message.last_error.as_deref().unwrap_or("-")
    );
}
