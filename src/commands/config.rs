use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};

use streamcqrs::config::{ConfigUpdate, DeliveryPattern, StartingPosition, load_or_default};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Update configuration values
    Set(ConfigSetArgs),
}

#[derive(Args)]
pub struct ConfigSetArgs {
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// `direct` or `queued`
    #[arg(long)]
    pub pattern: Option<DeliveryPattern>,

    #[arg(long)]
    pub shard_count: Option<u16>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub retry_attempts: Option<u32>,

    /// `trim_horizon` or `latest`
    #[arg(long)]
    pub starting_position: Option<StartingPosition>,

    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    #[arg(long)]
    pub visibility_timeout_ms: Option<u64>,

    #[arg(long)]
    pub delivery_delay_ms: Option<u64>,

    #[arg(long)]
    pub max_receive_count: Option<u32>,

    #[arg(long)]
    pub queue_workers: Option<usize>,
}

pub fn execute(config_path: Option<PathBuf>, command: ConfigCommands) -> Result<()> {
    let (mut config, path) = load_or_default(config_path)?;

    match command {
        ConfigCommands::Show => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommands::Set(args) => {
            let ConfigSetArgs {
                data_dir,
                pattern,
                shard_count,
                batch_size,
                retry_attempts,
                starting_position,
                poll_interval_ms,
                visibility_timeout_ms,
                delivery_delay_ms,
                max_receive_count,
                queue_workers,
            } = args;

            let update = ConfigUpdate {
                data_dir,
                pattern,
                shard_count,
                batch_size,
                retry_attempts,
                starting_position,
                poll_interval_ms,
                visibility_timeout_ms,
                delivery_delay_ms,
                max_receive_count,
                queue_workers,
            };
            if update.is_empty() {
                println!("nothing to update");
                return Ok(());
            }

            config.apply_update(update);
            config.validate()?;
            config.ensure_data_dir()?;
            config.save(&path)?;
            tracing::info!("Configuration saved to {}", path.display());
        }
    }
    Ok(())
}
