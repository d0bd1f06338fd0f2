use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

use streamcqrs::{Pipeline, config::load_or_default};

pub mod config;
pub mod failures;
pub mod order;
pub mod pipeline;
pub mod queue;

pub(crate) fn open_pipeline(config_path: Option<PathBuf>) -> Result<Pipeline> {
    let (config, path) = load_or_default(config_path)?;
    Pipeline::open(config)
        .with_context(|| format!("failed to open pipeline configured by {}", path.display()))
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn confirm(prompt: &str) -> Result<bool> {
    use std::io::Write;

    print!("{prompt} Type 'clear' to confirm: ");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin()
        .read_line(&mut input)
        .with_context(|| "failed to read confirmation input")?;
    Ok(input.trim().eq_ignore_ascii_case("clear"))
}
