use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub const DEFAULT_SHARD_COUNT: u16 = 4;
pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 10;

/// How aggregator output reaches the summary writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPattern {
    #[default]
    Direct,
    Queued,
}

impl DeliveryPattern {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryPattern::Direct => "direct",
            DeliveryPattern::Queued => "queued",
        }
    }
}

impl fmt::Display for DeliveryPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryPattern {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "queued" | "queue" => Ok(Self::Queued),
            other => Err(PipelineError::Config(format!(
                "unknown delivery pattern '{other}'"
            ))),
        }
    }
}

/// Where a dispatcher without a checkpoint starts reading a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartingPosition {
    #[default]
    TrimHorizon,
    Latest,
}

impl FromStr for StartingPosition {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "trim_horizon" | "earliest" => Ok(Self::TrimHorizon),
            "latest" => Ok(Self::Latest),
            other => Err(PipelineError::Config(format!(
                "unknown starting position '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default)]
    pub starting_position: StartingPosition,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_consumer_name")]
    pub consumer: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            retry_attempts: default_retry_attempts(),
            starting_position: StartingPosition::default(),
            poll_interval_ms: default_poll_interval_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            consumer: default_consumer_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,
    #[serde(default)]
    pub delivery_delay_ms: u64,
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    #[serde(default = "default_queue_workers")]
    pub workers: usize,
    #[serde(default = "default_receive_wait_ms")]
    pub receive_wait_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            visibility_timeout_ms: default_visibility_timeout_ms(),
            delivery_delay_ms: 0,
            max_receive_count: default_max_receive_count(),
            workers: default_queue_workers(),
            receive_wait_ms: default_receive_wait_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    #[serde(default = "default_writer_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_writer_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    #[serde(default = "default_details_table")]
    pub details_table: String,
    #[serde(default = "default_summary_table")]
    pub summary_table: String,
    #[serde(default)]
    pub pattern: DeliveryPattern,
    #[serde(default = "default_shard_count")]
    pub shard_count: u16,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Config {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            data_dir: default_data_dir(),
            details_table: default_details_table(),
            summary_table: default_summary_table(),
            pattern: DeliveryPattern::default(),
            shard_count: default_shard_count(),
            dispatcher: DispatcherConfig::default(),
            queue: QueueConfig::default(),
            writer: WriterConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub data_dir: Option<PathBuf>,
    pub pattern: Option<DeliveryPattern>,
    pub shard_count: Option<u16>,
    pub batch_size: Option<usize>,
    pub retry_attempts: Option<u32>,
    pub starting_position: Option<StartingPosition>,
    pub poll_interval_ms: Option<u64>,
    pub visibility_timeout_ms: Option<u64>,
    pub delivery_delay_ms: Option<u64>,
    pub max_receive_count: Option<u32>,
    pub queue_workers: Option<usize>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.data_dir.is_none()
            && self.pattern.is_none()
            && self.shard_count.is_none()
            && self.batch_size.is_none()
            && self.retry_attempts.is_none()
            && self.starting_position.is_none()
            && self.poll_interval_ms.is_none()
            && self.visibility_timeout_ms.is_none()
            && self.delivery_delay_ms.is_none()
            && self.max_receive_count.is_none()
            && self.queue_workers.is_none()
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = default_config_root()?;
    path.push("config.toml");
    Ok(path)
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = if let Some(path) = path {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        path
    } else {
        default_config_path()?
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let cfg: Config = toml::from_str(&contents)?;
        cfg.validate()?;
        cfg.ensure_data_dir()?;
        Ok((cfg, config_path))
    } else {
        // A fresh config keeps its data next to itself.
        let cfg = match config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => Config::with_data_dir(parent),
            _ => Config::default(),
        };
        cfg.ensure_data_dir()?;
        cfg.save(&config_path)?;
        Ok((cfg, config_path))
    }
}

impl Config {
    /// Configuration rooted at `data_dir`, used by tests and embedders that
    /// skip the config file entirely.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(PipelineError::Config("shard_count must be at least 1".into()));
        }
        if self.dispatcher.batch_size == 0 {
            return Err(PipelineError::Config(
                "dispatcher.batch_size must be at least 1".into(),
            ));
        }
        if self.details_table.trim().is_empty() || self.summary_table.trim().is_empty() {
            return Err(PipelineError::Config("table names cannot be empty".into()));
        }
        if self.details_table == self.summary_table {
            return Err(PipelineError::Config(
                "details_table and summary_table must differ".into(),
            ));
        }
        if self.queue.name.trim().is_empty() {
            return Err(PipelineError::Config("queue.name cannot be empty".into()));
        }
        for (key, value) in [
            ("details_table", &self.details_table),
            ("summary_table", &self.summary_table),
            ("queue.name", &self.queue.name),
        ] {
            check_store_name(key, value)?;
        }
        Ok(())
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(dir) = update.data_dir {
            self.data_dir = dir;
        }
        if let Some(pattern) = update.pattern {
            self.pattern = pattern;
        }
        if let Some(shards) = update.shard_count {
            self.shard_count = shards.max(1);
        }
        if let Some(batch_size) = update.batch_size {
            self.dispatcher.batch_size = batch_size.max(1);
        }
        if let Some(attempts) = update.retry_attempts {
            self.dispatcher.retry_attempts = attempts;
        }
        if let Some(position) = update.starting_position {
            self.dispatcher.starting_position = position;
        }
        if let Some(interval) = update.poll_interval_ms {
            self.dispatcher.poll_interval_ms = interval;
        }
        if let Some(timeout) = update.visibility_timeout_ms {
            self.queue.visibility_timeout_ms = timeout;
        }
        if let Some(delay) = update.delivery_delay_ms {
            self.queue.delivery_delay_ms = delay;
        }
        if let Some(count) = update.max_receive_count {
            self.queue.max_receive_count = count.max(1);
        }
        if let Some(workers) = update.queue_workers {
            self.queue.workers = workers.max(1);
        }
        self.updated_at = Utc::now();
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn details_store_path(&self) -> PathBuf {
        self.data_dir.join(&self.details_table)
    }

    pub fn summary_store_path(&self) -> PathBuf {
        self.data_dir.join(&self.summary_table)
    }

    pub fn queue_store_path(&self) -> PathBuf {
        self.data_dir.join("queues").join(&self.queue.name)
    }

    pub fn dispatcher_state_path(&self) -> PathBuf {
        self.data_dir.join("dispatcher")
    }
}

/// Store names become directories under `data_dir` and must stay inside it.
fn check_store_name(key: &str, value: &str) -> Result<()> {
    let escapes = value == "."
        || value == ".."
        || value.contains(['/', '\\'])
        || value.chars().any(char::is_control)
        || Path::new(value).is_absolute();
    if escapes {
        return Err(PipelineError::Config(format!(
            "{key} '{value}' must be a plain directory name"
        )));
    }
    Ok(())
}

fn default_config_root() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        Ok(home.join(".streamcqrs"))
    } else {
        Err(PipelineError::Config(
            "unable to resolve home directory for configuration".into(),
        ))
    }
}

fn default_data_dir() -> PathBuf {
    default_config_root().unwrap_or_else(|_| PathBuf::from(".streamcqrs"))
}

fn default_details_table() -> String {
    "order_details".to_string()
}

fn default_summary_table() -> String {
    "order_summary".to_string()
}

fn default_shard_count() -> u16 {
    DEFAULT_SHARD_COUNT
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_backoff_base_ms() -> u64 {
    50
}

fn default_consumer_name() -> String {
    "summary-aggregator".to_string()
}

fn default_queue_name() -> String {
    "summary_deltas".to_string()
}

fn default_visibility_timeout_ms() -> u64 {
    30_000
}

fn default_max_receive_count() -> u32 {
    10
}

fn default_queue_workers() -> usize {
    2
}

fn default_receive_wait_ms() -> u64 {
    1_000
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_writer_max_attempts() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let config = Config::default();
        assert_eq!(config.dispatcher.batch_size, 5);
        assert_eq!(config.dispatcher.retry_attempts, 10);
        assert_eq!(
            config.dispatcher.starting_position,
            StartingPosition::TrimHorizon
        );
        assert_eq!(config.pattern, DeliveryPattern::Direct);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_or_default_writes_and_reloads() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("conf").join("config.toml");

        fs::create_dir_all(path.parent().unwrap())?;
        let mut config = Config::with_data_dir(tmp.path().join("data"));
        config.save(&path)?;
        let (loaded, written) = load_or_default(Some(path.clone()))?;
        assert_eq!(written, path);
        assert_eq!(loaded.pattern, DeliveryPattern::Direct);

        config.apply_update(ConfigUpdate {
            pattern: Some(DeliveryPattern::Queued),
            batch_size: Some(0),
            ..ConfigUpdate::default()
        });
        config.save(&path)?;

        let (reloaded, _) = load_or_default(Some(path))?;
        assert_eq!(reloaded.pattern, DeliveryPattern::Queued);
        assert_eq!(reloaded.dispatcher.batch_size, 1);
        assert!(reloaded.data_dir.exists());
        Ok(())
    }

    #[test]
    fn fresh_config_keeps_data_next_to_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("deploy").join("config.toml");

        let (config, written) = load_or_default(Some(path.clone()))?;
        assert_eq!(written, path);
        assert_eq!(config.data_dir, tmp.path().join("deploy"));
        assert!(path.exists());
        assert_eq!(config.details_store_path(), tmp.path().join("deploy").join("order_details"));
        Ok(())
    }

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let raw = r#"
            data_dir = "/tmp/streamcqrs"
            pattern = "queued"
            created_at = "2025-01-01T00:00:00Z"
            updated_at = "2025-01-01T00:00:00Z"

            [dispatcher]
            batch_size = 3
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.pattern, DeliveryPattern::Queued);
        assert_eq!(config.dispatcher.batch_size, 3);
        assert_eq!(config.dispatcher.retry_attempts, 10);
        assert_eq!(config.queue.visibility_timeout_ms, 30_000);
        assert_eq!(config.summary_table, "order_summary");
    }

    #[test]
    fn rejects_colliding_tables() {
        let mut config = Config::default();
        config.summary_table = config.details_table.clone();
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn rejects_store_names_that_leave_data_dir() {
        for name in ["../x", "..", "a/b", "a\\b", "/etc"] {
            let mut config = Config::with_data_dir("/tmp/streamcqrs");
            config.details_table = name.to_string();
            assert!(
                matches!(config.validate(), Err(PipelineError::Config(_))),
                "details_table {name:?} accepted"
            );

            let mut config = Config::with_data_dir("/tmp/streamcqrs");
            config.queue.name = name.to_string();
            assert!(config.validate().is_err(), "queue.name {name:?} accepted");
        }
        assert!(Config::with_data_dir("/tmp/streamcqrs").validate().is_ok());
    }

    #[test]
    fn parses_enums_from_cli_strings() {
        assert_eq!(
            "queue".parse::<DeliveryPattern>().unwrap(),
            DeliveryPattern::Queued
        );
        assert_eq!(
            "trim-horizon".parse::<StartingPosition>().unwrap(),
            StartingPosition::TrimHorizon
        );
        assert!("sideways".parse::<StartingPosition>().is_err());
    }
}
