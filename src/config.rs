use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pipeline::{PipelineOptions, RetryPolicy};
use crate::postgres::connection::{validate_slot_name, ConnectOptions};
use crate::postgres::StreamOptions;
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default = "default_sinks")]
    pub sinks: Vec<SinkConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Connection string; takes precedence over the discrete fields.
    #[serde(default)]
    pub url: Option<String>,
    pub publication: String,
    pub slot_name: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_max_transaction_events")]
    pub max_transaction_events: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    #[serde(default = "default_status_bytes")]
    pub status_bytes: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_directory")]
    pub directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkConfig {
    Stdout,
    File { path: PathBuf },
}

impl Config {
    /// Reads a TOML file, then applies `RAILGUN_` environment overrides
    /// (`RAILGUN_POSTGRES__PASSWORD`, `RAILGUN_PIPELINE__BUFFER_CAPACITY`, ...).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("RAILGUN")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        Self::finish(settings)
    }

    /// Parses TOML text without environment overrides.
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        Self::finish(settings)
    }

    fn finish(settings: config::Config) -> Result<Self> {
        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let pg = &self.postgres;
        validate_slot_name(&pg.slot_name)?;
        if pg.publication.is_empty() {
            return Err(Error::Config("postgres.publication must not be empty".to_string()));
        }
        if pg.url.is_none() && (pg.database.is_empty() || pg.username.is_empty()) {
            return Err(Error::Config(
                "postgres.database and postgres.username are required without postgres.url"
                    .to_string(),
            ));
        }
        if pg.connect_timeout_secs == 0 {
            return Err(Error::Config("postgres.connect_timeout_secs must be at least 1".to_string()));
        }

        if self.pipeline.buffer_capacity == 0 {
            return Err(Error::Config("pipeline.buffer_capacity must be at least 1".to_string()));
        }
        if self.pipeline.max_transaction_events == 0 {
            return Err(Error::Config(
                "pipeline.max_transaction_events must be at least 1".to_string(),
            ));
        }

        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(Error::Config("retry.multiplier must be a number >= 1".to_string()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::Config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".to_string(),
            ));
        }

        if self.replication.status_interval_secs == 0 {
            return Err(Error::Config(
                "replication.status_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.replication.status_bytes == 0 {
            return Err(Error::Config("replication.status_bytes must be at least 1".to_string()));
        }

        if self.sinks.is_empty() {
            return Err(Error::Config("at least one sink is required".to_string()));
        }
        Ok(())
    }

    pub fn connect_options(&self) -> Result<ConnectOptions> {
        let pg = &self.postgres;
        let connect_timeout = Duration::from_secs(pg.connect_timeout_secs);

        match &pg.url {
            Some(url) => {
                let mut options = ConnectOptions::from_url(url)?;
                options.connect_timeout = connect_timeout;
                Ok(options)
            }
            None => Ok(ConnectOptions {
                host: pg.host.clone(),
                port: pg.port,
                user: pg.username.clone(),
                password: pg.password.clone(),
                database: pg.database.clone(),
                connect_timeout,
            }),
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            buffer_capacity: self.pipeline.buffer_capacity,
            max_transaction_events: self.pipeline.max_transaction_events,
            retry: self.retry_policy(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            multiplier: self.retry.multiplier,
        }
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            status_interval: Duration::from_secs(self.replication.status_interval_secs),
            status_bytes: self.replication.status_bytes,
            ..StreamOptions::default()
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            max_transaction_events: default_max_transaction_events(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: default_status_interval_secs(),
            status_bytes: default_status_bytes(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: default_checkpoint_directory(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_buffer_capacity() -> usize {
    64
}

fn default_max_transaction_events() -> usize {
    100_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_status_interval_secs() -> u64 {
    10
}

fn default_status_bytes() -> u64 {
    16 * 1024 * 1024 // 16MB
}

fn default_checkpoint_directory() -> PathBuf {
    PathBuf::from("./checkpoints")
}

fn default_sinks() -> Vec<SinkConfig> {
    vec![SinkConfig::Stdout]
}
