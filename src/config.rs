//! TOML configuration.
//!
//! All settings live in a single file (default `./config/mmsync.toml`).
//! Every section except `[upstream]` and `[sink]` has usable defaults, so a
//! minimal file only needs the two base URLs.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync_state::MAX_FETCH_INTERVAL_SECS;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    pub upstream: UpstreamConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/mmsync.sqlite"),
        }
    }
}

/// Connection settings for the Mattermost REST API.
#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// API root, e.g. `http://localhost:8065/api/v4`.
    pub base_url: String,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_token_env() -> String {
    "MM_ACCESS_TOKEN".to_string()
}
fn default_upstream_timeout() -> u64 {
    10
}
fn default_page_size() -> u32 {
    200
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Connection settings for the Chroma vector store.
#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    pub base_url: String,
    #[serde(default = "default_sink_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_embedding_dims")]
    pub embedding_dims: usize,
}

fn default_sink_timeout() -> u64 {
    120
}
fn default_embedding_dims() -> usize {
    256
}

impl SinkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Interval written to the checkpoint store the first time it is
    /// initialised. Later changes go through `mmsync interval`.
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_interval_secs: default_fetch_interval(),
        }
    }
}

fn default_fetch_interval() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    /// Per-subscriber queue capacity. A subscriber whose queue is full is
    /// disconnected.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

fn default_subscriber_buffer() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7340".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.upstream.base_url.trim().is_empty() {
        anyhow::bail!("upstream.base_url must not be empty");
    }
    if config.upstream.timeout_secs == 0 {
        anyhow::bail!("upstream.timeout_secs must be > 0");
    }
    if config.upstream.page_size == 0 {
        anyhow::bail!("upstream.page_size must be > 0");
    }

    if config.sink.base_url.trim().is_empty() {
        anyhow::bail!("sink.base_url must not be empty");
    }
    if config.sink.timeout_secs == 0 {
        anyhow::bail!("sink.timeout_secs must be > 0");
    }
    if config.sink.embedding_dims == 0 {
        anyhow::bail!("sink.embedding_dims must be > 0");
    }

    if config.sync.fetch_interval_secs == 0
        || config.sync.fetch_interval_secs > MAX_FETCH_INTERVAL_SECS
    {
        anyhow::bail!(
            "sync.fetch_interval_secs must be between 1 and {}",
            MAX_FETCH_INTERVAL_SECS
        );
    }
    if config.broker.subscriber_buffer == 0 {
        anyhow::bail!("broker.subscriber_buffer must be > 0");
    }

    Ok(config)
}
