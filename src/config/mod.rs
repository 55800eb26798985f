//! Layered configuration: built-in defaults, then `config.toml`, then
//! `GROUPGATE_*` environment overrides.

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "GROUPGATE_";

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AggregationConfig {
    /// Width of the time bucket folded into the group key.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// A group older than this (since its first item) finalizes on the next arrival.
    #[serde(default = "default_quick_threshold_seconds")]
    pub quick_threshold_seconds: u64,
    /// Idle time after the last append before the sweeper forces finalize.
    #[serde(default = "default_stale_threshold_seconds")]
    pub stale_threshold_seconds: u64,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    /// Channels whose media arrivals are grouped; everything else passes through.
    #[serde(default = "default_aggregate_channels")]
    pub aggregate_channels: Vec<String>,
    #[serde(default = "default_append_max_attempts")]
    pub append_max_attempts: u32,
    /// Minimum outbox age before the sweeper republishes an unacknowledged batch.
    #[serde(default = "default_outbox_retry_after_seconds")]
    pub outbox_retry_after_seconds: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            quick_threshold_seconds: default_quick_threshold_seconds(),
            stale_threshold_seconds: default_stale_threshold_seconds(),
            max_items: default_max_items(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            aggregate_channels: default_aggregate_channels(),
            append_max_attempts: default_append_max_attempts(),
            outbox_retry_after_seconds: default_outbox_retry_after_seconds(),
        }
    }
}

impl AggregationConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StoreConfig {
    /// SQLite database holding open groups and the pending-batch outbox.
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct IdempotencyConfig {
    #[serde(default = "default_idempotency_path")]
    pub path: String,
    /// A `processing` claim older than this is treated as abandoned.
    #[serde(default = "default_claim_timeout_seconds")]
    pub claim_timeout_seconds: u64,
    /// Completed records older than this are purged.
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            path: default_idempotency_path(),
            claim_timeout_seconds: default_claim_timeout_seconds(),
            retention_seconds: default_retention_seconds(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PublisherKind {
    /// In-process bounded queue drained by the built-in consumer.
    #[default]
    Channel,
    /// JSON POST to an external queue endpoint.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PublisherConfig {
    #[serde(default)]
    pub kind: PublisherKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_publisher_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_publisher_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            kind: PublisherKind::default(),
            url: None,
            timeout_secs: default_publisher_timeout_secs(),
            max_attempts: default_publisher_max_attempts(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

fn default_window_seconds() -> u64 {
    5
}
fn default_quick_threshold_seconds() -> u64 {
    3
}
fn default_stale_threshold_seconds() -> u64 {
    5
}
fn default_max_items() -> usize {
    3
}
fn default_sweep_interval_seconds() -> u64 {
    10
}
fn default_aggregate_channels() -> Vec<String> {
    vec!["whatsapp".into()]
}
fn default_append_max_attempts() -> u32 {
    5
}
fn default_outbox_retry_after_seconds() -> u64 {
    30
}
fn default_store_path() -> String {
    data_dir_file("groups.db")
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_retry_max_attempts() -> u32 {
    4
}
fn default_retry_base_delay_ms() -> u64 {
    50
}
fn default_retry_max_delay_ms() -> u64 {
    2_000
}
fn default_idempotency_path() -> String {
    data_dir_file("idempotency.db")
}
fn default_claim_timeout_seconds() -> u64 {
    300
}
fn default_retention_seconds() -> u64 {
    7 * 24 * 60 * 60
}
fn default_publisher_timeout_secs() -> u64 {
    10
}
fn default_publisher_max_attempts() -> u32 {
    3
}
fn default_queue_capacity() -> usize {
    1_024
}
fn default_gateway_host() -> String {
    "127.0.0.1".into()
}
fn default_gateway_port() -> u16 {
    8787
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "groupgate")
}

fn data_dir_file(name: &str) -> String {
    project_dirs()
        .map(|dirs| dirs.data_dir().join(name).to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("./{name}"))
}

/// Default `config.toml` location in the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Expand `~` and `$VAR` in a configured path.
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::full(raw).map_or_else(|_| raw.to_string(), |v| v.into_owned()))
}

impl Config {
    /// Load with explicit path (must exist) or the default location (optional).
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `GROUPGATE_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("Invalid {ENV_PREFIX}{name}={value}: {e}"))
        }

        let agg = &mut self.aggregation;
        if let Some(v) = get("WINDOW_SECONDS") {
            agg.window_seconds = parse("WINDOW_SECONDS", &v)?;
        }
        if let Some(v) = get("QUICK_THRESHOLD_SECONDS") {
            agg.quick_threshold_seconds = parse("QUICK_THRESHOLD_SECONDS", &v)?;
        }
        if let Some(v) = get("STALE_THRESHOLD_SECONDS") {
            agg.stale_threshold_seconds = parse("STALE_THRESHOLD_SECONDS", &v)?;
        }
        if let Some(v) = get("MAX_ITEMS") {
            agg.max_items = parse("MAX_ITEMS", &v)?;
        }
        if let Some(v) = get("SWEEP_INTERVAL_SECONDS") {
            agg.sweep_interval_seconds = parse("SWEEP_INTERVAL_SECONDS", &v)?;
        }
        if let Some(v) = get("STORE_PATH") {
            self.store.path = v;
        }
        if let Some(v) = get("IDEMPOTENCY_PATH") {
            self.idempotency.path = v;
        }
        if let Some(v) = get("PUBLISHER_URL") {
            self.publisher.url = Some(v);
            self.publisher.kind = PublisherKind::Http;
        }
        if let Some(v) = get("GATEWAY_HOST") {
            self.gateway.host = v;
        }
        if let Some(v) = get("GATEWAY_PORT") {
            self.gateway.port = parse("GATEWAY_PORT", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let agg = &self.aggregation;
        if agg.window_seconds == 0 {
            anyhow::bail!("aggregation.window_seconds must be greater than zero");
        }
        if agg.max_items == 0 {
            anyhow::bail!("aggregation.max_items must be greater than zero");
        }
        if agg.append_max_attempts == 0 {
            anyhow::bail!("aggregation.append_max_attempts must be greater than zero");
        }
        if self.publisher.kind == PublisherKind::Http
            && self.publisher.url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            anyhow::bail!("publisher.url is required when publisher.kind = \"http\"");
        }
        Ok(())
    }

    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(Config)).unwrap_or_default()
    }
}
