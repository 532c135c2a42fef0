//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Secrets and endpoints may be overridden from the environment
//! (`FEED_ACCESS_TOKEN`, `FEED_DISCOVERY_URL`, `SINK_API_KEY`,
//! `SINK_INGESTION_URL`, `PORT`) so they don't have to live in the file.

use crate::domain::calibration::{CalibrationError, CalibrationTable};
use crate::domain::types::BLE_DEVICES;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ENV_FEED_ACCESS_TOKEN: &str = "FEED_ACCESS_TOKEN";
pub const ENV_FEED_DISCOVERY_URL: &str = "FEED_DISCOVERY_URL";
pub const ENV_SINK_API_KEY: &str = "SINK_API_KEY";
pub const ENV_SINK_INGESTION_URL: &str = "SINK_INGESTION_URL";
pub const ENV_PORT: &str = "PORT";

pub const DEFAULT_SINK_URL: &str = "https://api.traxmate.io/v1/data/ingest";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("required configuration value {0} is missing")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedSection {
    #[serde(default)]
    pub discovery_url: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_event_type")]
    pub event_type: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_event_type() -> String {
    BLE_DEVICES.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            discovery_url: None,
            access_token: None,
            event_type: default_event_type(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_reconnect_attempts(),
            base_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkSection {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_sink_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Pause after each request in a batch send
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,
}

fn default_sink_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_batch_pause_ms() -> u64 {
    100
}

impl Default for SinkSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_ms: default_sink_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            batch_pause_ms: default_batch_pause_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Events processed concurrently; further events wait in the channel
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn config_path_or_default(from_env: Option<String>) -> String {
    from_env.filter(|path| !path.trim().is_empty()).unwrap_or_else(|| "config/dev.toml".to_string())
}

fn default_max_in_flight() -> usize {
    32
}

fn default_channel_capacity() -> usize {
    1000
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    /// Status server port (0 to disable)
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_port() -> u16 {
    8080
}

impl Default for HttpSection {
    fn default() -> Self {
        Self { port: default_http_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSection {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

fn default_metrics_interval() -> u64 {
    60
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
}

/// Initial calibration entry (`[[floors]]`)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FloorEntry {
    pub location_hierarchy: String,
    pub origin_lat: f64,
    pub origin_lng: f64,
    #[serde(default)]
    pub scale_factor: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub feed: FeedSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub sink: SinkSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub metrics: MetricsSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default = "default_floors")]
    pub floors: Vec<FloorEntry>,
}

fn default_floors() -> Vec<FloorEntry> {
    vec![FloorEntry {
        location_hierarchy: "USA>Texas>Austin>Building1>Floor2".to_string(),
        origin_lat: 30.2672,
        origin_lng: -97.7431,
        scale_factor: Some(0.00001),
    }]
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            feed: FeedSection::default(),
            reconnect: ReconnectSection::default(),
            sink: SinkSection::default(),
            pipeline: PipelineSection::default(),
            http: HttpSection::default(),
            metrics: MetricsSection::default(),
            logging: LoggingSection::default(),
            floors: default_floors(),
        }
    }
}

/// Credentials required before the bridge can start
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub feed_access_token: String,
    pub feed_discovery_url: String,
    pub sink_api_key: String,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    feed_discovery_url: Option<String>,
    feed_access_token: Option<String>,
    feed_event_type: String,
    feed_connect_timeout_ms: u64,
    reconnect_max_attempts: u32,
    reconnect_base_delay_ms: u64,
    sink_base_url: String,
    sink_api_key: Option<String>,
    sink_timeout_ms: u64,
    sink_max_retries: u32,
    sink_retry_delay_ms: u64,
    sink_batch_pause_ms: u64,
    channel_capacity: usize,
    max_in_flight: usize,
    http_port: u16,
    metrics_interval_secs: u64,
    log_format: LogFormat,
    floors: Vec<FloorEntry>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

/// Empty strings count as absent
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        Self {
            feed_discovery_url: non_empty(toml_config.feed.discovery_url),
            feed_access_token: non_empty(toml_config.feed.access_token),
            feed_event_type: toml_config.feed.event_type,
            feed_connect_timeout_ms: toml_config.feed.connect_timeout_ms,
            reconnect_max_attempts: toml_config.reconnect.max_attempts,
            reconnect_base_delay_ms: toml_config.reconnect.base_delay_ms,
            sink_base_url: non_empty(toml_config.sink.base_url)
                .unwrap_or_else(|| DEFAULT_SINK_URL.to_string()),
            sink_api_key: non_empty(toml_config.sink.api_key),
            sink_timeout_ms: toml_config.sink.timeout_ms,
            sink_max_retries: toml_config.sink.max_retries,
            sink_retry_delay_ms: toml_config.sink.retry_delay_ms,
            sink_batch_pause_ms: toml_config.sink.batch_pause_ms,
            channel_capacity: toml_config.pipeline.channel_capacity.max(1),
            max_in_flight: toml_config.pipeline.max_in_flight.max(1),
            http_port: toml_config.http.port,
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            log_format: toml_config.logging.format,
            floors: toml_config.floors,
            config_file: config_file.to_string(),
        }
    }

    /// Config path when `--config` is not given: `CONFIG_FILE`, then `config/dev.toml`
    pub fn resolve_config_path() -> String {
        config_path_or_default(env::var("CONFIG_FILE").ok())
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, &path.display().to_string()))
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Apply environment overrides from the process environment
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup (tests pass a map)
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| non_empty(lookup(name));

        if let Some(token) = get(ENV_FEED_ACCESS_TOKEN) {
            self.feed_access_token = Some(token);
        }
        if let Some(url) = get(ENV_FEED_DISCOVERY_URL) {
            self.feed_discovery_url = Some(url);
        }
        if let Some(key) = get(ENV_SINK_API_KEY) {
            self.sink_api_key = Some(key);
        }
        if let Some(url) = get(ENV_SINK_INGESTION_URL) {
            self.sink_base_url = url;
        }
        if let Some(port) = get(ENV_PORT).and_then(|p| p.parse().ok()) {
            self.http_port = port;
        }
        self
    }

    /// Collect the values the bridge cannot start without
    pub fn require_credentials(&self) -> Result<Credentials, ConfigError> {
        let feed_access_token =
            self.feed_access_token.clone().ok_or(ConfigError::Missing(ENV_FEED_ACCESS_TOKEN))?;
        let feed_discovery_url =
            self.feed_discovery_url.clone().ok_or(ConfigError::Missing(ENV_FEED_DISCOVERY_URL))?;
        let sink_api_key = self.sink_api_key.clone().ok_or(ConfigError::Missing(ENV_SINK_API_KEY))?;
        Ok(Credentials { feed_access_token, feed_discovery_url, sink_api_key })
    }

    /// Build the calibration table from the configured floors
    pub fn calibration_table(&self) -> Result<CalibrationTable, CalibrationError> {
        let table = CalibrationTable::new();
        for floor in &self.floors {
            table.add(&floor.location_hierarchy, floor.origin_lat, floor.origin_lng, floor.scale_factor)?;
        }
        Ok(table)
    }

    pub fn feed_discovery_url(&self) -> Option<&str> {
        self.feed_discovery_url.as_deref()
    }

    pub fn feed_access_token(&self) -> Option<&str> {
        self.feed_access_token.as_deref()
    }

    pub fn feed_event_type(&self) -> &str {
        &self.feed_event_type
    }

    pub fn feed_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.feed_connect_timeout_ms)
    }

    pub fn reconnect_max_attempts(&self) -> u32 {
        self.reconnect_max_attempts
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn sink_base_url(&self) -> &str {
        &self.sink_base_url
    }

    pub fn sink_api_key(&self) -> Option<&str> {
        self.sink_api_key.as_deref()
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }

    pub fn sink_max_retries(&self) -> u32 {
        self.sink_max_retries
    }

    pub fn sink_retry_delay(&self) -> Duration {
        Duration::from_millis(self.sink_retry_delay_ms)
    }

    pub fn sink_batch_pause(&self) -> Duration {
        Duration::from_millis(self.sink_batch_pause_ms)
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    pub fn floors(&self) -> &[FloorEntry] {
        &self.floors
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.feed_event_type(), "BLE_DEVICES");
        assert_eq!(config.reconnect_max_attempts(), 10);
        assert_eq!(config.reconnect_base_delay(), Duration::from_secs(5));
        assert_eq!(config.sink_base_url(), DEFAULT_SINK_URL);
        assert_eq!(config.sink_max_retries(), 3);
        assert_eq!(config.sink_retry_delay(), Duration::from_secs(1));
        assert_eq!(config.sink_timeout(), Duration::from_secs(10));
        assert_eq!(config.sink_batch_pause(), Duration::from_millis(100));
        assert_eq!(config.http_port(), 8080);
        assert_eq!(config.channel_capacity(), 1000);
        assert_eq!(config.max_in_flight(), 32);
        assert_eq!(config.log_format(), LogFormat::Text);
        assert_eq!(config.floors().len(), 1);
        assert!(config.feed_access_token().is_none());
    }

    #[test]
    fn test_default_floors_build_table() {
        let table = Config::default().calibration_table().unwrap();
        let cal = table.lookup("USA>Texas>Austin>Building1>Floor2").unwrap();
        assert_eq!(cal.origin_lat, 30.2672);
    }

    #[test]
    fn test_require_credentials_reports_first_missing() {
        let config = Config::default();
        assert_eq!(config.require_credentials(), Err(ConfigError::Missing(ENV_FEED_ACCESS_TOKEN)));

        let vars = env_map(&[(ENV_FEED_ACCESS_TOKEN, "tok"), (ENV_FEED_DISCOVERY_URL, "")]);
        let config = Config::default().with_overrides(|k| vars.get(k).cloned());
        assert_eq!(config.require_credentials(), Err(ConfigError::Missing(ENV_FEED_DISCOVERY_URL)));

        let vars = env_map(&[(ENV_FEED_ACCESS_TOKEN, "tok"), (ENV_FEED_DISCOVERY_URL, "https://x")]);
        let config = Config::default().with_overrides(|k| vars.get(k).cloned());
        assert_eq!(config.require_credentials(), Err(ConfigError::Missing(ENV_SINK_API_KEY)));
    }

    #[test]
    fn test_env_overrides() {
        let vars = env_map(&[
            (ENV_FEED_ACCESS_TOKEN, "tok"),
            (ENV_FEED_DISCOVERY_URL, "https://feed/discover"),
            (ENV_SINK_API_KEY, "key"),
            (ENV_SINK_INGESTION_URL, "http://localhost:9000/ingest"),
            (ENV_PORT, "9999"),
        ]);
        let config = Config::default().with_overrides(|k| vars.get(k).cloned());

        let creds = config.require_credentials().unwrap();
        assert_eq!(creds.feed_access_token, "tok");
        assert_eq!(creds.feed_discovery_url, "https://feed/discover");
        assert_eq!(creds.sink_api_key, "key");
        assert_eq!(config.sink_base_url(), "http://localhost:9000/ingest");
        assert_eq!(config.http_port(), 9999);
    }

    #[test]
    fn test_invalid_port_override_is_ignored() {
        let vars = env_map(&[(ENV_PORT, "not-a-port")]);
        let config = Config::default().with_overrides(|k| vars.get(k).cloned());
        assert_eq!(config.http_port(), 8080);
    }

    #[test]
    fn test_config_path_env_or_default() {
        assert_eq!(config_path_or_default(Some("/etc/bridge.toml".to_string())), "/etc/bridge.toml");
        assert_eq!(config_path_or_default(Some("  ".to_string())), "config/dev.toml");
        assert_eq!(config_path_or_default(None), "config/dev.toml");
    }
}
