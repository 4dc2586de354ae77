use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    time::Duration,
};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("mqtt.topics must map at least one topic to a location")]
    NoTopics,
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error("anomaly endpoint configured for unknown location '{0}'")]
    UnknownAnomalyLocation(String),
    #[error("{field} must be at most {max} in magnitude")]
    OutOfRange { field: &'static str, max: i64 },
}

/// Longest trailing window an aggregation tick may read.
pub const MAX_WINDOW_SECS: u64 = 31 * 86_400;
/// Largest shift between the meters' reading clock and UTC.
pub const MAX_READING_CLOCK_OFFSET_SECS: i64 = 86_400;

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Transport topic -> location id.
    pub topics: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub kind: StoreKind,
    pub uri: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl StorageConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    /// Offset of each tick into its period (300 = five past the hour).
    #[serde(default = "default_offset_secs")]
    pub offset_secs: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Shift applied to the query window when meters stamp readings on a
    /// local wall clock rather than UTC.
    #[serde(default)]
    pub reading_clock_offset_secs: i64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            period_secs: default_period_secs(),
            offset_secs: default_offset_secs(),
            window_secs: default_window_secs(),
            reading_clock_offset_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_display_offset_secs")]
    pub display_utc_offset_secs: i32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_api_bind_addr(),
            display_utc_offset_secs: default_display_offset_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnomalyConfig {
    /// Location id -> prediction endpoint URL.
    pub endpoints: BTreeMap<String, String>,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_features_len")]
    pub features_len: usize,
    #[serde(default)]
    pub notify_on_anomaly: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub endpoint: String,
    pub bearer_token: Option<String>,
    #[serde(default = "default_token_max_age_days")]
    pub token_max_age_days: i64,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub anomaly: Option<AnomalyConfig>,
    pub notifications: Option<NotificationConfig>,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("ENERGY_CONFIG").unwrap_or_else(|_| "energy-config.toml".to_string());
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config {path}: {e}"))?;
        Ok(Self::from_toml_str(&contents)?)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }
        if self.ingest.workers == 0 {
            return Err(ConfigError::NotPositive("ingest.workers"));
        }
        if self.aggregation.period_secs == 0 {
            return Err(ConfigError::NotPositive("aggregation.period_secs"));
        }
        if self.aggregation.window_secs == 0 {
            return Err(ConfigError::NotPositive("aggregation.window_secs"));
        }
        if self.aggregation.window_secs > MAX_WINDOW_SECS {
            return Err(ConfigError::OutOfRange {
                field: "aggregation.window_secs",
                max: MAX_WINDOW_SECS as i64,
            });
        }
        if self.aggregation.reading_clock_offset_secs.unsigned_abs()
            > MAX_READING_CLOCK_OFFSET_SECS.unsigned_abs()
        {
            return Err(ConfigError::OutOfRange {
                field: "aggregation.reading_clock_offset_secs",
                max: MAX_READING_CLOCK_OFFSET_SECS,
            });
        }
        if let Some(anomaly) = &self.anomaly {
            let locations = self.locations();
            if let Some(unknown) = anomaly.endpoints.keys().find(|l| !locations.contains(*l)) {
                return Err(ConfigError::UnknownAnomalyLocation(unknown.clone()));
            }
        }
        Ok(())
    }

    /// The fixed set of tracked locations.
    pub fn locations(&self) -> BTreeSet<String> {
        self.mqtt.topics.values().cloned().collect()
    }
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_max_connections() -> u32 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_period_secs() -> u64 {
    3600
}

fn default_offset_secs() -> u64 {
    300
}

fn default_window_secs() -> u64 {
    3600
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_display_offset_secs() -> i32 {
    7 * 3600
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

fn default_features_len() -> usize {
    24
}

fn default_token_max_age_days() -> i64 {
    270
}
