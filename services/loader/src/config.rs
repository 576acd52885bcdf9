//! Configuration for the loader service.
//!
//! Values are layered: built-in defaults, then optional config files, then
//! environment variables prefixed with `LOADER` (e.g. `LOADER__WAREHOUSE__URL`).

use etl_pipeline::{ConfigError, KafkaConfig, RetryConfig, S3Config, TimeoutConfig};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the loader service
#[derive(Debug, Clone, Deserialize)]
pub struct LoaderConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub s3: S3Config,
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub format: CsvFormat,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Warehouse connection and table layout
#[derive(Debug, Clone, Deserialize)]
pub struct WarehouseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Schema holding the telemetry tables
    #[serde(default = "default_dataset")]
    pub dataset: String,
    /// Row table name; the manifest lives in `<table>_manifest`
    #[serde(default = "default_table")]
    pub table: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Create the schema and tables on startup if missing
    #[serde(default = "default_true")]
    pub ensure_schema: bool,
}

/// Layout of the delimited telemetry files
#[derive(Debug, Clone, Deserialize)]
pub struct CsvFormat {
    /// Single-byte field delimiter
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    /// Whether the first line is a header row
    #[serde(default = "default_true")]
    pub has_header: bool,
    /// chrono format string of the `recorded_at` column
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
}

fn default_service_name() -> String {
    "etl-loader".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_dataset() -> String {
    "telemetry".to_string()
}
fn default_table() -> String {
    "tractor_readings".to_string()
}
fn default_max_connections() -> u32 {
    5
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_delimiter() -> String {
    ";".to_string()
}
fn default_timestamp_format() -> String {
    "%b %d, %Y %I:%M:%S %p".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            has_header: true,
            timestamp_format: default_timestamp_format(),
        }
    }
}

impl CsvFormat {
    /// Delimiter as the byte the csv reader expects
    pub fn delimiter_byte(&self) -> Result<u8, ConfigError> {
        match self.delimiter.as_bytes() {
            [b] if b.is_ascii() => Ok(*b),
            _ => Err(ConfigError::InvalidValue {
                key: "format.delimiter".to_string(),
                message: format!("must be a single ASCII character, got '{}'", self.delimiter),
            }),
        }
    }
}

impl WarehouseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Name of the per-object load manifest table
    pub fn manifest_table(&self) -> String {
        format!("{}_manifest", self.table)
    }
}

/// Identifiers are interpolated into SQL, so only plain names are accepted
fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 48 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl LoaderConfig {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("kafka.bootstrap_servers", "localhost:9092")?
            .set_default("kafka.client_id", "etl-loader")?
            .set_default("kafka.consumer.group_id", "etl-loader")?
            .add_source(config::File::with_name("config/loader").required(false))
            .add_source(config::File::with_name("/etc/etl/loader").required(false))
            // LOADER__WAREHOUSE__URL -> warehouse.url
            .add_source(
                config::Environment::with_prefix("LOADER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kafka.validate()?;
        self.retry.validate()?;
        self.format.delimiter_byte()?;

        if self.warehouse.url.is_empty() {
            return Err(ConfigError::MissingRequired("warehouse.url".to_string()));
        }

        for (key, value) in [
            ("warehouse.dataset", &self.warehouse.dataset),
            ("warehouse.table", &self.warehouse.table),
        ] {
            if !is_plain_identifier(value) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("'{}' is not a plain SQL identifier", value),
                });
            }
        }

        if self.warehouse.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                key: "warehouse.max_connections".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.format.timestamp_format.is_empty() {
            return Err(ConfigError::MissingRequired("format.timestamp_format".to_string()));
        }

        Ok(())
    }
}
