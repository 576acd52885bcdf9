use etl_pipeline::{ConfigError, KafkaConfig, Outcome, RetryConfig, S3Config, TimeoutConfig};
use serde::Deserialize;

/// Main configuration for one router deployment
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Kafka configuration
    #[serde(default)]
    pub kafka: KafkaConfig,
    /// S3 configuration
    #[serde(default)]
    pub s3: S3Config,
    /// The move this deployment performs
    pub route: RouteConfig,
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
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Source and destination bucket of the move, bound once per deployment
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    /// Bucket objects are moved out of (the ingestion location)
    pub source: String,
    /// Bucket objects are moved into (the success or error location)
    pub destination: String,
    /// Outcome channel this router serves
    pub outcome: Outcome,
    /// Topic override; defaults to the outcome channel's topic
    #[serde(default)]
    pub topic: Option<String>,
}

fn default_service_name() -> String {
    "etl-router".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
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

impl RouterConfig {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("kafka.bootstrap_servers", "localhost:9092")?
            .set_default("kafka.client_id", "etl-router")?
            // Override per deployment so the success and error routers commit independently
            .set_default("kafka.consumer.group_id", "etl-router")?
            .add_source(config::File::with_name("config/router").required(false))
            .add_source(config::File::with_name("/etc/etl/router").required(false))
            // ROUTER__ROUTE__SOURCE -> route.source
            .add_source(
                config::Environment::with_prefix("ROUTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Topic this deployment consumes
    pub fn topic(&self) -> &str {
        self.route
            .topic
            .as_deref()
            .unwrap_or_else(|| self.kafka.topics.outcome_topic(self.route.outcome))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kafka.validate()?;
        self.retry.validate()?;

        for (key, bucket) in [
            ("route.source", &self.route.source),
            ("route.destination", &self.route.destination),
        ] {
            if bucket.is_empty() {
                return Err(ConfigError::MissingRequired(key.to_string()));
            }
            if bucket.contains('/') {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("'{}' is not a bucket name", bucket),
                });
            }
        }

        if self.route.source == self.route.destination {
            return Err(ConfigError::InvalidValue {
                key: "route.destination".to_string(),
                message: "must differ from route.source".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> RouterConfig {
        RouterConfig {
            service: ServiceConfig::default(),
            logging: LoggingConfig::default(),
            kafka: KafkaConfig::new("kafka:9092"),
            s3: S3Config::default(),
            route: RouteConfig {
                source: "landing".to_string(),
                destination: "processed".to_string(),
                outcome: Outcome::Success,
                topic: None,
            },
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }

    #[test]
    fn test_topic_follows_outcome() {
        let mut config = create_test_config();
        assert_eq!(config.topic(), "etl.outcomes.success");

        config.route.outcome = Outcome::Error;
        assert_eq!(config.topic(), "etl.outcomes.error");

        config.route.topic = Some("custom.errors".to_string());
        assert_eq!(config.topic(), "custom.errors");
    }

    #[test]
    fn test_same_source_and_destination_rejected() {
        let mut config = create_test_config();
        assert!(config.validate().is_ok());

        config.route.destination = "landing".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_missing_bucket() {
        let mut config = create_test_config();
        config.route.source = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    #[test]
    fn test_deserialize_route_outcome() {
        let config: RouterConfig = serde_json::from_value(serde_json::json!({
            "route": { "source": "landing", "destination": "rejected", "outcome": "ERROR" }
        }))
        .unwrap();

        assert_eq!(config.route.outcome, Outcome::Error);
        assert_eq!(config.topic(), "etl.outcomes.error");
        assert_eq!(config.service.metrics_port, 9091);
    }
}
