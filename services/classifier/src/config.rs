//! Configuration for the classifier and generator services.
//!
//! Values are layered: built-in defaults, then `config/imagebus.*`, then
//! `/etc/imagebus/imagebus.*`, then environment variables prefixed with
//! `IMAGEBUS` using `__` as the section separator, for example
//! `IMAGEBUS__CLASSIFIER__FORCE_SYNTHETIC=true`.

use crate::kind::ClassifierKind;
use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(String),
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

/// SASL/PLAIN credentials
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaslConfig {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Topic names on the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// The `images` exchange; routing keys travel as record keys
    pub images: String,
    /// Where exhausted messages go when redelivery is bounded
    pub dead_letter: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            images: "images".to_string(),
            dead_letter: "images.dead_letter".to_string(),
        }
    }
}

/// Kafka connection and client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    pub bootstrap_servers: String,
    /// Client ID for this connection
    pub client_id: String,
    /// Consumer group; defaults to the classifier kind's queue name
    pub group_id: Option<String>,
    pub security_protocol: SecurityProtocol,
    pub sasl: SaslConfig,
    /// Auto offset reset: earliest, latest, none
    pub auto_offset_reset: String,
    pub session_timeout_ms: u64,
    pub max_poll_interval_ms: u64,
    /// Producer delivery and consumer seek timeout in milliseconds
    pub request_timeout_ms: u64,
    pub topics: TopicConfig,
    /// Additional librdkafka properties, passed through verbatim
    pub extra_properties: HashMap<String, String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "imagebus".to_string(),
            group_id: None,
            security_protocol: SecurityProtocol::default(),
            sasl: SaslConfig::default(),
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 30000,
            max_poll_interval_ms: 300000,
            request_timeout_ms: 30000,
            topics: TopicConfig::default(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Consumer group for `kind`: the configured one, or the kind's durable queue
    pub fn group_for(&self, kind: ClassifierKind) -> String {
        self.group_id
            .clone()
            .unwrap_or_else(|| kind.queue_name().to_string())
    }

    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", "PLAIN");
            if let Some(ref username) = self.sasl.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Build a producer ClientConfig
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();
        config.set("acks", "all");
        config.set("request.timeout.ms", self.request_timeout_ms.to_string());
        config
    }

    /// Build a consumer ClientConfig with manual acknowledgement
    pub fn build_consumer_config(&self, kind: ClassifierKind) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("group.id", self.group_for(kind));
        config.set("auto.offset.reset", &self.auto_offset_reset);
        config.set("enable.auto.commit", "false");
        config.set("session.timeout.ms", self.session_timeout_ms.to_string());
        config.set("max.poll.interval.ms", self.max_poll_interval_ms.to_string());

        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name for logging
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log format (json, pretty)
    pub log_format: String,
    /// Prometheus exporter port; 0 disables the exporter
    pub metrics_port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "imagebus".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_port: 0,
        }
    }
}

/// Classifier consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub kind: ClassifierKind,
    /// Root of the labeled dataset tree
    pub dataset_dir: PathBuf,
    /// Ignore the dataset and train on the synthetic corpus
    pub force_synthetic: bool,
    /// Log feature vectors with every classification
    pub verbose: bool,
    /// Artificial per-message delay; defaults per kind
    pub processing_delay_ms: Option<u64>,
    /// Failed deliveries allowed before dead-lettering; unset means unbounded
    pub max_redeliveries: Option<u32>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            kind: ClassifierKind::default(),
            dataset_dir: PathBuf::from("./archive"),
            force_synthetic: false,
            verbose: false,
            processing_delay_ms: None,
            max_redeliveries: None,
        }
    }
}

impl ClassifierConfig {
    pub fn processing_delay(&self) -> Duration {
        self.processing_delay_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.kind.default_processing_delay())
    }
}

/// Traffic generator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Emission interval in milliseconds
    pub interval_ms: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self { interval_ms: 200 }
    }
}

impl GeneratorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Top-level configuration shared by both binaries
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub kafka: KafkaConfig,
    pub classifier: ClassifierConfig,
    pub generator: GeneratorConfig,
}

impl AppConfig {
    /// Load configuration from files and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/imagebus").required(false))
            .add_source(config::File::with_name("/etc/imagebus/imagebus").required(false))
            .add_source(
                config::Environment::with_prefix("IMAGEBUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;

        let app: AppConfig = config
            .try_deserialize()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;
        app.validate()?;
        Ok(app)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired(
                "kafka.bootstrap_servers".to_string(),
            ));
        }

        if self.kafka.topics.images.is_empty() {
            return Err(ConfigError::MissingRequired("kafka.topics.images".to_string()));
        }

        if self.kafka.topics.dead_letter.is_empty() {
            return Err(ConfigError::MissingRequired(
                "kafka.topics.dead_letter".to_string(),
            ));
        }

        if self.kafka.security_protocol.uses_sasl() && self.kafka.sasl.username.is_none() {
            return Err(ConfigError::MissingRequired(
                "kafka.sasl.username (required for SASL)".to_string(),
            ));
        }

        if self.classifier.max_redeliveries == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "classifier.max_redeliveries".to_string(),
                message: "must be at least 1, or unset for unbounded redelivery".to_string(),
            });
        }

        if self.generator.interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "generator.interval_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.kafka.bootstrap_servers, "localhost:9092");
        assert_eq!(config.kafka.topics.images, "images");
        assert_eq!(config.classifier.dataset_dir, PathBuf::from("./archive"));
        assert_eq!(config.classifier.max_redeliveries, None);
        assert_eq!(config.generator.interval(), Duration::from_millis(200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_processing_delay_defaults_per_kind() {
        let mut classifier = ClassifierConfig::default();
        assert_eq!(classifier.processing_delay(), Duration::from_millis(1000));

        classifier.kind = ClassifierKind::Team;
        assert_eq!(classifier.processing_delay(), Duration::from_millis(1200));

        classifier.processing_delay_ms = Some(5);
        assert_eq!(classifier.processing_delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_consumer_config_build() {
        let config = KafkaConfig::new("broker:9092");
        let consumer_config = config.build_consumer_config(ClassifierKind::Team);

        assert_eq!(consumer_config.get("bootstrap.servers"), Some("broker:9092"));
        assert_eq!(consumer_config.get("group.id"), Some("queue_team"));
        assert_eq!(consumer_config.get("enable.auto.commit"), Some("false"));
        assert_eq!(consumer_config.get("sasl.mechanism"), None);
    }

    #[test]
    fn test_explicit_group_overrides_queue_name() {
        let config = KafkaConfig {
            group_id: Some("custom".to_string()),
            ..Default::default()
        };
        assert_eq!(config.group_for(ClassifierKind::Mood), "custom");
    }

    #[test]
    fn test_producer_config_build() {
        let producer_config = KafkaConfig::default().build_producer_config();
        assert_eq!(producer_config.get("acks"), Some("all"));
    }

    #[test]
    fn test_validation_rejects_zero_redeliveries() {
        let mut config = AppConfig::default();
        config.classifier.max_redeliveries = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validation_requires_sasl_username() {
        let mut config = AppConfig::default();
        config.kafka.security_protocol = SecurityProtocol::SaslSsl;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }
}
