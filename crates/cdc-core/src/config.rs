//! Configuration types for the CDC relay
//!
//! Uses the `config` crate for layered configuration from defaults, an
//! optional file and `CDC_RELAY__*` environment variables.

use crate::error::{CdcError, Result};
use crate::message::{Namespace, ResumeToken};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Change feed (source) configuration
    #[serde(default)]
    pub feed: FeedConfig,

    /// Publisher (message log) configuration
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Resume position storage
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ============================================================================
// Feed Configuration
// ============================================================================

/// Change feed connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Full connection URI; wins over host/port when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    #[serde(default = "default_feed_host")]
    pub host: String,

    #[serde(default = "default_feed_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Database to watch
    #[serde(default = "default_database")]
    pub database: String,

    /// Collections to watch; one pipeline runs per collection
    #[serde(default = "default_collections")]
    pub collections: Vec<String>,

    /// Server selection timeout for each connection attempt
    #[serde(with = "humantime_serde", default = "default_server_selection_timeout")]
    pub server_selection_timeout: Duration,

    /// Socket connect timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Connection retry budget
    #[serde(default = "default_connect_retry")]
    pub connect_retry: RetryConfig,

    /// Resume token to start from when no checkpoint exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_after: Option<String>,

    /// Application name reported to the server
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

fn default_feed_host() -> String {
    "localhost".to_string()
}

fn default_feed_port() -> u16 {
    27017
}

fn default_database() -> String {
    "etl_db".to_string()
}

fn default_collections() -> Vec<String> {
    vec!["orders".to_string()]
}

fn default_server_selection_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_retry() -> RetryConfig {
    RetryConfig::fixed(10, Duration::from_secs(5))
}

fn default_app_name() -> String {
    "cdc-capture".to_string()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            uri: None,
            host: default_feed_host(),
            port: default_feed_port(),
            username: None,
            password: None,
            database: default_database(),
            collections: default_collections(),
            server_selection_timeout: default_server_selection_timeout(),
            connect_timeout: default_connect_timeout(),
            connect_retry: default_connect_retry(),
            start_after: None,
            app_name: default_app_name(),
        }
    }
}

impl FeedConfig {
    /// Connection URI: explicit `uri`, otherwise built from host and port
    pub fn connection_uri(&self) -> String {
        match &self.uri {
            Some(uri) => uri.clone(),
            None => format!("mongodb://{}:{}/", self.host, self.port),
        }
    }

    /// One namespace per configured collection
    pub fn namespaces(&self) -> Vec<Namespace> {
        self.collections
            .iter()
            .map(|coll| Namespace::new(self.database.clone(), coll.clone()))
            .collect()
    }

    pub fn start_after_token(&self) -> Option<ResumeToken> {
        self.start_after.as_deref().map(ResumeToken::new)
    }
}

// ============================================================================
// Publisher Configuration
// ============================================================================

/// Message log transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// NATS JetStream
    Nats,
    /// Apache Kafka (requires the `kafka` feature)
    Kafka,
}

impl Transport {
    /// Transport implied by a broker address list
    ///
    /// NATS server URLs (`nats://`, `tls://`) select NATS; bare `host:port`
    /// bootstrap servers select Kafka.
    pub fn for_brokers(brokers: &[String]) -> Self {
        if !brokers.is_empty() && brokers.iter().all(|b| is_nats_url(b)) {
            Self::Nats
        } else {
            Self::Kafka
        }
    }
}

fn is_nats_url(address: &str) -> bool {
    let address = address.trim();
    address.starts_with("nats://") || address.starts_with("tls://")
}

/// Publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_transport")]
    pub transport: Transport,

    /// Broker bootstrap addresses
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,

    /// Destination topic (Kafka topic / JetStream subject)
    #[serde(default = "default_topic")]
    pub topic: String,

    /// JetStream stream holding the topic subjects
    #[serde(default = "default_stream_name")]
    pub stream: String,

    /// Connection name (for monitoring)
    #[serde(default = "default_app_name")]
    pub connection_name: String,

    /// Timeout of each connection attempt
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Timeout waiting for one durability acknowledgment
    #[serde(with = "humantime_serde", default = "default_publish_timeout")]
    pub publish_timeout: Duration,

    /// Connection retry budget
    #[serde(default = "default_connect_retry")]
    pub connect_retry: RetryConfig,

    /// Send retry budget for transient transport errors
    #[serde(default = "default_send_retry")]
    pub send_retry: RetryConfig,
}

fn default_transport() -> Transport {
    Transport::Nats
}

fn default_brokers() -> Vec<String> {
    vec!["nats://localhost:4222".to_string()]
}

fn default_topic() -> String {
    "orders-cdc".to_string()
}

fn default_stream_name() -> String {
    "CDC_EVENTS".to_string()
}

fn default_publish_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_send_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 4,
        initial_backoff: Duration::from_millis(500),
        max_backoff: Duration::from_secs(5),
        multiplier: 2.0,
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            brokers: default_brokers(),
            topic: default_topic(),
            stream: default_stream_name(),
            connection_name: default_app_name(),
            connect_timeout: default_connect_timeout(),
            publish_timeout: default_publish_timeout(),
            connect_retry: default_connect_retry(),
            send_retry: default_send_retry(),
        }
    }
}

// ============================================================================
// Shared Configurations
// ============================================================================

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,

    /// Maximum delay
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// Backoff multiplier (1.0 for a fixed delay)
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Fixed delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: delay,
            max_backoff: delay,
            multiplier: 1.0,
        }
    }
}

/// Resume position storage type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStorage {
    /// Held in process memory only
    Memory,
    /// Persisted to a local file after every commit
    File,
}

/// Checkpoint storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_type")]
    pub storage_type: CheckpointStorage,

    /// Directory for file-based checkpoints (one file per namespace)
    #[serde(default = "default_checkpoint_path")]
    pub path: String,
}

fn default_checkpoint_type() -> CheckpointStorage {
    CheckpointStorage::Memory
}

fn default_checkpoint_path() -> String {
    "/var/lib/cdc-capture".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            storage_type: default_checkpoint_type(),
            path: default_checkpoint_path(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl RelayConfig {
    /// Load configuration from file and environment
    ///
    /// Not validated: callers layer their own overrides first, then call
    /// [`RelayConfig::validate`].
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Add default values
        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        // Add config file if specified
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Add environment variables with prefix CDC_RELAY_
        builder = builder.add_source(
            config::Environment::with_prefix("CDC_RELAY")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("feed.collections")
                .with_list_parse_key("publisher.brokers")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.feed.database.trim().is_empty() {
            return Err(CdcError::config("feed.database must not be empty"));
        }
        if self.feed.collections.iter().all(|c| c.trim().is_empty()) {
            return Err(CdcError::config("feed.collections must name at least one collection"));
        }
        if self.publisher.topic.trim().is_empty() {
            return Err(CdcError::config("publisher.topic must not be empty"));
        }
        if self.publisher.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(CdcError::config("publisher.brokers must name at least one broker"));
        }
        match self.publisher.transport {
            Transport::Nats => {
                if let Some(address) = self.publisher.brokers.iter().find(|b| !is_nats_url(b)) {
                    return Err(CdcError::config(format!(
                        "NATS transport needs nats:// or tls:// server URLs, got '{}'",
                        address
                    )));
                }
            }
            Transport::Kafka => {
                if let Some(address) = self.publisher.brokers.iter().find(|b| b.contains("://")) {
                    return Err(CdcError::config(format!(
                        "Kafka bootstrap servers are host:port pairs, got '{}'",
                        address
                    )));
                }
            }
        }
        for (name, retry) in [
            ("feed.connect_retry", &self.feed.connect_retry),
            ("publisher.connect_retry", &self.publisher.connect_retry),
            ("publisher.send_retry", &self.publisher.send_retry),
        ] {
            if retry.max_attempts == 0 {
                return Err(CdcError::config(format!("{}.max_attempts must be at least 1", name)));
            }
        }
        if self.publisher.publish_timeout.is_zero() {
            return Err(CdcError::config("publisher.publish_timeout must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment() {
        let config = RelayConfig::default();
        assert_eq!(config.feed.connection_uri(), "mongodb://localhost:27017/");
        assert_eq!(config.feed.namespaces(), vec![Namespace::new("etl_db", "orders")]);
        assert_eq!(config.feed.connect_retry.max_attempts, 10);
        assert_eq!(config.feed.connect_retry.initial_backoff, Duration::from_secs(5));
        assert_eq!(config.publisher.topic, "orders-cdc");
        assert_eq!(config.checkpoint.storage_type, CheckpointStorage::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_transport_follows_broker_addresses() {
        let nats = vec!["nats://nats-0:4222".to_string(), "tls://nats-1:4222".to_string()];
        let kafka = vec!["kafka-0:9092".to_string()];
        assert_eq!(Transport::for_brokers(&nats), Transport::Nats);
        assert_eq!(Transport::for_brokers(&kafka), Transport::Kafka);
    }

    #[test]
    fn test_validate_rejects_brokers_of_the_other_transport() {
        let mut config = RelayConfig::default();
        config.publisher.brokers = vec!["kafka:9092".into()];
        let err = config.validate().unwrap_err();
        assert_eq!(err.exit_code(), 5);
        assert!(err.to_string().contains("kafka:9092"));

        config.publisher.transport = Transport::Kafka;
        assert!(config.validate().is_ok());

        config.publisher.brokers = vec!["nats://localhost:4222".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_uri_wins() {
        let feed = FeedConfig {
            uri: Some("mongodb://replica-0:27017,replica-1:27017/?replicaSet=rs0".into()),
            ..Default::default()
        };
        assert!(feed.connection_uri().contains("replicaSet=rs0"));
    }

    #[test]
    fn test_validate_rejects_bad_budgets() {
        let mut config = RelayConfig::default();
        config.publisher.send_retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(CdcError::Configuration { .. })));

        let mut config = RelayConfig::default();
        config.publisher.topic = " ".into();
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.feed.collections = vec![];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_defaults_without_file() {
        let config = RelayConfig::load(None).unwrap();
        assert_eq!(config.feed.database, "etl_db");
        assert_eq!(config.publisher.transport, Transport::Nats);
    }
}
