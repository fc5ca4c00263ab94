//! CDC Capture CLI
//!
//! Tails MongoDB change streams and publishes normalized events to a durable
//! message log. One pipeline runs per watched collection.

use anyhow::Context;
use cdc_capture::{shutdown_signal, MongoChangeFeed, NatsJetStreamSink, Pipeline};
use cdc_core::prelude::*;
use cdc_core::{CheckpointStorage, ObservabilityConfig, PublisherConfig, Transport};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cdc-capture")]
#[command(about = "Change data capture relay: MongoDB change streams to a durable message log")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "CDC_RELAY_CONFIG")]
    config: Option<String>,

    /// Full MongoDB connection URI (wins over host/port)
    #[arg(long, env = "MONGO_URI", hide_env_values = true)]
    mongo_uri: Option<String>,

    /// MongoDB host
    #[arg(long, env = "MONGO_HOST")]
    mongo_host: Option<String>,

    /// MongoDB port
    #[arg(long, env = "MONGO_PORT")]
    mongo_port: Option<u16>,

    /// MongoDB username
    #[arg(long, env = "MONGO_USERNAME")]
    mongo_username: Option<String>,

    /// MongoDB password
    #[arg(long, env = "MONGO_PASSWORD", hide_env_values = true)]
    mongo_password: Option<String>,

    /// Database to watch
    #[arg(long, env = "MONGO_DATABASE")]
    database: Option<String>,

    /// Collections to watch (comma-separated)
    #[arg(long, env = "MONGO_COLLECTION", value_delimiter = ',')]
    collection: Vec<String>,

    /// Message log transport
    #[arg(long, env = "CDC_TRANSPORT", value_parser = ["nats", "kafka"])]
    transport: Option<String>,

    /// Broker addresses (comma-separated); `host:port` pairs select Kafka,
    /// `nats://` URLs select NATS unless --transport says otherwise
    #[arg(long, env = "KAFKA_BOOTSTRAP_SERVERS")]
    brokers: Option<String>,

    /// Destination topic
    #[arg(long, env = "KAFKA_TOPIC")]
    topic: Option<String>,

    /// Connection attempts for both feed and broker
    #[arg(long, env = "MAX_CONNECT_ATTEMPTS")]
    max_connect_attempts: Option<u32>,

    /// Persist resume positions under this directory
    #[arg(long, env = "CHECKPOINT_PATH")]
    checkpoint_path: Option<String>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (json or pretty)
    #[arg(long, env = "LOG_FORMAT")]
    log_format: Option<String>,
}

impl Args {
    /// Layer CLI flags and legacy environment names over the loaded config
    fn apply(self, config: &mut RelayConfig) {
        if let Some(uri) = self.mongo_uri {
            config.feed.uri = Some(uri);
        }
        if let Some(host) = self.mongo_host {
            config.feed.host = host;
        }
        if let Some(port) = self.mongo_port {
            config.feed.port = port;
        }
        if self.mongo_username.is_some() {
            config.feed.username = self.mongo_username;
        }
        if self.mongo_password.is_some() {
            config.feed.password = self.mongo_password;
        }
        if let Some(database) = self.database {
            config.feed.database = database;
        }
        let collections: Vec<String> = self
            .collection
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if !collections.is_empty() {
            config.feed.collections = collections;
        }

        if let Some(brokers) = self.brokers.or_else(|| std::env::var("BROKERS").ok()) {
            config.publisher.brokers = brokers
                .split(',')
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty())
                .collect();
            config.publisher.transport = Transport::for_brokers(&config.publisher.brokers);
        }
        match self.transport.as_deref() {
            Some("kafka") => config.publisher.transport = Transport::Kafka,
            Some("nats") => config.publisher.transport = Transport::Nats,
            _ => {}
        }
        if let Some(topic) = self.topic.or_else(|| std::env::var("TOPIC").ok()) {
            config.publisher.topic = topic;
        }

        if let Some(attempts) = self.max_connect_attempts {
            config.feed.connect_retry.max_attempts = attempts;
            config.publisher.connect_retry.max_attempts = attempts;
        }
        if let Some(path) = self.checkpoint_path {
            config.checkpoint.storage_type = CheckpointStorage::File;
            config.checkpoint.path = path;
        }

        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.observability.log_format = format;
        }
    }
}

fn load_config(args: Args) -> anyhow::Result<RelayConfig> {
    let path = args.config.clone();
    let source = path.as_deref().unwrap_or("defaults");
    let mut config = RelayConfig::load(path.as_deref())
        .with_context(|| format!("loading configuration from {}", source))?;
    args.apply(&mut config);
    config.validate().context("validating configuration")?;
    Ok(config)
}

/// Process exit status for a halting error
fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<CdcError>()
        .map(CdcError::exit_code)
        .unwrap_or(1)
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "pretty" {
        tracing_subscriber::registry()
            .with(fmt::layer().pretty())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    }
}

fn build_sink(config: &PublisherConfig) -> Result<Arc<dyn EventSink>> {
    match config.transport {
        Transport::Nats => Ok(Arc::new(NatsJetStreamSink::new(config.into()))),
        #[cfg(feature = "kafka")]
        Transport::Kafka => Ok(Arc::new(cdc_capture::KafkaSink::new(config.into()))),
        #[cfg(not(feature = "kafka"))]
        Transport::Kafka => Err(CdcError::config(
            "Kafka transport requires building with the `kafka` feature",
        )),
    }
}

/// Run one pipeline per namespace until a signal or the first fatal error
async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut pipelines = JoinSet::new();

    for namespace in config.feed.namespaces() {
        let feed: Arc<dyn ChangeFeed> = Arc::new(MongoChangeFeed::new(config.feed.clone()));
        let sink = build_sink(&config.publisher)
            .with_context(|| format!("building sink for {}", namespace))?;
        let mut pipeline = Pipeline::new(namespace.clone(), feed, sink, &config);
        let mut stop = stop_rx.clone();

        pipelines.spawn(async move {
            let result = pipeline
                .run_until(async move {
                    // Sender dropped means the supervisor is gone; stop as well
                    let _ = stop.wait_for(|stopped| *stopped).await;
                })
                .await;
            (namespace, result)
        });
    }

    info!(pipelines = pipelines.len(), topic = %config.publisher.topic, "Pipelines started");

    let signal = shutdown_signal();
    tokio::pin!(signal);
    let mut signalled = false;
    let mut first_error: Option<CdcError> = None;

    loop {
        tokio::select! {
            _ = &mut signal, if !signalled => {
                info!("Shutdown signal received");
                signalled = true;
                stop_tx.send_replace(true);
            }
            joined = pipelines.join_next() => match joined {
                None => break,
                Some(Ok((namespace, Ok(report)))) => {
                    info!(
                        namespace = %namespace,
                        captured = report.captured,
                        published = report.published,
                        skipped = report.skipped,
                        position = %report.last_position,
                        "Pipeline finished"
                    );
                }
                Some(Ok((namespace, Err(e)))) => {
                    error!(namespace = %namespace, kind = e.kind(), error = %e, "Pipeline failed");
                    if first_error.is_none() {
                        stop_tx.send_replace(true);
                        first_error = Some(e);
                    }
                }
                Some(Err(join_error)) => {
                    error!(error = %join_error, "Pipeline task aborted");
                    if first_error.is_none() {
                        stop_tx.send_replace(true);
                        first_error = Some(CdcError::Internal(join_error.to_string()));
                    }
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match load_config(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cdc-capture: {:#}", e);
            std::process::exit(exit_code(&e));
        }
    };

    init_tracing(&config.observability);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        database = %config.feed.database,
        collections = ?config.feed.collections,
        transport = ?config.publisher.transport,
        "Starting cdc-capture"
    );

    if let Err(e) = run(config).await {
        let code = exit_code(&e);
        error!(exit_code = code, error = %format!("{:#}", e), "cdc-capture halted");
        std::process::exit(code);
    }

    info!("cdc-capture stopped gracefully");
    Ok(())
}
