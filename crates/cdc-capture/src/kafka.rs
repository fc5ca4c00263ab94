//! Kafka event sink
//!
//! Produces with `acks=all` and idempotence enabled, so an acknowledged
//! send is durable on every in-sync replica. The event's document key is the
//! record key, keeping one document's events on one partition.

use async_trait::async_trait;
use bytes::Bytes;
use cdc_core::prelude::*;
use cdc_core::PublisherConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};

const COMPONENT: &str = "broker";

/// Kafka sink configuration
#[derive(Debug, Clone)]
pub struct KafkaSinkConfig {
    /// Bootstrap servers (comma-separated)
    pub brokers: String,
    /// Topic probed by the liveness check
    pub topic: String,
    /// Client id reported to the brokers
    pub client_id: String,
    /// librdkafka-internal send retries
    pub retries: u32,
    /// Upper bound on one send including internal retries
    pub message_timeout: Duration,
    /// Metadata request timeout
    pub metadata_timeout: Duration,
}

impl From<&PublisherConfig> for KafkaSinkConfig {
    fn from(config: &PublisherConfig) -> Self {
        Self {
            brokers: config.brokers.join(","),
            topic: config.topic.clone(),
            client_id: config.connection_name.clone(),
            retries: 3,
            message_timeout: config.publish_timeout,
            metadata_timeout: config.connect_timeout,
        }
    }
}

/// Kafka event sink over an rdkafka `FutureProducer`
pub struct KafkaSink {
    config: KafkaSinkConfig,
    producer: RwLock<Option<FutureProducer>>,
}

impl KafkaSink {
    pub fn new(config: KafkaSinkConfig) -> Self {
        Self {
            config,
            producer: RwLock::new(None),
        }
    }

    fn create_producer(&self) -> Result<FutureProducer> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("client.id", &self.config.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("retries", self.config.retries.to_string())
            .set(
                "message.timeout.ms",
                self.config.message_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| CdcError::config(format!("invalid Kafka producer settings: {}", e)))
    }

    fn producer(&self) -> Result<FutureProducer> {
        self.producer
            .read()
            .map_err(|_| CdcError::Internal("producer lock poisoned".into()))?
            .clone()
            .ok_or_else(|| CdcError::transient(COMPONENT, "producer not connected"))
    }

    /// Blocking metadata fetch, moved off the async runtime
    async fn fetch_metadata(&self, producer: FutureProducer) -> Result<()> {
        let topic = self.config.topic.clone();
        let timeout = self.config.metadata_timeout;
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(&topic), timeout)
                .map(|_| ())
        })
        .await
        .map_err(|e| CdcError::Internal(format!("metadata task failed: {}", e)))?
        .map_err(|e| CdcError::transient_with_source(COMPONENT, "metadata fetch failed", e))
    }
}

/// Timeouts and transport faults are retried by the publisher; rejections are final
fn classify_send_error(topic: &str, err: KafkaError) -> CdcError {
    let retryable = match &err {
        KafkaError::MessageProduction(code) => matches!(
            code,
            RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::NotEnoughReplicas
                | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotLeaderForPartition
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::QueueFull
        ),
        _ => false,
    };

    if retryable {
        CdcError::transient_with_source(COMPONENT, "Kafka send not acknowledged", err)
    } else {
        CdcError::Publish {
            topic: topic.to_string(),
            attempts: 1,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

#[async_trait]
impl HealthCheck for KafkaSink {
    async fn health_check(&self) -> Result<()> {
        let producer = self.producer()?;
        self.fetch_metadata(producer).await
    }

    fn component_name(&self) -> &'static str {
        "kafka_sink"
    }
}

#[async_trait]
impl EventSink for KafkaSink {
    async fn connect(&self) -> Result<()> {
        info!(brokers = %self.config.brokers, "Connecting to Kafka");
        let producer = self.create_producer()?;
        self.fetch_metadata(producer.clone()).await?;

        *self
            .producer
            .write()
            .map_err(|_| CdcError::Internal("producer lock poisoned".into()))? = Some(producer);
        info!(topic = %self.config.topic, "Kafka sink connected");
        Ok(())
    }

    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<AckMetadata> {
        let producer = self.producer()?;
        let record = FutureRecord::to(topic).key(key).payload(payload.as_ref());

        debug!(topic, key, "Producing event");
        let (partition, offset) = producer
            .send(record, Timeout::After(self.config.message_timeout))
            .await
            .map_err(|(e, _)| classify_send_error(topic, e))?;

        Ok(AckMetadata {
            destination: topic.to_string(),
            partition,
            offset: u64::try_from(offset).unwrap_or_default(),
            size_bytes: payload.len(),
        })
    }

    async fn flush(&self) -> Result<()> {
        let producer = self.producer()?;
        let timeout = self.config.message_timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| CdcError::Internal(format!("flush task failed: {}", e)))?
            .map_err(|e| CdcError::transient_with_source(COMPONENT, "Kafka flush failed", e))
    }

    async fn close(&self) -> Result<()> {
        let producer = self
            .producer
            .write()
            .map_err(|_| CdcError::Internal("producer lock poisoned".into()))?
            .take();
        if producer.is_some() {
            info!("Kafka sink closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_publisher_config() {
        let config = PublisherConfig {
            brokers: vec!["kafka-0:9092".into(), "kafka-1:9092".into()],
            topic: "orders-cdc".into(),
            ..Default::default()
        };
        let kafka = KafkaSinkConfig::from(&config);
        assert_eq!(kafka.brokers, "kafka-0:9092,kafka-1:9092");
        assert_eq!(kafka.retries, 3);
        assert_eq!(kafka.message_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_send_error_classification() {
        let timed_out = KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut);
        assert!(classify_send_error("orders-cdc", timed_out).is_retryable());

        let too_large = KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge);
        assert!(matches!(
            classify_send_error("orders-cdc", too_large),
            CdcError::Publish { .. }
        ));
    }

    #[tokio::test]
    async fn test_send_before_connect_is_transient() {
        let sink = KafkaSink::new(KafkaSinkConfig::from(&PublisherConfig::default()));
        let err = sink
            .send("orders-cdc", "42", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
