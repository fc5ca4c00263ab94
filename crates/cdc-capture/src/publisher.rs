//! Event publishing
//!
//! [`Publisher`] wraps an [`EventSink`] with connection state, bounded
//! retries and timeouts. Sinks:
//! - NatsJetStreamSink: NATS JetStream
//! - KafkaSink: Apache Kafka (feature `kafka`)
//! - MockSink: in-memory log, for testing

use async_nats::jetstream::{self, context::PublishErrorKind, Context};
use async_trait::async_trait;
use bytes::Bytes;
use cdc_core::prelude::*;
use cdc_core::{
    with_timeout, ConnectionState, ConnectionTracker, PipelineMetrics,
    PublisherConfig, RetryPolicy, Sleeper, TokioSleeper,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, trace, warn};

const COMPONENT: &str = "broker";

/// Header carrying the document key on JetStream messages
pub const DOCUMENT_KEY_HEADER: &str = "Cdc-Document-Key";

// ============================================================================
// Publisher
// ============================================================================

/// Durable publisher for normalized events
pub struct Publisher<S: EventSink + ?Sized> {
    sink: Arc<S>,
    topic: String,
    connect_retry: RetryPolicy,
    send_retry: RetryPolicy,
    connect_timeout: Duration,
    publish_timeout: Duration,
    sleeper: Arc<dyn Sleeper>,
    tracker: ConnectionTracker,
    metrics: PipelineMetrics,
    published: u64,
}

impl<S: EventSink + ?Sized> Publisher<S> {
    pub fn new(sink: Arc<S>, config: &PublisherConfig) -> Self {
        Self {
            sink,
            topic: config.topic.clone(),
            connect_retry: RetryPolicy::from(&config.connect_retry),
            send_retry: RetryPolicy::from(&config.send_retry),
            connect_timeout: config.connect_timeout,
            publish_timeout: config.publish_timeout,
            sleeper: Arc::new(TokioSleeper),
            tracker: ConnectionTracker::new(COMPONENT),
            metrics: PipelineMetrics::new(config.topic.clone()),
            published: 0,
        }
    }

    /// Use a custom sleeper for retry delays
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn sink(&self) -> &Arc<S> {
        &self.sink
    }

    pub fn state(&self) -> ConnectionState {
        self.tracker.state()
    }

    /// Events acknowledged by this publisher
    pub fn published_count(&self) -> u64 {
        self.published
    }

    /// Connect with the bounded retry budget
    pub async fn connect(&mut self) -> Result<()> {
        self.tracker.transition(ConnectionState::Connecting);

        let sink = &self.sink;
        let tracker = &self.tracker;
        let timeout = self.connect_timeout;
        let result = self
            .connect_retry
            .run(self.sleeper.as_ref(), "broker.connect", |attempt| {
                tracker.record_attempt();
                debug!(attempt, "Connecting to broker");
                with_timeout("broker connect", timeout, sink.connect())
            })
            .await;

        match result {
            Ok(()) => {
                self.tracker.transition(ConnectionState::Connected);
                info!(
                    topic = %self.topic,
                    sink = self.sink.component_name(),
                    "Publisher connected"
                );
                Ok(())
            }
            Err(err) => {
                self.tracker.transition(ConnectionState::Failed);
                error!(attempts = err.attempts, error = %err.last, "Broker connection failed");
                if err.exhausted {
                    Err(CdcError::FatalConnection {
                        component: COMPONENT,
                        attempts: err.attempts,
                        message: err.last.to_string(),
                    })
                } else {
                    Err(err.last)
                }
            }
        }
    }

    /// Serialize, send and wait for the durability acknowledgment
    ///
    /// Transient transport failures and timeouts are retried within the send
    /// budget. Exhaustion, or a rejection by the broker, is a `Publish`
    /// error; the caller must not advance past the event.
    pub async fn publish(&mut self, event: &NormalizedEvent) -> Result<AckMetadata> {
        if !self.tracker.is_connected() {
            return Err(CdcError::Publish {
                topic: self.topic.clone(),
                attempts: 0,
                message: format!("publisher is {}", self.tracker.state()),
                source: None,
            });
        }

        let payload = event.to_bytes()?;
        let key = event.document_key.as_str();
        let timer = self.metrics.publish_timer();

        let sink = &self.sink;
        let topic = self.topic.as_str();
        let timeout = self.publish_timeout;
        let mut attempts = 0;
        let result = self
            .send_retry
            .run(self.sleeper.as_ref(), "publish", |attempt| {
                attempts = attempt;
                with_timeout("publish", timeout, sink.send(topic, key, payload.clone()))
            })
            .await;
        timer.finish(if result.is_ok() { "acked" } else { "failed" });

        self.metrics.record_publish_retries(attempts.saturating_sub(1));
        match result {
            Ok(ack) => {
                self.published += 1;
                self.metrics.record_published(&ack.destination, ack.size_bytes);
                trace!(
                    topic = %self.topic,
                    document_key = %event.document_key,
                    attempts,
                    "Publish acknowledged"
                );
                Ok(ack)
            }
            Err(err) => {
                error!(
                    topic = %self.topic,
                    document_key = %event.document_key,
                    attempts = err.attempts,
                    error = %err.last,
                    "Publish failed"
                );
                Err(match err.last {
                    CdcError::Publish { message, source, .. } => CdcError::Publish {
                        topic: self.topic.clone(),
                        attempts: err.attempts,
                        message,
                        source,
                    },
                    last => CdcError::Publish {
                        topic: self.topic.clone(),
                        attempts: err.attempts,
                        message: last.to_string(),
                        source: Some(Box::new(last)),
                    },
                })
            }
        }
    }

    /// Flush pending sends and close the connection
    ///
    /// Close is attempted even when the flush fails; the first error wins.
    pub async fn shutdown(&mut self) -> Result<()> {
        let flushed = if self.tracker.is_connected() {
            with_timeout("broker flush", self.publish_timeout, self.sink.flush()).await
        } else {
            Ok(())
        };
        if let Err(ref e) = flushed {
            warn!(error = %e, "Flush before close failed");
        }

        let closed = self.sink.close().await;
        self.tracker.release();
        info!(topic = %self.topic, published = self.published, "Publisher closed");
        flushed.and(closed)
    }
}

// ============================================================================
// NATS JetStream Sink
// ============================================================================

/// NATS JetStream sink configuration
#[derive(Debug, Clone)]
pub struct NatsJetStreamSinkConfig {
    /// NATS server URLs (comma-separated)
    pub url: String,
    /// Stream name
    pub stream: String,
    /// Subject the stream must cover (also `{subject}.>`)
    pub subject: String,
    /// Connection name
    pub connection_name: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Timeout for JetStream API requests
    pub request_timeout: Duration,
    /// Maximum age of stored events
    pub max_age: Duration,
}

impl Default for NatsJetStreamSinkConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream: "CDC_EVENTS".to_string(),
            subject: "orders-cdc".to_string(),
            connection_name: "cdc-capture".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl From<&PublisherConfig> for NatsJetStreamSinkConfig {
    fn from(config: &PublisherConfig) -> Self {
        Self {
            url: config.brokers.join(","),
            stream: config.stream.clone(),
            subject: config.topic.clone(),
            connection_name: config.connection_name.clone(),
            connect_timeout: config.connect_timeout,
            request_timeout: config.publish_timeout,
            ..Default::default()
        }
    }
}

/// NATS JetStream event sink
pub struct NatsJetStreamSink {
    config: NatsJetStreamSinkConfig,
    client: RwLock<Option<async_nats::Client>>,
    jetstream: RwLock<Option<Context>>,
    published: AtomicU64,
}

impl NatsJetStreamSink {
    /// Create new NATS JetStream sink
    pub fn new(config: NatsJetStreamSinkConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            jetstream: RwLock::new(None),
            published: AtomicU64::new(0),
        }
    }

    /// Get published count
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Ensure stream exists
    async fn ensure_stream(&self, js: &Context) -> Result<()> {
        let stream_name = &self.config.stream;

        match js.get_stream(stream_name).await {
            Ok(_) => {
                debug!(stream = stream_name, "Stream exists");
                Ok(())
            }
            Err(_) => {
                let config = jetstream::stream::Config {
                    name: stream_name.clone(),
                    subjects: vec![
                        self.config.subject.clone(),
                        format!("{}.>", self.config.subject),
                    ],
                    retention: jetstream::stream::RetentionPolicy::Limits,
                    max_age: self.config.max_age,
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };

                js.create_stream(config).await.map_err(|e| {
                    CdcError::transient_with_source(COMPONENT, "Failed to create stream", e)
                })?;

                info!(stream = stream_name, "Created stream");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl HealthCheck for NatsJetStreamSink {
    async fn health_check(&self) -> Result<()> {
        let client = self.client.read().await;
        match client.as_ref() {
            Some(c) if c.connection_state() == async_nats::connection::State::Connected => Ok(()),
            Some(_) => Err(CdcError::transient(COMPONENT, "Not connected")),
            None => Err(CdcError::transient(COMPONENT, "Client not initialized")),
        }
    }

    fn component_name(&self) -> &'static str {
        "nats_jetstream_sink"
    }
}

#[async_trait]
impl EventSink for NatsJetStreamSink {
    async fn connect(&self) -> Result<()> {
        info!(url = %self.config.url, "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .name(&self.config.connection_name)
            .connection_timeout(self.config.connect_timeout)
            .request_timeout(Some(self.config.request_timeout))
            .connect(self.config.url.as_str())
            .await
            .map_err(|e| CdcError::transient_with_source(COMPONENT, "Failed to connect", e))?;

        let js = jetstream::new(client.clone());
        self.ensure_stream(&js).await?;

        *self.client.write().await = Some(client);
        *self.jetstream.write().await = Some(js);

        info!(stream = %self.config.stream, "NATS JetStream sink connected");
        Ok(())
    }

    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<AckMetadata> {
        let js = self.jetstream.read().await;
        let js = js
            .as_ref()
            .ok_or_else(|| CdcError::transient(COMPONENT, "JetStream not initialized"))?;

        let size_bytes = payload.len();
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(DOCUMENT_KEY_HEADER, key);

        let ack = js
            .publish_with_headers(topic.to_string(), headers, payload)
            .await
            .map_err(|e| classify_publish_error(topic, e))?
            .await
            .map_err(|e| classify_publish_error(topic, e))?;

        if ack.duplicate {
            warn!(
                stream = %ack.stream,
                sequence = ack.sequence,
                "Broker reported duplicate message"
            );
        }
        self.published.fetch_add(1, Ordering::Relaxed);

        Ok(AckMetadata {
            destination: ack.stream,
            partition: 0,
            offset: ack.sequence,
            size_bytes,
        })
    }

    async fn flush(&self) -> Result<()> {
        if let Some(client) = self.client.read().await.as_ref() {
            client
                .flush()
                .await
                .map_err(|e| CdcError::transient_with_source(COMPONENT, "Flush failed", e))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.jetstream.write().await = None;
        *self.client.write().await = None;

        info!(
            published = self.published.load(Ordering::Relaxed),
            "NATS JetStream sink closed"
        );
        Ok(())
    }
}

/// Lost acknowledgments are retried; anything the server rejected is final
fn classify_publish_error(topic: &str, err: jetstream::context::PublishError) -> CdcError {
    match err.kind() {
        PublishErrorKind::TimedOut | PublishErrorKind::BrokenPipe => {
            CdcError::transient_with_source(COMPONENT, "JetStream publish not acknowledged", err)
        }
        _ => CdcError::Publish {
            topic: topic.to_string(),
            attempts: 1,
            message: err.to_string(),
            source: Some(Box::new(err)),
        },
    }
}

// ============================================================================
// Mock Sink (for testing)
// ============================================================================

/// Message captured by [`MockSink`]
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub topic: String,
    pub key: String,
    pub payload: Bytes,
    pub offset: u64,
}

impl SentMessage {
    /// Decode the payload back into an event
    pub fn event(&self) -> Result<NormalizedEvent> {
        Ok(NormalizedEvent::from_bytes(&self.payload)?)
    }
}

/// In-memory event sink
///
/// Every acknowledged send lands in an append-only log. Failures can be
/// injected for connects and sends.
pub struct MockSink {
    messages: RwLock<Vec<SentMessage>>,
    acked: watch::Sender<usize>,
    connected: AtomicBool,
    fail_connects: AtomicU32,
    fail_sends: AtomicU32,
    failing: AtomicBool,
    send_attempts: AtomicU32,
}

impl MockSink {
    pub fn new() -> Self {
        let (acked, _) = watch::channel(0);
        Self {
            messages: RwLock::new(Vec::new()),
            acked,
            connected: AtomicBool::new(false),
            fail_connects: AtomicU32::new(0),
            fail_sends: AtomicU32::new(0),
            failing: AtomicBool::new(false),
            send_attempts: AtomicU32::new(0),
        }
    }

    /// Get all acknowledged messages
    pub async fn messages(&self) -> Vec<SentMessage> {
        self.messages.read().await.clone()
    }

    /// Decoded events in acknowledgment order
    pub async fn events(&self) -> Vec<NormalizedEvent> {
        self.messages
            .read()
            .await
            .iter()
            .filter_map(|m| m.event().ok())
            .collect()
    }

    /// Wait until at least `count` sends have been acknowledged
    pub async fn wait_for(&self, count: usize) {
        let mut acked = self.acked.subscribe();
        acked.wait_for(|n| *n >= count).await.ok();
    }

    /// Fail the next `count` connection attempts
    pub fn fail_connects(&self, count: u32) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` sends with a transient error
    pub fn fail_sends(&self, count: u32) {
        self.fail_sends.store(count, Ordering::SeqCst);
    }

    /// Fail every send with a transient error until cleared
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn send_attempts(&self) -> u32 {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl HealthCheck for MockSink {
    async fn health_check(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(CdcError::transient(COMPONENT, "mock sink disconnected"))
        }
    }

    fn component_name(&self) -> &'static str {
        "mock_sink"
    }
}

#[async_trait]
impl EventSink for MockSink {
    async fn connect(&self) -> Result<()> {
        if take_one(&self.fail_connects) {
            return Err(CdcError::transient(COMPONENT, "broker unavailable"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<AckMetadata> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) || take_one(&self.fail_sends) {
            return Err(CdcError::transient(COMPONENT, "not enough in-sync replicas"));
        }

        let mut messages = self.messages.write().await;
        let offset = messages.len() as u64;
        let size_bytes = payload.len();
        messages.push(SentMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
            offset,
        });
        self.acked.send_replace(messages.len());

        Ok(AckMetadata {
            destination: topic.to_string(),
            partition: 0,
            offset,
            size_bytes,
        })
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
