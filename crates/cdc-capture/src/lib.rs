//! # CDC Capture
//!
//! Tails a change feed, normalizes every data change and publishes it to a
//! durable message log with at-least-once delivery.
//!
//! ## Strategies
//!
//! - `MongoChangeFeed`: MongoDB change streams
//! - `NatsJetStreamSink`: NATS JetStream
//! - `KafkaSink`: Apache Kafka (feature `kafka`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! let feed = Arc::new(MongoChangeFeed::new(config.feed.clone()));
//! let sink = Arc::new(NatsJetStreamSink::new((&config.publisher).into()));
//!
//! let mut pipeline = Pipeline::new(namespace, feed, sink, &config);
//! let report = pipeline.run().await?;
//! ```

pub mod checkpoint;
pub mod feed;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod publisher;
pub mod subscriber;

pub use checkpoint::*;
pub use feed::*;
#[cfg(feature = "kafka")]
pub use kafka::*;
pub use publisher::*;
pub use subscriber::*;

use cdc_core::prelude::*;
use cdc_core::{ErrorContext, ErrorContextExt, PipelineMetrics, Sleeper};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Counters reported when a pipeline stops
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineReport {
    /// Data changes taken from the feed
    pub captured: u64,
    /// Events acknowledged by the broker
    pub published: u64,
    /// Malformed records skipped
    pub skipped: u64,
    /// Committed resume position at exit
    pub last_position: ResumePosition,
}

/// Capture → normalize → publish loop for one namespace
///
/// Record N+1 is taken only after record N is acknowledged (or skipped) and
/// committed, so broker order equals feed order.
pub struct Pipeline<F, S>
where
    F: ChangeFeed + ?Sized,
    S: EventSink + ?Sized,
{
    namespace: Namespace,
    subscriber: FeedSubscriber<F>,
    publisher: Publisher<S>,
    normalizer: Normalizer,
    checkpoint: Arc<dyn CheckpointStore>,
    start_after: Option<ResumeToken>,
    metrics: PipelineMetrics,
    report: PipelineReport,
}

impl<F, S> Pipeline<F, S>
where
    F: ChangeFeed + ?Sized,
    S: EventSink + ?Sized,
{
    /// Create new pipeline
    pub fn new(namespace: Namespace, feed: Arc<F>, sink: Arc<S>, config: &RelayConfig) -> Self {
        let metrics = PipelineMetrics::new(namespace.to_string());
        Self {
            subscriber: FeedSubscriber::new(feed, namespace.clone(), &config.feed),
            publisher: Publisher::new(sink, &config.publisher).with_metrics(metrics.clone()),
            normalizer: Normalizer::new(),
            checkpoint: checkpoint_for(&config.checkpoint, &namespace),
            start_after: config.feed.start_after_token(),
            metrics,
            report: PipelineReport::default(),
            namespace,
        }
    }

    /// Use a custom checkpoint store
    pub fn with_checkpoint(mut self, checkpoint: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Use a custom sleeper for every retry delay
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.subscriber = self.subscriber.with_sleeper(sleeper.clone());
        self.publisher = self.publisher.with_sleeper(sleeper);
        self
    }

    /// Use a custom normalizer (e.g. with a fixed clock)
    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Committed resume position
    pub fn position(&self) -> &ResumePosition {
        self.subscriber.position()
    }

    pub fn report(&self) -> &PipelineReport {
        &self.report
    }

    /// Restore the position, connect both ends and subscribe
    ///
    /// The publisher connects first so nothing is taken from the feed
    /// without a broker to send it to.
    pub async fn start(&mut self) -> Result<()> {
        let stored = self
            .checkpoint
            .load()
            .await
            .with_context(
                ErrorContext::new("pipeline", "load_checkpoint")
                    .with_namespace(&self.namespace),
            )?;

        let position = match (stored.is_start(), &self.start_after) {
            (true, Some(token)) => ResumePosition::after(token.clone()),
            _ => stored,
        };
        info!(
            namespace = %self.namespace,
            position = %position,
            checkpoint = self.checkpoint.name(),
            "Starting pipeline"
        );
        self.subscriber.set_position(position.clone());
        self.report.last_position = position;

        self.publisher.connect().await?;
        self.subscriber.connect().await?;
        self.subscriber.subscribe().await
    }

    /// Run until Ctrl-C or SIGTERM
    pub async fn run(&mut self) -> Result<PipelineReport> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` completes or a fatal error occurs
    ///
    /// Both connections are released on every exit path. Shutdown stops
    /// taking new records; an in-flight publish is awaited first.
    pub async fn run_until<Fut>(&mut self, shutdown: Fut) -> Result<PipelineReport>
    where
        Fut: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let started = tokio::select! {
            biased;
            _ = shutdown.as_mut() => None,
            started = self.start() => Some(started),
        };
        let result = match started {
            Some(Ok(())) => self.drive(shutdown.as_mut()).await,
            Some(Err(e)) => Err(e),
            None => {
                info!(namespace = %self.namespace, "Shutdown requested during startup");
                Ok(())
            }
        };

        let released = self.release().await;
        match result {
            Ok(()) => {
                released?;
                info!(namespace = %self.namespace, report = ?self.report, "Pipeline stopped");
                Ok(self.report.clone())
            }
            Err(e) => {
                self.metrics.record_error(e.kind());
                error!(
                    namespace = %self.namespace,
                    kind = e.kind(),
                    error = %e,
                    position = %self.report.last_position,
                    "Pipeline halted"
                );
                if let Err(release_error) = released {
                    warn!(error = %release_error, "Release after failure also failed");
                }
                Err(e)
            }
        }
    }

    async fn drive<Fut>(&mut self, mut shutdown: Pin<&mut Fut>) -> Result<()>
    where
        Fut: Future<Output = ()>,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.as_mut() => None,
                record = self.subscriber.take() => Some(record),
            };
            let Some(record) = next else {
                info!(namespace = %self.namespace, "Shutdown requested");
                return Ok(());
            };
            self.process(record?).await?;
        }
    }

    /// Normalize, publish and commit one record
    async fn process(&mut self, record: RawChangeRecord) -> Result<()> {
        let token = record.resume_token.clone();
        self.report.captured += 1;
        self.metrics.record_captured(&record.operation.to_string());

        let event = match self.normalizer.normalize(&record) {
            Ok(event) => event,
            Err(e @ CdcError::MalformedRecord { .. }) => {
                warn!(
                    namespace = %self.namespace,
                    token = %token,
                    error = %e,
                    "Skipping malformed record"
                );
                self.metrics.record_skipped();
                self.report.skipped += 1;
                self.commit(token).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let ack = self.publisher.publish(&event).await?;
        info!(
            operation = %event.operation(),
            namespace = %event.namespace,
            document_key = %event.document_key,
            topic = self.publisher.topic(),
            partition = ack.partition,
            offset = ack.offset,
            size_bytes = ack.size_bytes,
            "Published change event"
        );
        self.report.published += 1;
        self.commit(token).await;
        Ok(())
    }

    /// Advance the position; a failed checkpoint write is not fatal
    async fn commit(&mut self, token: ResumeToken) {
        self.subscriber.commit(token);
        let position = self.subscriber.position().clone();
        if let Err(e) = self.checkpoint.save(&position).await {
            warn!(namespace = %self.namespace, error = %e, "Failed to persist resume position");
            self.metrics.record_checkpoint_failure();
        }
        self.report.last_position = position;
    }

    /// Flush and close the publisher, then close the feed
    async fn release(&mut self) -> Result<()> {
        debug!(namespace = %self.namespace, "Releasing connections");
        let published = self.publisher.shutdown().await;
        let subscribed = self.subscriber.shutdown().await;
        published.and(subscribed)
    }
}

/// Completes on Ctrl-C or SIGTERM
///
/// A handler that cannot be installed never completes.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl-C handler");
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                futures::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_core::{ChangePayload, RecordingSleeper, UpdateDelta};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::oneshot;

    fn ns() -> Namespace {
        Namespace::new("etl_db", "orders")
    }

    fn token(i: usize) -> ResumeToken {
        ResumeToken::new(format!("t{}", i))
    }

    fn order(i: usize) -> RawChangeRecord {
        RawChangeRecord::insert(
            ns(),
            DocValue::object_id([i as u8; 12]),
            Document::new()
                .with("order_id", i as i64)
                .with("amount", 19.99),
            token(i),
        )
    }

    fn pipeline(
        feed: &MockFeed,
        sink: &Arc<MockSink>,
        checkpoint: Arc<dyn CheckpointStore>,
    ) -> Pipeline<MockFeed, MockSink> {
        Pipeline::new(ns(), Arc::new(feed.clone()), sink.clone(), &RelayConfig::default())
            .with_checkpoint(checkpoint)
            .with_sleeper(Arc::new(RecordingSleeper::new()))
    }

    /// Run until `count` events are acknowledged, then shut down
    async fn run_until_acked(
        pipeline: &mut Pipeline<MockFeed, MockSink>,
        sink: &Arc<MockSink>,
        count: usize,
    ) -> Result<PipelineReport> {
        let sink = sink.clone();
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.run_until(async move { sink.wait_for(count).await }),
        )
        .await;
        report.expect("pipeline did not reach the expected ack count")
    }

    fn order_ids(events: &[NormalizedEvent]) -> Vec<i64> {
        events
            .iter()
            .map(|e| match &e.change {
                ChangePayload::Insert(doc) => doc["order_id"].as_i64().unwrap(),
                other => panic!("unexpected payload {:?}", other),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_preserves_feed_order() {
        let feed = MockFeed::with_records((1..=20).map(order));
        let sink = Arc::new(MockSink::new());
        let mut pipeline = pipeline(&feed, &sink, Arc::new(MemoryCheckpoint::new()));

        let report = run_until_acked(&mut pipeline, &sink, 20).await.unwrap();

        assert_eq!(order_ids(&sink.events().await), (1..=20).collect::<Vec<_>>());
        assert_eq!(report.published, 20);
        assert_eq!(report.last_position.token(), Some(&token(20)));
        assert!(!sink.is_connected());
        assert!(!feed.is_connected());
    }

    #[tokio::test]
    async fn test_restart_resumes_after_last_ack() {
        let feed = MockFeed::with_records((1..=10).map(order));
        let checkpoint: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpoint::new());

        let first_sink = Arc::new(MockSink::new());
        let mut first = pipeline(&feed, &first_sink, checkpoint.clone());
        run_until_acked(&mut first, &first_sink, 4).await.unwrap();
        let acked = first_sink.messages().await.len();

        let second_sink = Arc::new(MockSink::new());
        let mut second = pipeline(&feed, &second_sink, checkpoint);
        run_until_acked(&mut second, &second_sink, 10 - acked).await.unwrap();

        let mut ids = order_ids(&first_sink.events().await);
        ids.extend(order_ids(&second_sink.events().await));
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
        assert_eq!(
            feed.subscriptions().last(),
            Some(&Some(token(acked)))
        );
    }

    #[tokio::test]
    async fn test_resume_gap_is_fatal() {
        let feed = MockFeed::with_records((1..=10).map(order));
        feed.compact(6);
        let checkpoint = Arc::new(MemoryCheckpoint::with_position(ResumePosition::after(token(2))));
        let sink = Arc::new(MockSink::new());
        let mut pipeline = pipeline(&feed, &sink, checkpoint);

        let err = pipeline.run_until(futures::future::pending()).await.unwrap_err();

        assert!(matches!(err, CdcError::ResumeGap { .. }));
        assert_eq!(err.exit_code(), 3);
        assert!(sink.messages().await.is_empty());
        assert!(!sink.is_connected());
    }

    #[tokio::test]
    async fn test_publish_failure_halts_without_advancing() {
        let feed = MockFeed::with_records((1..=3).map(order));
        let checkpoint: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpoint::new());

        let sink = Arc::new(MockSink::new());
        sink.fail_sends(4);
        let mut failing = pipeline(&feed, &sink, checkpoint.clone());
        let err = failing.run_until(futures::future::pending()).await.unwrap_err();

        assert!(matches!(err, CdcError::Publish { attempts: 4, .. }));
        assert!(failing.position().is_start());
        assert!(checkpoint.load().await.unwrap().is_start());

        // Restart re-delivers the same record first
        let retry_sink = Arc::new(MockSink::new());
        let mut restarted = pipeline(&feed, &retry_sink, checkpoint);
        run_until_acked(&mut restarted, &retry_sink, 3).await.unwrap();
        assert_eq!(order_ids(&retry_sink.events().await), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped_and_committed() {
        let mut broken = order(2);
        broken.document_key = None;
        let feed = MockFeed::with_records(vec![order(1), broken, order(3)]);
        let sink = Arc::new(MockSink::new());
        let mut pipeline = pipeline(&feed, &sink, Arc::new(MemoryCheckpoint::new()));

        let report = run_until_acked(&mut pipeline, &sink, 2).await.unwrap();

        assert_eq!(order_ids(&sink.events().await), vec![1, 3]);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.captured, 3);
        assert_eq!(report.last_position.token(), Some(&token(3)));
    }

    #[tokio::test]
    async fn test_update_and_delete_shapes_on_the_wire() {
        let feed = MockFeed::with_records(vec![
            RawChangeRecord::update(
                ns(),
                42,
                UpdateDelta {
                    updated_fields: Document::new().with("amount", 25.0),
                    removed_fields: vec!["promo_code".into()],
                },
                token(1),
            ),
            RawChangeRecord::delete(ns(), 42, token(2)),
        ]);
        let sink = Arc::new(MockSink::new());
        let mut pipeline = pipeline(&feed, &sink, Arc::new(MemoryCheckpoint::new()));
        run_until_acked(&mut pipeline, &sink, 2).await.unwrap();

        let messages = sink.messages().await;
        let update: serde_json::Value = serde_json::from_slice(&messages[0].payload).unwrap();
        assert_eq!(update["operation"], "update");
        assert_eq!(update["document_key"], "42");
        assert_eq!(update["payload"]["updated_fields"]["amount"], 25.0);
        assert_eq!(update["payload"]["removed_fields"], serde_json::json!(["promo_code"]));

        let delete: serde_json::Value = serde_json::from_slice(&messages[1].payload).unwrap();
        assert_eq!(delete["operation"], "delete");
        assert!(delete.get("payload").is_none());
        assert_eq!(messages[1].key, "42");
    }

    #[tokio::test]
    async fn test_reconnect_mid_stream_keeps_order() {
        let feed = MockFeed::with_records((1..=6).map(order));
        feed.disconnect_at(3);
        let sink = Arc::new(MockSink::new());
        let mut pipeline = pipeline(&feed, &sink, Arc::new(MemoryCheckpoint::new()));

        run_until_acked(&mut pipeline, &sink, 6).await.unwrap();

        assert_eq!(order_ids(&sink.events().await), (1..=6).collect::<Vec<_>>());
        assert_eq!(feed.subscriptions(), vec![None, Some(token(3))]);
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_is_clean() {
        let feed = MockFeed::with_records((1..=2).map(order));
        let sink = Arc::new(MockSink::new());
        let mut pipeline = pipeline(&feed, &sink, Arc::new(MemoryCheckpoint::new()));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let waiter = sink.clone();
        let stopper = tokio::spawn(async move {
            waiter.wait_for(2).await;
            // Feed is now idle; the pipeline is blocked in take()
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = stop_tx.send(());
        });

        let report = pipeline
            .run_until(async move {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
        stopper.await.unwrap();

        assert_eq!(report.published, 2);
        assert!(!feed.is_connected());
    }

    #[tokio::test]
    async fn test_file_checkpoint_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("etl_db.orders.checkpoint.json");
        let feed = MockFeed::with_records((1..=5).map(order));

        let sink = Arc::new(MockSink::new());
        let mut first = pipeline(&feed, &sink, Arc::new(FileCheckpoint::new(&path)));
        run_until_acked(&mut first, &sink, 5).await.unwrap();

        feed.push(order(6));
        let next_sink = Arc::new(MockSink::new());
        let mut second = pipeline(&feed, &next_sink, Arc::new(FileCheckpoint::new(&path)));
        run_until_acked(&mut second, &next_sink, 1).await.unwrap();

        assert_eq!(order_ids(&next_sink.events().await), vec![6]);
    }

    #[tokio::test]
    async fn test_configured_start_token_used_without_checkpoint() {
        let feed = MockFeed::with_records((1..=4).map(order));
        let sink = Arc::new(MockSink::new());
        let mut config = RelayConfig::default();
        config.feed.start_after = Some("t2".into());

        let mut pipeline = Pipeline::new(ns(), Arc::new(feed.clone()), sink.clone(), &config)
            .with_sleeper(Arc::new(RecordingSleeper::new()));
        let waiter = sink.clone();
        pipeline
            .run_until(async move { waiter.wait_for(2).await })
            .await
            .unwrap();

        assert_eq!(order_ids(&sink.events().await), vec![3, 4]);
    }
}
