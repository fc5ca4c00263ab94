//! Feed subscriber
//!
//! Owns the change feed connection and the committed resume position of one
//! namespace. Consumption is two-phase: [`FeedSubscriber::take`] hands out a
//! record without advancing, [`FeedSubscriber::commit`] advances once the
//! record has been durably published. Any reconnect resubscribes from the
//! committed position, so taken-but-uncommitted records are seen again.

use cdc_core::prelude::*;
use cdc_core::{
    with_timeout, ConnectionState, ConnectionTracker, FeedConfig, RetryError, RetryPolicy, Sleeper,
    TokioSleeper,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const COMPONENT: &str = "feed";

/// Resumable subscription to one namespace of a change feed
pub struct FeedSubscriber<F: ChangeFeed + ?Sized> {
    feed: Arc<F>,
    namespace: Namespace,
    retry: RetryPolicy,
    connect_timeout: Duration,
    sleeper: Arc<dyn Sleeper>,
    tracker: ConnectionTracker,
    position: ResumePosition,
    stream: Option<RecordStream>,
    /// Token of the last record taken but not yet committed
    pending: Option<ResumeToken>,
    /// Streams lost since the last delivered data change
    lost_streams: u32,
}

impl<F: ChangeFeed + ?Sized> FeedSubscriber<F> {
    pub fn new(feed: Arc<F>, namespace: Namespace, config: &FeedConfig) -> Self {
        Self {
            feed,
            namespace,
            retry: RetryPolicy::from(&config.connect_retry),
            connect_timeout: config.server_selection_timeout + config.connect_timeout,
            sleeper: Arc::new(TokioSleeper),
            tracker: ConnectionTracker::new(COMPONENT),
            position: ResumePosition::start(),
            stream: None,
            pending: None,
            lost_streams: 0,
        }
    }

    /// Use a custom sleeper for retry delays
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Override the connection retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the position the first subscription starts after
    ///
    /// Only meaningful before the first `subscribe`.
    pub fn set_position(&mut self, position: ResumePosition) {
        self.position = position;
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Last committed position
    pub fn position(&self) -> &ResumePosition {
        &self.position
    }

    pub fn state(&self) -> ConnectionState {
        self.tracker.state()
    }

    pub fn feed(&self) -> &Arc<F> {
        &self.feed
    }

    /// Connect with the bounded retry budget
    ///
    /// Each attempt performs the feed's liveness check. An exhausted budget
    /// leaves the subscriber `Failed` and returns `FatalConnection`.
    pub async fn connect(&mut self) -> Result<()> {
        self.tracker.transition(ConnectionState::Connecting);

        let feed = &self.feed;
        let tracker = &self.tracker;
        let timeout = self.connect_timeout;
        let result = self
            .retry
            .run(self.sleeper.as_ref(), "feed.connect", |attempt| {
                tracker.record_attempt();
                debug!(attempt, "Connecting to change feed");
                with_timeout("feed connect", timeout, feed.connect())
            })
            .await;

        match result {
            Ok(()) => {
                self.tracker.transition(ConnectionState::Connected);
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Open the subscription after the committed position
    ///
    /// A transient failure here goes through the reconnect path. A position
    /// the feed can no longer serve fails with `ResumeGap`.
    pub async fn subscribe(&mut self) -> Result<()> {
        if !self.tracker.is_connected() {
            self.connect().await?;
        }

        let opened = self
            .feed
            .subscribe(&self.namespace, self.position.token())
            .await;

        match opened {
            Ok(stream) => {
                info!(
                    namespace = %self.namespace,
                    position = %self.position,
                    "Subscribed to change feed"
                );
                self.stream = Some(stream);
                self.pending = None;
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                warn!(namespace = %self.namespace, error = %e, "Subscribe failed, reconnecting");
                self.reconnect().await
            }
            Err(e) => Err(self.fail_fatal(e)),
        }
    }

    /// Next data change after the last taken record
    ///
    /// Blocks until a record arrives. Structural records are discarded here.
    /// Connection loss, including a stream that simply ends, triggers a
    /// reconnect from the committed position. Streams lost without delivering
    /// a data change draw on the connect budget, with its delay in between;
    /// running out is `FatalConnection`.
    pub async fn take(&mut self) -> Result<RawChangeRecord> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                self.reconnect().await?;
                continue;
            };

            match stream.next().await {
                Some(Ok(record)) if !record.operation.is_data_change() => {
                    debug!(
                        namespace = %self.namespace,
                        operation = %record.operation,
                        "Discarding structural change"
                    );
                }
                Some(Ok(record)) => {
                    self.lost_streams = 0;
                    self.pending = Some(record.resume_token.clone());
                    return Ok(record);
                }
                Some(Err(e)) if e.is_retryable() => self.stream_lost(e).await?,
                Some(Err(e)) => return Err(self.fail_fatal(e)),
                None => {
                    let ended = CdcError::transient(COMPONENT, "change stream ended");
                    self.stream_lost(ended).await?;
                }
            }
        }
    }

    /// Advance the committed position past `token`
    ///
    /// Called by the driver only after the record is durably published (or
    /// deliberately skipped).
    pub fn commit(&mut self, token: ResumeToken) {
        if self.pending.as_ref() == Some(&token) {
            self.pending = None;
        }
        debug!(namespace = %self.namespace, token = %token, "Committed resume position");
        self.position.advance(token);
    }

    /// Drop the subscription and close the feed connection
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream = None;
        if let Some(token) = self.pending.take() {
            debug!(token = %token, "Dropping uncommitted record");
        }
        let closed = self.feed.close().await;
        self.tracker.release();
        info!(namespace = %self.namespace, position = %self.position, "Feed subscriber closed");
        closed
    }

    async fn stream_lost(&mut self, cause: CdcError) -> Result<()> {
        self.stream = None;
        self.lost_streams += 1;
        if !self.retry.should_retry(self.lost_streams) {
            return Err(self.fail(RetryError {
                attempts: self.lost_streams,
                exhausted: true,
                last: cause,
            }));
        }

        let delay = self.retry.delay(self.lost_streams);
        warn!(
            namespace = %self.namespace,
            lost = self.lost_streams,
            delay_ms = delay.as_millis() as u64,
            error = %cause,
            "Change stream lost, reconnecting"
        );
        self.sleeper.sleep(delay).await;
        Ok(())
    }

    /// Reconnect and resubscribe from the committed position
    async fn reconnect(&mut self) -> Result<()> {
        self.stream = None;
        self.pending = None;
        self.tracker.transition(ConnectionState::Connecting);

        let feed = &self.feed;
        let tracker = &self.tracker;
        let namespace = &self.namespace;
        let token = self.position.token();
        let timeout = self.connect_timeout;
        let result = self
            .retry
            .run(self.sleeper.as_ref(), "feed.reconnect", |attempt| {
                tracker.record_attempt();
                debug!(attempt, namespace = %namespace, "Reconnecting to change feed");
                async move {
                    with_timeout("feed connect", timeout, feed.connect()).await?;
                    feed.subscribe(namespace, token).await
                }
            })
            .await;

        match result {
            Ok(stream) => {
                info!(
                    namespace = %self.namespace,
                    position = %self.position,
                    "Resubscribed to change feed"
                );
                self.tracker.transition(ConnectionState::Connected);
                self.stream = Some(stream);
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn fail(&mut self, err: RetryError) -> CdcError {
        if err.exhausted {
            self.tracker.transition(ConnectionState::Failed);
            let fatal = CdcError::FatalConnection {
                component: COMPONENT,
                attempts: err.attempts,
                message: err.last.to_string(),
            };
            error!(
                namespace = %self.namespace,
                attempts = err.attempts,
                error = %err.last,
                "Change feed connection budget exhausted"
            );
            fatal
        } else {
            self.fail_fatal(err.last)
        }
    }

    fn fail_fatal(&mut self, err: CdcError) -> CdcError {
        if matches!(err, CdcError::ResumeGap { .. }) {
            error!(
                namespace = %self.namespace,
                position = %self.position,
                error = %err,
                "Resume position lost upstream"
            );
        }
        self.tracker.transition(ConnectionState::Failed);
        err
    }
}
