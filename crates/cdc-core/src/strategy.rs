//! Strategy Pattern Traits for the CDC relay
//!
//! The pipeline talks to its two external systems only through these traits,
//! so the change feed and the message log can be swapped without touching the
//! driver.
//!
//! ## Strategy Hierarchy
//!
//! ```text
//! HealthCheck
//!     │
//!     ├── ChangeFeed (produces raw change records)
//!     │       └── MongoChangeFeed, MockFeed
//!     │
//!     └── EventSink (durably appends serialized events)
//!             └── NatsJetStreamSink, KafkaSink, MockSink
//! ```
//!
//! Implementations perform exactly one attempt per call. Retry budgets,
//! timeouts and connection state live in the subscriber and publisher that
//! wrap them.

use crate::error::Result;
use crate::message::{AckMetadata, Namespace, RawChangeRecord, ResumeToken};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// Type alias for boxed async streams of raw change records
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<RawChangeRecord>> + Send>>;

/// Health check capability
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Perform health check
    ///
    /// Returns Ok(()) if healthy, Err with details if not.
    async fn health_check(&self) -> Result<()>;

    /// Get component name for health reporting
    fn component_name(&self) -> &'static str;
}

/// Change feed strategy - source of raw change records
#[async_trait]
pub trait ChangeFeed: HealthCheck {
    /// Open the connection and verify liveness
    ///
    /// Failures that may resolve on retry are reported as
    /// `CdcError::TransientConnection`.
    async fn connect(&self) -> Result<()>;

    /// Open a subscription on `namespace`
    ///
    /// With `resume_after` set, the stream starts strictly after that token.
    /// A token outside the feed's retention window yields
    /// `CdcError::ResumeGap`, either here or as the first stream item. The
    /// stream blocks while no changes arrive and ends or errors when the
    /// connection is lost.
    async fn subscribe(
        &self,
        namespace: &Namespace,
        resume_after: Option<&ResumeToken>,
    ) -> Result<RecordStream>;

    /// Release the connection
    async fn close(&self) -> Result<()>;
}

/// Event sink strategy - durable append-only log
#[async_trait]
pub trait EventSink: HealthCheck {
    /// Open the connection and verify liveness
    async fn connect(&self) -> Result<()>;

    /// Append one payload and wait for the durability acknowledgment
    ///
    /// `key` identifies the changed document; transports that partition by
    /// key use it to keep a document's events on one partition.
    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<AckMetadata>;

    /// Wait for all outstanding sends to complete
    async fn flush(&self) -> Result<()>;

    /// Release the connection
    async fn close(&self) -> Result<()>;
}
