//! # CDC Core
//!
//! Core types, normalization and strategy traits for the CDC relay.
//!
//! The relay tails a document store's change feed, maps every data change
//! onto a schema-stable [`NormalizedEvent`] and appends it to a durable
//! message log. This crate holds everything that does not touch a network:
//!
//! - Record and event types ([`message`])
//! - The pure normalizer ([`normalize`])
//! - Feed and sink strategy traits ([`strategy`])
//! - Retry policy, connection state, errors, configuration and metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ ChangeFeed  │────►│ Normalizer  │────►│  EventSink  │
//! │  Strategy   │     │   (pure)    │     │  Strategy   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                                       │
//!        └──────── resume position ◄─── ack ─────┘
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod metrics;
pub mod normalize;
pub mod retry;
pub mod strategy;

pub use config::*;
pub use connection::*;
pub use error::*;
pub use message::*;
pub use metrics::*;
pub use normalize::*;
pub use retry::*;
pub use strategy::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::RelayConfig;
    pub use crate::error::{CdcError, Result};
    pub use crate::message::{
        AckMetadata, ChangeKind, ChangePayload, Document, DocValue, Namespace, NormalizedEvent,
        OperationKind, RawChangeRecord, ResumePosition, ResumeToken,
    };
    pub use crate::normalize::Normalizer;
    pub use crate::strategy::{ChangeFeed, EventSink, HealthCheck, RecordStream};
}
