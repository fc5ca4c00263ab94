//! Error types for the CDC relay
//!
//! Uses `thiserror` for ergonomic error handling with full context preservation.
//! Every variant maps onto one of the pipeline's failure classes: transient
//! faults are absorbed by retry policies, everything else reaches the driver.

use std::fmt;
use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, CdcError>;

/// Primary error type for all relay operations
#[derive(Error, Debug)]
pub enum CdcError {
    /// Network blip or broken connection; retried with a bounded budget
    #[error("Transient connection error ({component}): {message}")]
    TransientConnection {
        component: &'static str,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection retry budget exhausted
    #[error("Connection to {component} failed after {attempts} attempts: {message}")]
    FatalConnection {
        component: &'static str,
        attempts: u32,
        message: String,
    },

    /// Raw change record violates the normalizer's required-field contract
    #[error("Malformed change record: {message}")]
    MalformedRecord { message: String },

    /// Requested resume position is no longer retrievable upstream
    #[error("Resume gap: {message}")]
    ResumeGap {
        message: String,
        token: Option<String>,
    },

    /// Broker rejected or failed to durably store an event
    #[error("Publish to {topic} failed after {attempts} attempts: {message}")]
    Publish {
        topic: String,
        attempts: u32,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Message serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Checkpoint persistence errors
    #[error("Checkpoint error: {message}")]
    Checkpoint {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation timeout
    #[error("Timeout: {operation} exceeded {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Graceful shutdown requested
    #[error("Shutdown requested")]
    Shutdown,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CdcError {
    /// Create a transient connection error
    pub fn transient(component: &'static str, message: impl Into<String>) -> Self {
        Self::TransientConnection {
            component,
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient connection error with source
    pub fn transient_with_source(
        component: &'static str,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransientConnection {
            component,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a malformed record error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRecord {
            message: message.into(),
        }
    }

    /// Create a resume gap error
    pub fn resume_gap(message: impl Into<String>, token: Option<String>) -> Self {
        Self::ResumeGap {
            message: message.into(),
            token,
        }
    }

    /// Create a serialization error with source
    pub fn serialization(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a checkpoint error with source
    pub fn checkpoint(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientConnection { .. } | Self::Timeout { .. })
    }

    /// Check if error must stop the pipeline
    ///
    /// Malformed records are skipped by the driver, and a shutdown request is
    /// a clean exit. Everything else that reaches the driver halts it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::MalformedRecord { .. } | Self::Shutdown) && !self.is_retryable()
    }

    /// Stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientConnection { .. } => "transient_connection",
            Self::FatalConnection { .. } => "fatal_connection",
            Self::MalformedRecord { .. } => "malformed_record",
            Self::ResumeGap { .. } => "resume_gap",
            Self::Publish { .. } => "publish",
            Self::Serialization { .. } => "serialization",
            Self::Configuration { .. } => "configuration",
            Self::Checkpoint { .. } => "checkpoint",
            Self::Timeout { .. } => "timeout",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }

    /// Process exit status for a supervisor to act on
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Shutdown => 0,
            Self::FatalConnection { .. } => 2,
            Self::ResumeGap { .. } => 3,
            Self::Publish { .. } => 4,
            Self::Configuration { .. } => 5,
            Self::Checkpoint { .. } => 6,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for CdcError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("JSON encoding failed", err)
    }
}

impl From<config::ConfigError> for CdcError {
    fn from(err: config::ConfigError) -> Self {
        Self::config(err.to_string())
    }
}

/// Error context for enhanced debugging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: &'static str,
    pub operation: String,
    pub namespace: Option<String>,
    pub document_key: Option<String>,
    pub resume_token: Option<String>,
}

impl ErrorContext {
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        Self {
            component,
            operation: operation.into(),
            namespace: None,
            document_key: None,
            resume_token: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl fmt::Display) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn with_document_key(mut self, key: impl Into<String>) -> Self {
        self.document_key = Some(key.into());
        self
    }

    pub fn with_resume_token(mut self, token: impl Into<String>) -> Self {
        self.resume_token = Some(token.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}::{}]", self.component, self.operation)?;
        if let Some(ref ns) = self.namespace {
            write!(f, " ns={}", ns)?;
        }
        if let Some(ref key) = self.document_key {
            write!(f, " key={}", key)?;
        }
        if let Some(ref token) = self.resume_token {
            write!(f, " token={}", token)?;
        }
        Ok(())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContextExt<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T>;
}

impl<T> ErrorContextExt<T> for Result<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T> {
        self.map_err(|e| {
            tracing::error!(
                error = %e,
                kind = e.kind(),
                component = ctx.component,
                operation = %ctx.operation,
                namespace = ?ctx.namespace,
                document_key = ?ctx.document_key,
                resume_token = ?ctx.resume_token,
                "Operation failed"
            );
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_for_fatal_kinds() {
        let fatal = [
            CdcError::FatalConnection {
                component: "feed",
                attempts: 10,
                message: "refused".into(),
            },
            CdcError::resume_gap("history lost", None),
            CdcError::Publish {
                topic: "orders-cdc".into(),
                attempts: 3,
                message: "not enough replicas".into(),
                source: None,
            },
            CdcError::config("missing topic"),
        ];

        let mut codes: Vec<i32> = fatal.iter().map(CdcError::exit_code).collect();
        assert!(codes.iter().all(|c| *c > 1));
        codes.dedup();
        assert_eq!(codes.len(), fatal.len());
    }

    #[test]
    fn test_classification() {
        assert!(CdcError::transient("feed", "reset").is_retryable());
        assert!(CdcError::timeout("publish", 10_000).is_retryable());
        assert!(!CdcError::malformed("no _id").is_retryable());
        assert!(!CdcError::malformed("no _id").is_fatal());
        assert!(CdcError::resume_gap("gone", Some("abc".into())).is_fatal());
        assert!(!CdcError::Shutdown.is_fatal());
        assert_eq!(CdcError::Shutdown.exit_code(), 0);
    }

    #[test]
    fn test_context_display() {
        let ctx = ErrorContext::new("publisher", "publish")
            .with_namespace("etl_db.orders")
            .with_document_key("42");
        assert_eq!(ctx.to_string(), "[publisher::publish] ns=etl_db.orders key=42");
    }
}
