//! Metrics for the CDC relay
//!
//! Provides Prometheus-compatible metrics through the `metrics` facade.

use crate::connection::ConnectionState;
use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Metric names as constants for consistency
pub mod names {
    // Pipeline metrics
    pub const RECORDS_CAPTURED_TOTAL: &str = "cdc_records_captured_total";
    pub const RECORDS_SKIPPED_TOTAL: &str = "cdc_records_skipped_total";
    pub const EVENTS_PUBLISHED_TOTAL: &str = "cdc_events_published_total";
    pub const PUBLISHED_BYTES_TOTAL: &str = "cdc_published_bytes_total";
    pub const PUBLISH_LATENCY: &str = "cdc_publish_latency_seconds";
    pub const PUBLISH_RETRIES_TOTAL: &str = "cdc_publish_retries_total";
    pub const CHECKPOINT_FAILURES_TOTAL: &str = "cdc_checkpoint_failures_total";
    pub const ERRORS_TOTAL: &str = "cdc_errors_total";

    // Connection metrics
    pub const CONNECTION_STATE: &str = "cdc_connection_state";
    pub const CONNECTION_ATTEMPTS: &str = "cdc_connection_attempts_total";
    pub const CONNECTION_RECONNECTS: &str = "cdc_connection_reconnects_total";
}

/// Labels for metrics
pub mod labels {
    pub const NAMESPACE: &str = "namespace";
    pub const OPERATION: &str = "operation";
    pub const ERROR_TYPE: &str = "error_type";
    pub const CONNECTION: &str = "connection";
    pub const DESTINATION: &str = "destination";
    pub const OUTCOME: &str = "outcome";
}

/// Per-namespace pipeline metrics
#[derive(Clone)]
pub struct PipelineMetrics {
    namespace: String,
}

impl PipelineMetrics {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Record a data change taken from the feed
    pub fn record_captured(&self, operation: &str) {
        counter!(
            names::RECORDS_CAPTURED_TOTAL,
            labels::NAMESPACE => self.namespace.clone(),
            labels::OPERATION => operation.to_string(),
        )
        .increment(1);
    }

    /// Record a malformed record that was skipped
    pub fn record_skipped(&self) {
        counter!(
            names::RECORDS_SKIPPED_TOTAL,
            labels::NAMESPACE => self.namespace.clone(),
        )
        .increment(1);
    }

    /// Record an acknowledged publish
    pub fn record_published(&self, destination: &str, bytes: usize) {
        counter!(
            names::EVENTS_PUBLISHED_TOTAL,
            labels::NAMESPACE => self.namespace.clone(),
            labels::DESTINATION => destination.to_string(),
        )
        .increment(1);
        counter!(
            names::PUBLISHED_BYTES_TOTAL,
            labels::NAMESPACE => self.namespace.clone(),
        )
        .increment(bytes as u64);
    }

    /// Start timing one publish, retries included
    pub fn publish_timer(&self) -> PublishTimer {
        PublishTimer {
            metrics: self.clone(),
            started: Instant::now(),
            finished: false,
        }
    }

    /// Record publish latency, including retries
    pub fn record_publish_latency(&self, duration: Duration, outcome: &'static str) {
        histogram!(
            names::PUBLISH_LATENCY,
            labels::NAMESPACE => self.namespace.clone(),
            labels::OUTCOME => outcome,
        )
        .record(duration.as_secs_f64());
    }

    /// Record publish attempts beyond the first
    pub fn record_publish_retries(&self, retries: u32) {
        if retries > 0 {
            counter!(
                names::PUBLISH_RETRIES_TOTAL,
                labels::NAMESPACE => self.namespace.clone(),
            )
            .increment(retries as u64);
        }
    }

    /// Record a failed checkpoint write
    pub fn record_checkpoint_failure(&self) {
        counter!(
            names::CHECKPOINT_FAILURES_TOTAL,
            labels::NAMESPACE => self.namespace.clone(),
        )
        .increment(1);
    }

    /// Record an error
    pub fn record_error(&self, error_type: &str) {
        counter!(
            names::ERRORS_TOTAL,
            labels::NAMESPACE => self.namespace.clone(),
            labels::ERROR_TYPE => error_type.to_string(),
        )
        .increment(1);
    }
}

/// Connection metrics, labelled by component
#[derive(Clone)]
pub struct ConnectionMetrics {
    component: &'static str,
}

impl ConnectionMetrics {
    pub fn new(component: &'static str) -> Self {
        Self { component }
    }

    /// Export the current state as a gauge
    ///
    /// 0 = disconnected, 1 = connecting, 2 = connected, 3 = failed.
    pub fn set_state(&self, state: ConnectionState) {
        let code = match state {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Connected => 2.0,
            ConnectionState::Failed => 3.0,
        };
        gauge!(names::CONNECTION_STATE, labels::CONNECTION => self.component).set(code);
    }

    pub fn record_attempt(&self) {
        counter!(names::CONNECTION_ATTEMPTS, labels::CONNECTION => self.component).increment(1);
    }

    /// A connected component went back to connecting
    pub fn record_reconnect(&self) {
        counter!(names::CONNECTION_RECONNECTS, labels::CONNECTION => self.component).increment(1);
    }
}

/// Publish latency guard
///
/// Records into the publish-latency histogram exactly once: with the outcome
/// given to [`PublishTimer::finish`], or as `cancelled` when dropped before.
pub struct PublishTimer {
    metrics: PipelineMetrics,
    started: Instant,
    finished: bool,
}

impl PublishTimer {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record the latency of a completed publish
    pub fn finish(mut self, outcome: &'static str) -> Duration {
        self.finished = true;
        let elapsed = self.started.elapsed();
        self.metrics.record_publish_latency(elapsed, outcome);
        elapsed
    }
}

impl Drop for PublishTimer {
    fn drop(&mut self) {
        if !self.finished {
            self.metrics
                .record_publish_latency(self.started.elapsed(), "cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_timer_finish_reports_elapsed() {
        let metrics = PipelineMetrics::new("etl_db.orders");
        let timer = metrics.publish_timer();
        std::thread::sleep(Duration::from_millis(5));
        let elapsed = timer.finish("acked");
        assert!(elapsed >= Duration::from_millis(5));
    }

    #[test]
    fn test_publish_timer_dropped_without_recorder() {
        // No recorder installed; recording is a no-op and must not panic
        let metrics = PipelineMetrics::new("etl_db.orders");
        let timer = metrics.publish_timer();
        assert!(timer.elapsed() < Duration::from_secs(1));
        drop(timer);
        metrics.record_checkpoint_failure();
    }
}
