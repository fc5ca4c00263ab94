//! Connection lifecycle state
//!
//! Each pipeline owns one tracker per external system (feed and broker).

use crate::metrics::ConnectionMetrics;
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

/// Connection state of the feed subscriber or the publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retry budget exhausted; terminal
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }

    /// Whether moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Failed, _) => false,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) | (Connecting, Failed) | (Connecting, Disconnected) => true,
            (Connected, Connecting) | (Connected, Disconnected) | (Connected, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State machine wrapper that logs and exports transitions
#[derive(Clone)]
pub struct ConnectionTracker {
    component: &'static str,
    state: ConnectionState,
    metrics: ConnectionMetrics,
}

impl ConnectionTracker {
    pub fn new(component: &'static str) -> Self {
        let metrics = ConnectionMetrics::new(component);
        metrics.set_state(ConnectionState::Disconnected);
        Self {
            component,
            state: ConnectionState::Disconnected,
            metrics,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_failed(&self) -> bool {
        self.state == ConnectionState::Failed
    }

    /// Move to `next`; illegal transitions are logged and ignored
    ///
    /// Returns whether the transition was applied.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            warn!(
                component = self.component,
                from = %self.state,
                to = %next,
                "Ignoring illegal connection state transition"
            );
            return false;
        }

        info!(
            component = self.component,
            from = %self.state,
            to = %next,
            "Connection state changed"
        );
        if next == ConnectionState::Connecting && self.state == ConnectionState::Connected {
            self.metrics.record_reconnect();
        }
        self.metrics.set_state(next);
        self.state = next;
        true
    }

    /// Mark the connection closed on shutdown
    ///
    /// A failed connection stays `Failed`.
    pub fn release(&mut self) {
        if !self.is_failed() {
            self.transition(ConnectionState::Disconnected);
        }
    }

    /// Record one connection attempt
    pub fn record_attempt(&self) {
        self.metrics.record_attempt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_and_reconnect() {
        let mut tracker = ConnectionTracker::new("feed");
        assert_eq!(tracker.state(), ConnectionState::Disconnected);

        assert!(tracker.transition(ConnectionState::Connecting));
        assert!(tracker.transition(ConnectionState::Connected));
        assert!(tracker.is_connected());

        assert!(tracker.transition(ConnectionState::Connecting));
        assert!(tracker.transition(ConnectionState::Connected));
        assert!(tracker.transition(ConnectionState::Disconnected));
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut tracker = ConnectionTracker::new("broker");
        tracker.transition(ConnectionState::Connecting);
        assert!(tracker.transition(ConnectionState::Failed));

        assert!(!tracker.transition(ConnectionState::Connecting));
        assert!(!tracker.transition(ConnectionState::Disconnected));
        assert!(tracker.is_failed());
    }

    #[test]
    fn test_connected_can_fail() {
        let mut tracker = ConnectionTracker::new("feed");
        tracker.transition(ConnectionState::Connecting);
        tracker.transition(ConnectionState::Connected);

        assert!(tracker.transition(ConnectionState::Failed));
        assert!(tracker.is_failed());
    }

    #[test]
    fn test_release_keeps_failed_terminal() {
        let mut tracker = ConnectionTracker::new("broker");
        tracker.transition(ConnectionState::Connecting);
        tracker.transition(ConnectionState::Failed);
        tracker.release();
        assert_eq!(tracker.state(), ConnectionState::Failed);

        let mut tracker = ConnectionTracker::new("broker");
        tracker.transition(ConnectionState::Connecting);
        tracker.transition(ConnectionState::Connected);
        tracker.release();
        assert_eq!(tracker.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_cannot_skip_connecting() {
        let mut tracker = ConnectionTracker::new("feed");
        assert!(!tracker.transition(ConnectionState::Connected));
        assert_eq!(tracker.state(), ConnectionState::Disconnected);
    }
}
