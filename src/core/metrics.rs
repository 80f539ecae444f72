use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use hdrhistogram::Histogram;
use tokio::time::Instant;

use super::types::ConnectionError;

const MAX_RECENT_ERRORS: usize = 32;
const MAX_ERROR_TEXT_BYTES: usize = 1024;

fn truncate_string(s: &str) -> String {
    if s.len() <= MAX_ERROR_TEXT_BYTES {
        return s.to_string();
    }

    let mut end = MAX_ERROR_TEXT_BYTES;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[inline]
fn as_millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

/// Read-only metrics snapshot handed to consumers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionMetrics {
    /// Round trip of the most recent heartbeat.
    pub latency_ms: u64,
    /// Time the most recent `connect()` took from attempt start to ack. Automatic
    /// reconnects do not overwrite it.
    pub connection_time_ms: u64,
    pub reconnection_count: u64,
    /// Automatic reconnects that reached `Connected`.
    pub reconnections_completed: u64,
    pub total_events: u64,
    pub is_connected: bool,
    pub last_heartbeat: Option<SystemTime>,
    pub connections: u64,
    pub heartbeats: u64,
    pub errors: u64,
    pub recent_errors: usize,
    pub p50_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub latency_samples: u64,
    /// Age of the current connection; zero while not connected.
    pub uptime: Duration,
}

/// Accumulates connection counters without interior mutability.
///
/// Each recording method maps to exactly one transport-level occurrence so nothing is
/// counted twice across components.
#[derive(Debug)]
pub struct MetricsCollector {
    latency_ms: u64,
    connection_time_ms: u64,
    reconnection_count: u64,
    reconnections_completed: u64,
    total_events: u64,
    connections: u64,
    heartbeats: u64,
    errors: u64,
    last_heartbeat: Option<SystemTime>,
    connected_since: Option<Instant>,
    recent_errors: VecDeque<ConnectionError>,
    latency_histogram: Histogram<u64>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            latency_ms: 0,
            connection_time_ms: 0,
            reconnection_count: 0,
            reconnections_completed: 0,
            total_events: 0,
            connections: 0,
            heartbeats: 0,
            errors: 0,
            last_heartbeat: None,
            connected_since: None,
            recent_errors: VecDeque::with_capacity(MAX_RECENT_ERRORS),
            latency_histogram: Histogram::new_with_bounds(1, 3_600_000, 3)
                .expect("histogram bounds are valid"),
        }
    }

    /// Explicit reset; the live connection status is preserved.
    pub fn reset(&mut self) {
        let connected_since = self.connected_since;
        *self = Self::new();
        self.connected_since = connected_since;
    }

    /// A `connect()`-initiated attempt reached `Connected`.
    pub fn record_connected(&mut self, handshake: Duration) {
        self.connections = self.connections.saturating_add(1);
        self.connection_time_ms = as_millis(handshake);
        self.connected_since = Some(Instant::now());
    }

    /// A scheduled retry reached `Connected`; already counted by
    /// `record_reconnect_scheduled`, so the connection sample stays untouched.
    pub fn record_reconnected(&mut self) {
        self.reconnections_completed = self.reconnections_completed.saturating_add(1);
        self.connected_since = Some(Instant::now());
    }

    pub fn record_disconnected(&mut self) {
        self.connected_since = None;
    }

    pub fn record_reconnect_scheduled(&mut self) {
        self.reconnection_count = self.reconnection_count.saturating_add(1);
    }

    pub fn record_event(&mut self) {
        self.total_events = self.total_events.saturating_add(1);
    }

    pub fn record_heartbeat(&mut self, latency: Duration) {
        let millis = as_millis(latency);
        self.heartbeats = self.heartbeats.saturating_add(1);
        self.latency_ms = millis;
        self.last_heartbeat = Some(SystemTime::now());
        self.latency_histogram.saturating_record(millis.max(1));
    }

    pub fn record_error(&mut self, error: &ConnectionError) {
        self.errors = self.errors.saturating_add(1);
        if self.recent_errors.len() == MAX_RECENT_ERRORS {
            self.recent_errors.pop_front();
        }
        let mut stored = error.clone();
        stored.message = truncate_string(&error.message);
        self.recent_errors.push_back(stored);
    }

    pub fn recent_errors(&self) -> impl Iterator<Item = &ConnectionError> {
        self.recent_errors.iter()
    }

    pub fn snapshot(&self) -> ConnectionMetrics {
        let latency_samples = self.latency_histogram.len();
        let (p50, p99) = if latency_samples == 0 {
            (0, 0)
        } else {
            (
                self.latency_histogram.value_at_quantile(0.50),
                self.latency_histogram.value_at_quantile(0.99),
            )
        };

        ConnectionMetrics {
            latency_ms: self.latency_ms,
            connection_time_ms: self.connection_time_ms,
            reconnection_count: self.reconnection_count,
            reconnections_completed: self.reconnections_completed,
            total_events: self.total_events,
            is_connected: self.connected_since.is_some(),
            last_heartbeat: self.last_heartbeat,
            connections: self.connections,
            heartbeats: self.heartbeats,
            errors: self.errors,
            recent_errors: self.recent_errors.len(),
            p50_latency_ms: p50,
            p99_latency_ms: p99,
            latency_samples,
            uptime: self
                .connected_since
                .map(|since| since.elapsed())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ErrorKind;

    #[test]
    fn records_heartbeat_latency_and_percentiles() {
        let mut metrics = MetricsCollector::new();
        metrics.record_heartbeat(Duration::from_millis(10));
        metrics.record_heartbeat(Duration::from_millis(20));
        metrics.record_heartbeat(Duration::from_millis(30));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.latency_ms, 30);
        assert_eq!(snapshot.heartbeats, 3);
        assert_eq!(snapshot.latency_samples, 3);
        assert_eq!(snapshot.p50_latency_ms, 20);
        assert_eq!(snapshot.p99_latency_ms, 30);
        assert!(snapshot.last_heartbeat.is_some());
    }

    #[test]
    fn reconnects_do_not_count_as_connection_samples() {
        let mut metrics = MetricsCollector::new();
        metrics.record_connected(Duration::from_millis(120));
        metrics.record_disconnected();
        metrics.record_reconnect_scheduled();
        metrics.record_reconnect_scheduled();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections, 1);
        assert_eq!(snapshot.reconnection_count, 2);
        assert_eq!(snapshot.connection_time_ms, 120);
        assert!(!snapshot.is_connected);

        metrics.record_reconnected();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections, 1);
        assert_eq!(snapshot.reconnection_count, 2);
        assert_eq!(snapshot.reconnections_completed, 1);
        assert_eq!(snapshot.connection_time_ms, 120);
        assert!(snapshot.is_connected);

        metrics.record_disconnected();
        metrics.record_connected(Duration::from_millis(45));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections, 2);
        assert_eq!(snapshot.connection_time_ms, 45);
    }

    #[test]
    fn error_ring_is_bounded_and_truncated() {
        let mut metrics = MetricsCollector::new();
        for i in 0..40 {
            metrics.record_error(&ConnectionError::new(
                ErrorKind::Connection,
                format!("error-{i}"),
                true,
            ));
        }
        assert_eq!(metrics.snapshot().errors, 40);
        assert_eq!(metrics.snapshot().recent_errors, MAX_RECENT_ERRORS);
        assert_eq!(
            metrics.recent_errors().next().map(|e| e.message.as_str()),
            Some("error-8")
        );

        let huge = "x".repeat(MAX_ERROR_TEXT_BYTES + 10);
        metrics.record_error(&ConnectionError::new(ErrorKind::Server, huge, false));
        assert_eq!(
            metrics.recent_errors().last().map(|e| e.message.len()),
            Some(MAX_ERROR_TEXT_BYTES)
        );
    }

    #[test]
    fn reset_clears_counters_but_keeps_live_status() {
        let mut metrics = MetricsCollector::new();
        metrics.record_connected(Duration::from_millis(5));
        metrics.record_event();
        metrics.record_reconnect_scheduled();

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_events, 0);
        assert_eq!(snapshot.reconnection_count, 0);
        assert!(snapshot.is_connected);
    }
}
