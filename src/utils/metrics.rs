//! Observability and Metrics
//!
//! Process-wide counters for connection lifecycle, packet traffic, listener
//! failures and bridge health.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Global metrics collector for protocol operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections established
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Total packets sent
    pub packets_sent: AtomicU64,
    /// Total packets received
    pub packets_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Frames that failed to decode and were dropped
    pub protocol_errors: AtomicU64,
    /// Sends rejected before reaching the transport
    pub send_failures: AtomicU64,
    /// Listener callbacks that returned an error
    pub listener_failures: AtomicU64,
    /// Listener callbacks that panicked
    pub listener_panics: AtomicU64,
    /// Bridge links that reached the connected state
    pub bridge_connects: AtomicU64,
    /// Bridge reconnect attempts fired by the retry timer
    pub bridge_reconnects: AtomicU64,
    /// Bridge sends dropped because the link was down
    pub bridge_dropped_sends: AtomicU64,
    /// Successful shard moves
    pub shard_moves: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            listener_failures: AtomicU64::new(0),
            listener_panics: AtomicU64::new(0),
            bridge_connects: AtomicU64::new(0),
            bridge_reconnects: AtomicU64::new(0),
            bridge_dropped_sends: AtomicU64::new(0),
            shard_moves: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection going inactive
    pub fn connection_closed(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Record a packet sent
    pub fn packet_sent(&self, byte_count: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a packet received
    pub fn packet_received(&self, byte_count: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a dropped inbound frame
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed send
    pub fn send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a listener callback error
    pub fn listener_failure(&self) {
        self.listener_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a listener callback panic
    pub fn listener_panic(&self) {
        self.listener_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bridge link coming up
    pub fn bridge_connected(&self) {
        self.bridge_connects.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bridge retry firing
    pub fn bridge_reconnect(&self) {
        self.bridge_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bridge send dropped while disconnected
    pub fn bridge_dropped_send(&self) {
        self.bridge_dropped_sends.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed shard move
    pub fn shard_move(&self) {
        self.shard_moves.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
            listener_panics: self.listener_panics.load(Ordering::Relaxed),
            bridge_connects: self.bridge_connects.load(Ordering::Relaxed),
            bridge_reconnects: self.bridge_reconnects.load(Ordering::Relaxed),
            bridge_dropped_sends: self.bridge_dropped_sends.load(Ordering::Relaxed),
            shard_moves: self.shard_moves.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            packets_sent = snapshot.packets_sent,
            packets_received = snapshot.packets_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            protocol_errors = snapshot.protocol_errors,
            send_failures = snapshot.send_failures,
            listener_failures = snapshot.listener_failures,
            listener_panics = snapshot.listener_panics,
            bridge_connects = snapshot.bridge_connects,
            bridge_reconnects = snapshot.bridge_reconnects,
            bridge_dropped_sends = snapshot.bridge_dropped_sends,
            shard_moves = snapshot.shard_moves,
            uptime_seconds = snapshot.uptime_seconds,
            "Protocol metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub protocol_errors: u64,
    pub send_failures: u64,
    pub listener_failures: u64,
    pub listener_panics: u64,
    pub bridge_connects: u64,
    pub bridge_reconnects: u64,
    pub bridge_dropped_sends: u64,
    pub shard_moves: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Logs the elapsed time of an operation when dropped
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
