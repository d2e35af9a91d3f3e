//! Observability infrastructure for dispatch operations.
//!
//! Provides logging setup, metrics, and timing support.

mod logging;

pub use logging::{LogFormat, LogLevel, LoggingConfig};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Dispatch metrics collector.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    /// Dispatch passes run.
    pub dispatch_passes: AtomicU64,
    /// Messages accepted by the relay.
    pub messages_delivered: AtomicU64,
    /// Individual failed sends.
    pub send_failures: AtomicU64,
    /// Attempts handed to the retry scheduler.
    pub retries_scheduled: AtomicU64,
    /// Attempts that ran out of retries.
    pub messages_exhausted: AtomicU64,
    /// Malformed attempts refused before any I/O.
    pub messages_rejected: AtomicU64,
    /// Attempts the scheduler refused to take.
    pub messages_unscheduled: AtomicU64,
    /// Total connection attempts.
    pub connection_attempts: AtomicU64,
    /// Successful connections.
    pub connections_successful: AtomicU64,
    /// Failed connections.
    pub connections_failed: AtomicU64,
    /// Total authentication attempts.
    pub auth_attempts: AtomicU64,
    /// Successful authentications.
    pub auth_successful: AtomicU64,
    /// Failed authentications.
    pub auth_failed: AtomicU64,
    /// TLS upgrades.
    pub tls_upgrades: AtomicU64,
}

impl DispatchMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a dispatch pass.
    pub fn record_pass(&self) {
        self.dispatch_passes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a delivered message.
    pub fn record_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed send.
    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records attempts handed to the scheduler.
    pub fn record_scheduled(&self, count: usize) {
        self.retries_scheduled.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Records exhausted attempts.
    pub fn record_exhausted(&self, count: usize) {
        self.messages_exhausted.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Records malformed attempts.
    pub fn record_rejected(&self, count: usize) {
        self.messages_rejected.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Records attempts the scheduler refused.
    pub fn record_unscheduled(&self, count: usize) {
        self.messages_unscheduled.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Records a connection attempt.
    pub fn record_connection_attempt(&self, success: bool) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            self.connections_successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.connections_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records an authentication attempt.
    pub fn record_auth_attempt(&self, success: bool) {
        self.auth_attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            self.auth_successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.auth_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a TLS upgrade.
    pub fn record_tls_upgrade(&self) {
        self.tls_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatch_passes: self.dispatch_passes.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            messages_exhausted: self.messages_exhausted.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            messages_unscheduled: self.messages_unscheduled.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connections_successful: self.connections_successful.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            auth_attempts: self.auth_attempts.load(Ordering::Relaxed),
            auth_successful: self.auth_successful.load(Ordering::Relaxed),
            auth_failed: self.auth_failed.load(Ordering::Relaxed),
            tls_upgrades: self.tls_upgrades.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Dispatch passes run.
    pub dispatch_passes: u64,
    /// Messages accepted by the relay.
    pub messages_delivered: u64,
    /// Individual failed sends.
    pub send_failures: u64,
    /// Attempts handed to the retry scheduler.
    pub retries_scheduled: u64,
    /// Attempts that ran out of retries.
    pub messages_exhausted: u64,
    /// Malformed attempts refused before any I/O.
    pub messages_rejected: u64,
    /// Attempts the scheduler refused to take.
    pub messages_unscheduled: u64,
    /// Total connection attempts.
    pub connection_attempts: u64,
    /// Successful connections.
    pub connections_successful: u64,
    /// Failed connections.
    pub connections_failed: u64,
    /// Total authentication attempts.
    pub auth_attempts: u64,
    /// Successful authentications.
    pub auth_successful: u64,
    /// Failed authentications.
    pub auth_failed: u64,
    /// TLS upgrades.
    pub tls_upgrades: u64,
}

impl MetricsSnapshot {
    /// Share of send attempts that reached the relay successfully.
    pub fn delivery_rate(&self) -> f64 {
        let total = self.messages_delivered + self.send_failures;
        if total == 0 {
            1.0
        } else {
            self.messages_delivered as f64 / total as f64
        }
    }

    /// Returns the connection success rate.
    pub fn connection_success_rate(&self) -> f64 {
        if self.connection_attempts == 0 {
            1.0
        } else {
            self.connections_successful as f64 / self.connection_attempts as f64
        }
    }
}

/// Timer for measuring operation duration.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    /// Creates and starts a new timer.
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Returns the elapsed time.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stops the timer and returns the duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();

        tracing::debug!(
            timer = self.name,
            duration_ms = elapsed.as_millis() as u64,
            "Timer stopped"
        );

        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let metrics = DispatchMetrics::new();

        metrics.record_delivered();
        metrics.record_delivered();
        metrics.record_send_failure();
        metrics.record_scheduled(3);
        metrics.record_exhausted(1);
        metrics.record_connection_attempt(true);
        metrics.record_connection_attempt(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_delivered, 2);
        assert_eq!(snapshot.send_failures, 1);
        assert_eq!(snapshot.retries_scheduled, 3);
        assert_eq!(snapshot.messages_exhausted, 1);
        assert!((snapshot.delivery_rate() - 0.666).abs() < 0.01);
        assert!((snapshot.connection_success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_snapshot_rates() {
        let snapshot = MetricsSnapshot::default();
        assert_eq!(snapshot.delivery_rate(), 1.0);
        assert_eq!(snapshot.connection_success_rate(), 1.0);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start("test");
        std::thread::sleep(Duration::from_millis(10));
        let duration = timer.stop();
        assert!(duration >= Duration::from_millis(10));
    }
}
