//! Reliability bookkeeping: error counters, operation stats, retry policy
//! and health-check scheduling.
//!
//! [`ReliabilityMonitor`] is plain data with no I/O. The device context owns
//! it behind a mutex shared with the transport; the health check itself
//! lives on [`JensenDevice`](crate::jensen::JensenDevice) because it needs
//! the transport.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;

use crate::protocol::{HEALTH_CHECK_INTERVAL, MAX_ERROR_THRESHOLD, MAX_RETRY_ATTEMPTS};

/// Classified failure categories with a counter each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    UsbTimeout,
    UsbPipeError,
    ConnectionLost,
    ProtocolError,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 4] = [
        ErrorCategory::UsbTimeout,
        ErrorCategory::UsbPipeError,
        ErrorCategory::ConnectionLost,
        ErrorCategory::ProtocolError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::UsbTimeout => "usb_timeout",
            ErrorCategory::UsbPipeError => "usb_pipe_error",
            ErrorCategory::ConnectionLost => "connection_lost",
            ErrorCategory::ProtocolError => "protocol_error",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits consulted by [`ReliabilityMonitor::should_retry_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retry_attempts: u32,
    pub max_error_threshold: u64,
    pub health_check_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_attempts: MAX_RETRY_ATTEMPTS,
            max_error_threshold: MAX_ERROR_THRESHOLD,
            health_check_interval: HEALTH_CHECK_INTERVAL,
        }
    }
}

/// Transport counters. Monotonic between connections.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationStats {
    pub commands_sent: u64,
    pub responses_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// How long the last successful connection took to establish.
    pub connection_time: Option<Duration>,
    pub connected_at: Option<SystemTime>,
    pub last_operation: Option<SystemTime>,
}

impl OperationStats {
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }
}

/// Owned snapshot returned to callers. Mutating it never affects the monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub error_counts: BTreeMap<ErrorCategory, u64>,
    pub retry_count: u32,
    pub retry_permitted: bool,
    pub operations: OperationStats,
}

/// Outcome of asking to start a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckStart {
    /// The interval since the last check has not elapsed.
    NotDue,
    /// Another check is running.
    InProgress,
    /// The check may run; the in-progress flag is now set.
    Due,
}

#[derive(Debug)]
pub struct ReliabilityMonitor {
    policy: RetryPolicy,
    error_counts: BTreeMap<ErrorCategory, u64>,
    retry_count: u32,
    stats: OperationStats,
    last_health_check: Option<Instant>,
    health_check_in_progress: bool,
}

impl Default for ReliabilityMonitor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl ReliabilityMonitor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            error_counts: ErrorCategory::ALL.into_iter().map(|c| (c, 0)).collect(),
            retry_count: 0,
            stats: OperationStats::default(),
            last_health_check: None,
            health_check_in_progress: false,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    // ── Error counters ──

    pub fn increment_error_count(&mut self, category: ErrorCategory) {
        if let Some(count) = self.error_counts.get_mut(&category) {
            *count += 1;
        }
    }

    /// Increment by wire name (`"usb_timeout"`, ...). Unknown names are ignored.
    pub fn increment_error_count_by_name(&mut self, name: &str) {
        if let Some(category) = ErrorCategory::from_name(name) {
            self.increment_error_count(category);
        }
    }

    pub fn error_count(&self, category: ErrorCategory) -> u64 {
        self.error_counts.get(&category).copied().unwrap_or(0)
    }

    pub fn reset_error_counts(&mut self) {
        for count in self.error_counts.values_mut() {
            *count = 0;
        }
    }

    // ── Retry policy ──

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn record_retry(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
    }

    pub fn reset_retry_count(&mut self) {
        self.retry_count = 0;
    }

    /// Whether another reconnect attempt is permitted. Pure; no side effects.
    pub fn should_retry_connection(&self) -> bool {
        self.retry_count < self.policy.max_retry_attempts
            && self.error_count(ErrorCategory::ConnectionLost) < self.policy.max_error_threshold
    }

    // ── Stats ──

    pub fn record_sent(&mut self, bytes: usize) {
        self.stats.commands_sent += 1;
        self.stats.bytes_sent += bytes as u64;
        self.stats.last_operation = Some(SystemTime::now());
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.stats.bytes_received += bytes as u64;
        self.stats.last_operation = Some(SystemTime::now());
    }

    pub fn record_response(&mut self) {
        self.stats.responses_received += 1;
    }

    /// A fresh connection resets counters and retries.
    pub fn record_connected(&mut self, took: Duration) {
        self.reset_error_counts();
        self.reset_retry_count();
        self.stats.connection_time = Some(took);
        self.stats.connected_at = Some(SystemTime::now());
    }

    pub fn stats(&self) -> &OperationStats {
        &self.stats
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        ConnectionStats {
            error_counts: self.error_counts.clone(),
            retry_count: self.retry_count,
            retry_permitted: self.should_retry_connection(),
            operations: self.stats.clone(),
        }
    }

    // ── Health checks ──

    /// Try to start a health check at `now`.
    ///
    /// On [`HealthCheckStart::Due`] the last-check timestamp is updated and
    /// the in-progress flag is set; the caller must call
    /// [`finish_health_check`](Self::finish_health_check) afterwards.
    pub fn begin_health_check(&mut self, now: Instant) -> HealthCheckStart {
        if self.health_check_in_progress {
            return HealthCheckStart::InProgress;
        }
        if let Some(last) = self.last_health_check
            && now.saturating_duration_since(last) < self.policy.health_check_interval
        {
            return HealthCheckStart::NotDue;
        }
        self.health_check_in_progress = true;
        self.last_health_check = Some(now);
        HealthCheckStart::Due
    }

    pub fn finish_health_check(&mut self) {
        self.health_check_in_progress = false;
    }

    pub fn health_check_in_progress(&self) -> bool {
        self.health_check_in_progress
    }

    pub fn last_health_check(&self) -> Option<Instant> {
        self.last_health_check
    }
}
