//! Reconnection with exponential backoff, gated by the retry policy.
//!
//! [`Backoff`] only tracks timing. [`try_reconnect`] combines it with
//! [`JensenDevice::should_retry_connection`] so a device that keeps failing
//! is eventually left alone until the caller resets the error counts.

use std::time::{Duration, Instant};

use crate::connection::{ConnectionError, ConnectionState};
use crate::device::UsbHost;
use crate::jensen::JensenDevice;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Applied to the delay after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    delay: Duration,
    last_attempt: Option<Instant>,
    failures: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            delay: config.initial_delay,
            config,
            last_attempt: None,
            failures: 0,
        }
    }

    /// True before the first attempt and once the current delay has passed.
    pub fn is_due(&self, now: Instant) -> bool {
        self.last_attempt
            .is_none_or(|last| now.saturating_duration_since(last) >= self.delay)
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failures += 1;
        self.last_attempt = Some(now);
        let next = self.delay.as_secs_f64() * self.config.multiplier;
        self.delay = Duration::from_secs_f64(next).min(self.config.max_delay);
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.delay = self.config.initial_delay;
        self.last_attempt = None;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}

#[derive(Debug)]
pub enum ReconnectOutcome {
    Reconnected(ConnectionState),
    /// Backoff delay has not elapsed; nothing was attempted.
    Waiting,
    /// Retry policy exhausted.
    GaveUp,
    /// Attempted, no device present.
    NotFound,
    /// Attempted, connection failed.
    Failed(ConnectionError),
}

/// One reconnect step. Call periodically while disconnected.
pub fn try_reconnect<H: UsbHost>(
    device: &JensenDevice<H>,
    backoff: &mut Backoff,
) -> ReconnectOutcome {
    let now = Instant::now();
    if !backoff.is_due(now) {
        return ReconnectOutcome::Waiting;
    }
    if !device.should_retry_connection() {
        return ReconnectOutcome::GaveUp;
    }
    let outcome = match device.connect() {
        Ok(Some(state)) => {
            backoff.reset();
            log::info!("reconnected");
            return ReconnectOutcome::Reconnected(state);
        }
        Ok(None) => ReconnectOutcome::NotFound,
        Err(e) => ReconnectOutcome::Failed(e),
    };
    device.record_retry();
    backoff.record_failure(now);
    match &outcome {
        ReconnectOutcome::Failed(e) => log::warn!(
            "reconnect failed: {e} (attempt {}, retry in {:.1}s)",
            backoff.failures(),
            backoff.delay().as_secs_f64()
        ),
        _ => log::debug!(
            "no device to reconnect to (attempt {}, retry in {:.1}s)",
            backoff.failures(),
            backoff.delay().as_secs_f64()
        ),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::UsbError;
    use crate::device::mock::{MockDevice, MockHost};

    fn instant_config() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 2.0,
        }
    }

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.multiplier, 2.0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(ReconnectConfig {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            multiplier: 2.0,
        });
        let now = Instant::now();
        assert!(b.is_due(now));
        let delays: Vec<Duration> = (0..4)
            .map(|_| {
                b.record_failure(now);
                b.delay()
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
        assert_eq!(b.failures(), 4);
    }

    #[test]
    fn backoff_due_after_delay() {
        let mut b = Backoff::default();
        let now = Instant::now();
        b.record_failure(now);
        assert!(!b.is_due(now + Duration::from_millis(1999)));
        assert!(b.is_due(now + Duration::from_secs(2)));
    }

    #[test]
    fn reset_restores_initial() {
        let mut b = Backoff::default();
        b.record_failure(Instant::now());
        b.reset();
        assert_eq!(b.failures(), 0);
        assert_eq!(b.delay(), Duration::from_secs(1));
        assert!(b.is_due(Instant::now()));
    }

    #[test]
    fn waiting_does_not_touch_device() {
        let jd = JensenDevice::new(MockHost::empty());
        let mut b = Backoff::default();
        assert!(matches!(try_reconnect(&jd, &mut b), ReconnectOutcome::NotFound));
        assert!(matches!(try_reconnect(&jd, &mut b), ReconnectOutcome::Waiting));
        assert_eq!(jd.connection_stats().retry_count, 1);
    }

    #[test]
    fn gives_up_after_max_retries() {
        let jd = JensenDevice::new(MockHost::empty());
        let mut b = Backoff::new(instant_config());
        for _ in 0..3 {
            assert!(matches!(try_reconnect(&jd, &mut b), ReconnectOutcome::NotFound));
        }
        assert!(matches!(try_reconnect(&jd, &mut b), ReconnectOutcome::GaveUp));
        jd.reset_error_counts();
        // Retry count is separate from error counts.
        assert!(matches!(try_reconnect(&jd, &mut b), ReconnectOutcome::GaveUp));
    }

    #[test]
    fn failed_claim_is_reported() {
        let dev = MockDevice::new();
        dev.state().fail_claim = Some(UsbError::Access("EACCES".into()));
        let jd = JensenDevice::new(MockHost::with_device(dev));
        let mut b = Backoff::new(instant_config());
        assert!(matches!(
            try_reconnect(&jd, &mut b),
            ReconnectOutcome::Failed(ConnectionError::AccessDenied(_))
        ));
    }

    #[test]
    fn success_resets_backoff_and_retries() {
        let dev = MockDevice::new();
        let jd = JensenDevice::new(MockHost::with_device(dev));
        jd.record_retry();
        let mut b = Backoff::new(instant_config());
        b.record_failure(Instant::now());
        assert!(matches!(
            try_reconnect(&jd, &mut b),
            ReconnectOutcome::Reconnected(_)
        ));
        assert_eq!(b.failures(), 0);
        assert_eq!(jd.connection_stats().retry_count, 0);
    }
}
