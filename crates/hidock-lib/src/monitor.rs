//! Background health monitor: the one dedicated thread.
//!
//! Ticks periodically and calls [`JensenDevice::check_health`], which decides
//! on its own whether a probe is due. Skipped ticks carry no news; only
//! changes in probed health are reported on the channel.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::device::UsbHost;
use crate::jensen::{HealthCheck, JensenDevice};

const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    Healthy,
    /// A probe failed or the device is gone. `retry_permitted` is the retry
    /// decision at the time of the failure.
    Unhealthy { retry_permitted: bool },
}

pub struct HealthMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Start the monitor thread. `tick` is how often the interval is
    /// consulted, not the probe interval itself.
    pub fn spawn<H>(
        device: Arc<JensenDevice<H>>,
        tick: Duration,
    ) -> io::Result<(Self, Receiver<HealthEvent>)>
    where
        H: UsbHost + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("hidock-health".into())
            .spawn(move || run(device, tick, thread_stop, tx))?;
        Ok((
            Self {
                stop,
                handle: Some(handle),
            },
            rx,
        ))
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread and wait for it. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            log::warn!("health monitor thread panicked");
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<H: UsbHost>(
    device: Arc<JensenDevice<H>>,
    tick: Duration,
    stop: Arc<AtomicBool>,
    tx: Sender<HealthEvent>,
) {
    let mut last: Option<bool> = None;
    while !stop.load(Ordering::SeqCst) {
        let healthy = match device.check_health() {
            HealthCheck::Skipped => None,
            HealthCheck::Healthy => Some(true),
            HealthCheck::Unhealthy => Some(false),
        };
        if let Some(healthy) = healthy
            && last != Some(healthy)
        {
            let event = if healthy {
                HealthEvent::Healthy
            } else {
                HealthEvent::Unhealthy {
                    retry_permitted: device.should_retry_connection(),
                }
            };
            log::debug!("health changed: {event:?}");
            if tx.send(event).is_err() {
                break;
            }
            last = Some(healthy);
        }
        sleep_unless_stopped(tick, &stop);
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let mut left = total;
    while !left.is_zero() && !stop.load(Ordering::SeqCst) {
        let step = left.min(STOP_POLL);
        std::thread::sleep(step);
        left -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockDevice, MockHost};
    use crate::jensen::DeviceOptions;
    use crate::protocol::CMD_GET_DEVICE_INFO;
    use crate::reliability::RetryPolicy;

    fn options() -> DeviceOptions {
        DeviceOptions {
            retry: RetryPolicy {
                health_check_interval: Duration::ZERO,
                ..RetryPolicy::default()
            },
            ..DeviceOptions::default()
        }
    }

    #[test]
    fn reports_unhealthy_when_disconnected() {
        let jd = Arc::new(JensenDevice::with_options(MockHost::empty(), options()));
        let (mut mon, rx) = HealthMonitor::spawn(jd, Duration::from_millis(10)).unwrap();
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            event,
            HealthEvent::Unhealthy {
                retry_permitted: true
            }
        );
        mon.stop();
        assert!(!mon.is_running());
    }

    #[test]
    fn skipped_ticks_do_not_report_recovery() {
        let opts = DeviceOptions {
            retry: RetryPolicy {
                health_check_interval: Duration::from_millis(300),
                ..RetryPolicy::default()
            },
            ..DeviceOptions::default()
        };
        let jd = Arc::new(JensenDevice::with_options(MockHost::empty(), opts));
        let (_mon, rx) = HealthMonitor::spawn(jd, Duration::from_millis(10)).unwrap();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            HealthEvent::Unhealthy { .. }
        ));
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while let Some(left) = deadline.checked_duration_since(std::time::Instant::now()) {
            match rx.recv_timeout(left) {
                Ok(event) => assert_ne!(event, HealthEvent::Healthy),
                Err(_) => break,
            }
        }
    }

    #[test]
    fn reports_transition_to_healthy() {
        let dev = MockDevice::new();
        let jd = Arc::new(JensenDevice::with_options(
            MockHost::with_device(dev.clone()),
            options(),
        ));
        jd.connect().unwrap();
        for _ in 0..50 {
            dev.queue_reply(CMD_GET_DEVICE_INFO, vec![0, 1, 2, 3]);
        }
        let (_mon, rx) = HealthMonitor::spawn(Arc::clone(&jd), Duration::from_millis(10)).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            HealthEvent::Healthy
        );
    }

    #[test]
    fn stop_is_idempotent() {
        let jd = Arc::new(JensenDevice::new(MockHost::empty()));
        let (mut mon, _rx) = HealthMonitor::spawn(jd, Duration::from_secs(60)).unwrap();
        mon.stop();
        mon.stop();
        assert!(!mon.is_running());
    }
}
