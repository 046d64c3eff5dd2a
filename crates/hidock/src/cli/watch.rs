//! `watch` subcommand: report connection health and reconnect until Ctrl+C.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use hidock_lib::monitor::{HealthEvent, HealthMonitor};
use hidock_lib::reconnect::{Backoff, ReconnectOutcome, try_reconnect};

use super::{JensenDevice, PlatformHost, RUNNING, Result, load_config, model_label};

/// How often the monitor thread consults the health-check interval.
const MONITOR_TICK: Duration = Duration::from_secs(1);
/// Main loop poll period; bounds Ctrl+C latency.
const POLL: Duration = Duration::from_millis(250);

pub(super) fn cmd_watch(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path);
    let jd = Arc::new(JensenDevice::with_options(
        PlatformHost::default(),
        config.device_options(),
    ));
    let mut backoff = Backoff::new(config.reconnect_config());

    println!(
        "Watching for HiDock devices (health check every {}s). Press Ctrl+C to stop.",
        config.health_check_interval_secs
    );
    match jd.connect() {
        Ok(Some(state)) => println!("[device] Connected to {}", model_label(&state)),
        Ok(None) => println!("[device] No device found, waiting..."),
        Err(e) => log::warn!("[device] {e}"),
    }

    let (mut monitor, events) = HealthMonitor::spawn(Arc::clone(&jd), MONITOR_TICK)?;
    let mut gave_up = false;

    while RUNNING.load(Ordering::SeqCst) {
        match events.recv_timeout(POLL) {
            Ok(HealthEvent::Healthy) => println!("[health] OK"),
            Ok(HealthEvent::Unhealthy { retry_permitted }) => {
                if jd.is_connected() {
                    println!("[health] Device not responding, disconnecting");
                    jd.disconnect();
                }
                if !retry_permitted {
                    log::warn!("[health] error threshold reached");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("[health] monitor stopped unexpectedly");
                break;
            }
        }

        if jd.is_connected() || gave_up {
            continue;
        }
        match try_reconnect(&jd, &mut backoff) {
            ReconnectOutcome::Reconnected(state) => {
                println!("[device] Reconnected to {}", model_label(&state));
            }
            ReconnectOutcome::GaveUp => {
                println!("[device] Retry limit reached, no longer reconnecting");
                gave_up = true;
            }
            ReconnectOutcome::Waiting
            | ReconnectOutcome::NotFound
            | ReconnectOutcome::Failed(_) => {}
        }
    }

    monitor.stop();
    jd.disconnect();

    let stats = jd.connection_stats();
    println!();
    println!(
        "Commands sent: {}, responses: {}, retries: {}",
        stats.operations.commands_sent, stats.operations.responses_received, stats.retry_count
    );
    for (category, count) in stats.error_counts.iter().filter(|(_, n)| **n > 0) {
        println!("  {category}: {count}");
    }
    Ok(())
}
