//! Read-only device queries: `info`, `card`, `recording`, `time`.

use std::path::Path;

use chrono::{Local, NaiveDateTime};

use super::{
    CardOutput, InfoOutput, RecordingOutput, Result, TimeOutput, kv, kv_width, load_config,
    model_label, open_device, print_json,
};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(super) fn cmd_info(json: bool, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path);
    let jd = open_device(&config)?;
    let device = jd.get_device_info()?;
    let connection = jd.connection_state();
    let model = model_label(&connection);

    if json {
        return print_json(&InfoOutput {
            model,
            connection,
            device,
        });
    }

    let w = kv_width(&["Model:", "Firmware:", "Serial:", "Product:", "USB id:"], &[]);
    kv("Model:", &model, w);
    kv(
        "Firmware:",
        format_args!("{} ({})", device.version, device.version_code),
        w,
    );
    let serial = if device.serial.is_empty() {
        "(none)"
    } else {
        device.serial.as_str()
    };
    kv("Serial:", serial, w);
    if let Some(ref product) = connection.identity.product {
        kv("Product:", product, w);
    }
    if let Some(pid) = connection.product_id {
        kv("USB id:", format_args!("{:04x}:{pid:04x}", config.vendor_id), w);
    }
    Ok(())
}

pub(super) fn cmd_card(json: bool, config_path: Option<&Path>) -> Result<()> {
    let jd = open_device(&load_config(config_path))?;
    let card = jd.get_card_info()?;

    if json {
        return print_json(&CardOutput {
            free: card.free(),
            card,
        });
    }

    let w = kv_width(&["Used:", "Free:", "Capacity:", "Status:"], &[]);
    let percent = if card.capacity == 0 {
        0.0
    } else {
        f64::from(card.used) * 100.0 / f64::from(card.capacity)
    };
    kv("Capacity:", card.capacity, w);
    kv("Used:", format_args!("{} ({percent:.1}%)", card.used), w);
    kv("Free:", card.free(), w);
    kv("Status:", format_args!("{:#x}", card.status_raw), w);
    Ok(())
}

pub(super) fn cmd_recording(json: bool, config_path: Option<&Path>) -> Result<()> {
    let jd = open_device(&load_config(config_path))?;
    let recording = jd.get_recording_file()?;

    if json {
        return print_json(&RecordingOutput { recording });
    }

    match recording {
        Some(name) => println!("{name}"),
        None => println!("No active or recent recording."),
    }
    Ok(())
}

pub(super) fn cmd_time(sync: bool, json: bool, config_path: Option<&Path>) -> Result<()> {
    let jd = open_device(&load_config(config_path))?;

    let host_time = Local::now().naive_local();
    if sync {
        jd.set_device_time(&host_time)?;
        log::info!("device clock set to {}", host_time.format(TIME_FORMAT));
    }
    let device_time = jd.get_device_time()?;

    if json {
        return print_json(&TimeOutput {
            device_time: device_time.map(|t| t.format(TIME_FORMAT).to_string()),
            host_time: host_time.format(TIME_FORMAT).to_string(),
            synced: sync,
        });
    }

    let w = kv_width(&["Device time:", "Host time:", "Drift:"], &[]);
    match device_time {
        Some(t) => {
            kv("Device time:", t.format(TIME_FORMAT), w);
            kv("Host time:", host_time.format(TIME_FORMAT), w);
            kv("Drift:", format_drift(t, host_time), w);
        }
        None => {
            kv("Device time:", "(not set)", w);
            kv("Host time:", host_time.format(TIME_FORMAT), w);
        }
    }
    if sync {
        println!();
        println!("Device clock synchronized.");
    }
    Ok(())
}

/// Signed device-minus-host difference, e.g. `+3s` or `-1m 12s`.
fn format_drift(device: NaiveDateTime, host: NaiveDateTime) -> String {
    let secs = (device - host).num_seconds();
    let sign = if secs < 0 { '-' } else { '+' };
    let abs = secs.unsigned_abs();
    if abs >= 60 {
        format!("{sign}{}m {}s", abs / 60, abs % 60)
    } else {
        format!("{sign}{abs}s")
    }
}
