//! `devices` subcommand: list connected HiDock devices.

use std::path::Path;

use hidock_lib::device::UsbHost;
use hidock_lib::models::DeviceModel;

use super::{DevicesOutput, PlatformHost, Result, load_config, print_json};

pub(super) fn cmd_devices(json: bool, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path);
    let devices: Vec<_> = PlatformHost::default()
        .list_devices(config.vendor_id)?
        .into_iter()
        .filter(|d| config.product_ids.contains(&d.product_id))
        .collect();

    if json {
        return print_json(&DevicesOutput {
            count: devices.len(),
            devices,
        });
    }

    if devices.is_empty() {
        println!("No HiDock devices found.");
        return Ok(());
    }

    println!(
        "Found {} HiDock device{}:",
        devices.len(),
        if devices.len() == 1 { "" } else { "s" }
    );
    println!();

    for (i, dev) in devices.iter().enumerate() {
        println!(
            "  [{}] {} {}",
            i + 1,
            DeviceModel::from_product_id(dev.product_id),
            dev.path
        );
        if let Some(ref serial) = dev.serial {
            println!("      Serial: {serial}");
        }
    }

    Ok(())
}
