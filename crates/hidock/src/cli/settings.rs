//! `settings` subcommand: show or change the behavior flags.

use std::path::Path;

use super::{
    BehaviorSettings, Result, SettingsUpdate, kv, kv_width, load_config, open_device, print_json,
};

fn on_off(v: bool) -> &'static str {
    if v { "on" } else { "off" }
}

fn print_settings(s: &BehaviorSettings) {
    let w = kv_width(
        &[
            "auto_record:",
            "auto_play:",
            "bluetooth_tone:",
            "notification_sound:",
        ],
        &[],
    );
    kv("auto_record:", on_off(s.auto_record), w);
    kv("auto_play:", on_off(s.auto_play), w);
    kv("bluetooth_tone:", on_off(s.bluetooth_tone), w);
    kv("notification_sound:", on_off(s.notification_sound), w);
}

/// Without flags, print the current settings. With flags, apply them and
/// print the result.
pub(super) fn cmd_settings(
    update: &SettingsUpdate,
    json: bool,
    config_path: Option<&Path>,
) -> Result<()> {
    let jd = open_device(&load_config(config_path))?;

    let settings = if update.is_empty() {
        jd.refresh_device_settings()?
    } else {
        jd.set_device_settings(update)?
    };

    if json {
        return print_json(&settings);
    }
    print_settings(&settings);
    if !update.is_empty() {
        println!();
        println!("Settings updated.");
    }
    Ok(())
}
