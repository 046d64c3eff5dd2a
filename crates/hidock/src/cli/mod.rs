//! CLI subcommands: discovery, device queries, file management, monitoring.

mod config_cmd;
mod devices;
mod files;
mod info;
mod settings;
mod watch;

use std::path::Path;

use clap::Subcommand;
use serde::Serialize;

pub(super) use crate::RUNNING;
pub(super) use hidock_lib::config::Config;
pub(super) use hidock_lib::connection::{ConnectionError, ConnectionState};
pub(super) use hidock_lib::device::{DiscoveredDevice, PlatformHost};
pub(super) use hidock_lib::error::Result;
pub(super) use hidock_lib::filelist::FileEntry;
pub(super) use hidock_lib::response::{BehaviorSettings, CardInfo, DeviceInfo, SettingsUpdate};
pub(super) use hidock_lib::{HidockError, JensenDevice};

const PADDING: usize = 2;

/// Alignment width for key-value output. Top-level and indented values
/// land in the same column.
pub(super) fn kv_width(top: &[&str], indent: &[&str]) -> usize {
    let top_max = top.iter().map(|k| k.len()).max().unwrap_or(0);
    let indent_max = indent.iter().map(|k| k.len()).max().unwrap_or(0);
    let top_need = if top.is_empty() { 0 } else { top_max + PADDING };
    // Indented keys lose two columns to the prefix
    let indent_need = if indent.is_empty() {
        0
    } else {
        indent_max + PADDING + 2
    };
    top_need.max(indent_need)
}

pub(super) fn format_kv(key: &str, value: impl std::fmt::Display, w: usize) -> String {
    format!("{key:<width$}{value}", width = w)
}

pub(super) fn kv(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("{}", format_kv(key, value, w));
}

pub(super) fn kv_indent(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("  {key:<width$}{value}", width = w.saturating_sub(2));
}

/// `1536` -> `1.5 KiB`.
pub(super) fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if n < 1024 {
        return format!("{n} B");
    }
    let mut value = n as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// `3725.0` -> `1:02:05`, `65.5` -> `1:05`.
pub(super) fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total / 60) % 60, total % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

pub(super) fn print_json(value: &impl Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| HidockError::Config(format!("JSON encoding failed: {e}")))?;
    println!("{text}");
    Ok(())
}

/// Ask on stdin. Anything but `y` declines, including EOF.
pub(super) fn confirm(prompt: &str) -> bool {
    use std::io::Write;
    print!("{prompt} [y/N] ");
    std::io::stdout().flush().ok();
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer).is_ok() && answer.trim().eq_ignore_ascii_case("y")
}

/// Config from `custom_path` or the default location, warnings logged.
pub(super) fn load_config(custom_path: Option<&Path>) -> Config {
    let (config, warnings) = match custom_path {
        Some(p) => Config::load_from(p),
        None => Config::load_with_warnings(),
    };
    for w in &warnings {
        log::warn!("[config] {w}");
    }
    config
}

/// Build a device from the config and connect to the first match.
pub(super) fn open_device(config: &Config) -> Result<JensenDevice<PlatformHost>> {
    let jd = JensenDevice::with_options(PlatformHost::default(), config.device_options());
    match jd.connect()? {
        Some(state) => {
            log::info!(
                "connected to {} on interface {}",
                model_label(&state),
                state.claimed_interface.unwrap_or_default()
            );
            Ok(jd)
        }
        None => Err(ConnectionError::DeviceNotFound.into()),
    }
}

pub(super) fn model_label(state: &ConnectionState) -> String {
    match (state.model, state.product_id) {
        (Some(model), _) => model.to_string(),
        (None, Some(pid)) => format!("unknown ({pid:04x})"),
        (None, None) => "unknown".to_string(),
    }
}

// ── JSON output structs ──

#[derive(Serialize)]
pub(super) struct DevicesOutput {
    pub count: usize,
    pub devices: Vec<DiscoveredDevice>,
}

#[derive(Serialize)]
pub(super) struct InfoOutput {
    pub model: String,
    pub connection: ConnectionState,
    pub device: DeviceInfo,
}

#[derive(Serialize)]
pub(super) struct CardOutput {
    #[serde(flatten)]
    pub card: CardInfo,
    pub free: u32,
}

#[derive(Serialize)]
pub(super) struct RecordingOutput {
    pub recording: Option<String>,
}

#[derive(Serialize)]
pub(super) struct FilesOutput {
    pub count: usize,
    pub total_bytes: u64,
    pub files: Vec<FileEntry>,
}

#[derive(Serialize)]
pub(super) struct TimeOutput {
    /// `None` when the device clock was never set.
    pub device_time: Option<String>,
    pub host_time: String,
    pub synced: bool,
}

#[derive(Serialize)]
pub(super) struct ConfigOutput {
    pub config_file: Option<String>,
    pub config_file_exists: bool,
    pub settings: Config,
    pub problems: Vec<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// List connected HiDock devices
    Devices,

    /// Show model, firmware version and serial number
    Info,

    /// Show or change behavior settings
    Settings {
        /// Start recording automatically
        #[arg(long, value_name = "BOOL")]
        auto_record: Option<bool>,
        /// Start playback automatically
        #[arg(long, value_name = "BOOL")]
        auto_play: Option<bool>,
        /// Bluetooth connection tone
        #[arg(long, value_name = "BOOL")]
        bluetooth_tone: Option<bool>,
        /// Notification sounds
        #[arg(long, value_name = "BOOL")]
        notification_sound: Option<bool>,
    },

    /// Show storage card usage
    Card,

    /// Erase every recording on the storage card
    Format {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Show the active or most recent recording
    Recording,

    /// List recordings stored on the device
    Files,

    /// Download a recording
    Download {
        /// File name as shown by `files`
        name: String,
        /// Target directory (default: `download_dir` from the config)
        #[arg(long, short)]
        output: Option<std::path::PathBuf>,
    },

    /// Delete a recording
    Delete {
        /// File name as shown by `files`
        name: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Show the device clock, optionally setting it to local time
    Time {
        /// Set the device clock to the host's local time
        #[arg(long)]
        sync: bool,
    },

    /// Show current configuration and file path
    Config,

    /// Monitor connection health and reconnect until Ctrl+C
    Watch,
}

/// Warn if `--json` was passed to a command that doesn't support it.
fn warn_json_unsupported(cmd_name: &str) {
    log::warn!("--json is not supported for `{cmd_name}` (ignored)");
}

pub fn run(cmd: Command, json: bool, config_path: Option<&Path>) -> Result<()> {
    match cmd {
        Command::Devices => devices::cmd_devices(json, config_path),
        Command::Info => info::cmd_info(json, config_path),
        Command::Settings {
            auto_record,
            auto_play,
            bluetooth_tone,
            notification_sound,
        } => {
            let update = SettingsUpdate {
                auto_record,
                auto_play,
                bluetooth_tone,
                notification_sound,
            };
            settings::cmd_settings(&update, json, config_path)
        }
        Command::Card => info::cmd_card(json, config_path),
        Command::Format { yes } => {
            if json {
                warn_json_unsupported("format");
            }
            files::cmd_format(yes, config_path)
        }
        Command::Recording => info::cmd_recording(json, config_path),
        Command::Files => files::cmd_files(json, config_path),
        Command::Download { name, output } => {
            if json {
                warn_json_unsupported("download");
            }
            files::cmd_download(&name, output.as_deref(), config_path)
        }
        Command::Delete { name, yes } => {
            if json {
                warn_json_unsupported("delete");
            }
            files::cmd_delete(&name, yes, config_path)
        }
        Command::Time { sync } => info::cmd_time(sync, json, config_path),
        Command::Config => config_cmd::cmd_config(json, config_path),
        Command::Watch => {
            if json {
                warn_json_unsupported("watch");
            }
            watch::cmd_watch(config_path)
        }
    }
}

#[cfg(test)]
mod format_tests {
    use super::*;

    #[test]
    fn kv_width_top_only() {
        let w = kv_width(&["Model:", "Firmware:"], &[]);
        // "Firmware:" = 9 + PADDING
        assert_eq!(w, 11);
    }

    #[test]
    fn kv_width_indent_drives_width() {
        let w = kv_width(&["A:"], &["notification_sound:"]);
        // 19 + PADDING + 2
        assert_eq!(w, 23);
    }

    #[test]
    fn kv_width_empty_both() {
        assert_eq!(kv_width(&[], &[]), 0);
    }

    #[test]
    fn values_align_across_levels() {
        let w = kv_width(&["Top:"], &["Indent:"]);
        let top = format_kv("Top:", "V", w);
        let indent = format!("  {:<width$}{}", "Indent:", "V", width = w - 2);
        assert_eq!(top.find('V'), indent.find('V'));
    }

    #[test]
    fn format_kv_overlong_key_not_padded() {
        assert_eq!(format_kv("Serial number:", "x", 6), "Serial number:x");
    }

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(1023), "1023 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(human_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(0.0), "0:00");
        assert_eq!(format_duration(65.4), "1:05");
        assert_eq!(format_duration(3725.0), "1:02:05");
        assert_eq!(format_duration(-3.0), "0:00");
    }
}
