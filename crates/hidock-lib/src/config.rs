//! Configuration: TOML file in the platform config directory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::jensen::DeviceOptions;
use crate::protocol::{
    DEFAULT_TIMEOUT, FORMAT_TIMEOUT, HEALTH_CHECK_INTERVAL, HIDOCK_VID, JENSEN_INTERFACE,
    KNOWN_PRODUCT_IDS, MAX_ERROR_THRESHOLD, MAX_RETRY_ATTEMPTS,
};
use crate::reconnect::ReconnectConfig;
use crate::reliability::RetryPolicy;

/// Header comment prepended to saved config files.
const CONFIG_HEADER: &str = "# HiDock configuration. Missing keys use built-in defaults.\n\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// USB vendor id. Default: 0x10D6.
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,

    /// Product ids tried in order when connecting.
    #[serde(default = "default_product_ids")]
    pub product_ids: Vec<u16>,

    /// Interface number to claim.
    #[serde(default = "default_interface")]
    pub interface: u8,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Timeout for formatting the card, which can take a while.
    #[serde(default = "default_format_timeout_ms")]
    pub format_timeout_ms: u64,

    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Reconnect attempts before giving up.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// `connection_lost` errors before giving up.
    #[serde(default = "default_max_error_threshold")]
    pub max_error_threshold: u64,

    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Where downloads land. Empty = current directory.
    #[serde(default)]
    pub download_dir: String,
}

fn default_vendor_id() -> u16 {
    HIDOCK_VID
}
fn default_product_ids() -> Vec<u16> {
    KNOWN_PRODUCT_IDS.to_vec()
}
fn default_interface() -> u8 {
    JENSEN_INTERFACE
}
fn default_command_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}
fn default_format_timeout_ms() -> u64 {
    FORMAT_TIMEOUT.as_millis() as u64
}
fn default_health_check_interval_secs() -> u64 {
    HEALTH_CHECK_INTERVAL.as_secs()
}
fn default_max_retry_attempts() -> u32 {
    MAX_RETRY_ATTEMPTS
}
fn default_max_error_threshold() -> u64 {
    MAX_ERROR_THRESHOLD
}
fn default_reconnect_initial_delay_ms() -> u64 {
    1_000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

impl Default for Config {
    fn default() -> Self {
        Config {
            vendor_id: default_vendor_id(),
            product_ids: default_product_ids(),
            interface: default_interface(),
            command_timeout_ms: default_command_timeout_ms(),
            format_timeout_ms: default_format_timeout_ms(),
            health_check_interval_secs: default_health_check_interval_secs(),
            max_retry_attempts: default_max_retry_attempts(),
            max_error_threshold: default_max_error_threshold(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            download_dir: String::new(),
        }
    }
}

/// Problems reported by [`Config::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyProductIds,
    /// A duration field is zero.
    ZeroDuration(&'static str),
    ZeroRetryAttempts,
    /// `reconnect_initial_delay_ms` exceeds `reconnect_max_delay_ms`.
    BackoffRange { initial_ms: u64, max_ms: u64 },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyProductIds => write!(f, "product_ids cannot be empty"),
            ValidationError::ZeroDuration(field) => write!(f, "{field} must be greater than zero"),
            ValidationError::ZeroRetryAttempts => {
                write!(f, "max_retry_attempts must be greater than zero")
            }
            ValidationError::BackoffRange { initial_ms, max_ms } => write!(
                f,
                "reconnect_initial_delay_ms ({initial_ms}) exceeds reconnect_max_delay_ms ({max_ms})"
            ),
        }
    }
}

impl Config {
    /// Platform-specific config directory.
    pub fn dir() -> Option<PathBuf> {
        #[cfg(windows)]
        {
            dirs::config_dir().map(|p| p.join("HiDock"))
        }
        #[cfg(not(windows))]
        {
            dirs::config_dir().map(|p| p.join("hidock"))
        }
    }

    pub fn path() -> Option<PathBuf> {
        Self::dir().map(|d| d.join("config.toml"))
    }

    /// Load config from disk, or return defaults if not found.
    pub fn load() -> Self {
        let (config, warnings) = Self::load_with_warnings();
        for w in &warnings {
            log::warn!("{w}");
        }
        config
    }

    /// Save atomically: write a temp file next to `path`, then rename.
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let serialized = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        let contents = format!("{CONFIG_HEADER}{serialized}");
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, &contents)?;
        match std::fs::rename(&tmp, path) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Rename can fail across filesystems
                let result = std::fs::write(path, &contents);
                let _ = std::fs::remove_file(&tmp);
                result
            }
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::path() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No config directory",
            ));
        };
        self.save_to(&path)
    }

    /// Load from `path`. A missing file gives defaults silently; an
    /// unparseable one gives defaults plus a warning.
    pub fn load_from(path: &Path) -> (Self, Vec<String>) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, vec![]),
                Err(e) => {
                    let warning = format!(
                        "config parse error ({}), using defaults: {e}",
                        path.display()
                    );
                    (Self::default(), vec![warning])
                }
            },
            Err(_) => (Self::default(), vec![]),
        }
    }

    pub fn load_with_warnings() -> (Self, Vec<String>) {
        let Some(path) = Self::path() else {
            return (Self::default(), vec![]);
        };
        Self::load_from(&path)
    }

    /// Collect every problem instead of stopping at the first.
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.product_ids.is_empty() {
            errors.push(ValidationError::EmptyProductIds);
        }
        for (field, value) in [
            ("command_timeout_ms", self.command_timeout_ms),
            ("format_timeout_ms", self.format_timeout_ms),
            ("health_check_interval_secs", self.health_check_interval_secs),
        ] {
            if value == 0 {
                errors.push(ValidationError::ZeroDuration(field));
            }
        }
        if self.max_retry_attempts == 0 {
            errors.push(ValidationError::ZeroRetryAttempts);
        }
        if self.reconnect_initial_delay_ms > self.reconnect_max_delay_ms {
            errors.push(ValidationError::BackoffRange {
                initial_ms: self.reconnect_initial_delay_ms,
                max_ms: self.reconnect_max_delay_ms,
            });
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retry_attempts: self.max_retry_attempts,
            max_error_threshold: self.max_error_threshold,
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
        }
    }

    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            vendor_id: self.vendor_id,
            product_ids: self.product_ids.clone(),
            interface: self.interface,
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            format_timeout: Duration::from_millis(self.format_timeout_ms),
            retry: self.retry_policy(),
        }
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            ..ReconnectConfig::default()
        }
    }

    /// Resolved download directory.
    pub fn download_dir(&self) -> PathBuf {
        let dir = self.download_dir.trim();
        if dir.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(dir)
        }
    }
}
