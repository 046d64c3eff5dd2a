//! `config` subcommand: show current configuration and file path.

use std::path::Path;

use super::{Config, ConfigOutput, Result, kv, kv_indent, kv_width, load_config, print_json};

pub(super) fn cmd_config(json: bool, custom_path: Option<&Path>) -> Result<()> {
    let config = load_config(custom_path);
    let config_path = custom_path.map(Path::to_path_buf).or_else(Config::path);
    let config_exists = config_path.as_ref().is_some_and(|p| p.exists());
    let problems: Vec<String> = match config.validate() {
        Ok(()) => vec![],
        Err(errors) => errors.iter().map(ToString::to_string).collect(),
    };

    if json {
        return print_json(&ConfigOutput {
            config_file: config_path.as_ref().map(|p| p.display().to_string()),
            config_file_exists: config_exists,
            settings: config,
            problems,
        });
    }

    let w = kv_width(
        &["Config file:"],
        &[
            "vendor_id:",
            "product_ids:",
            "interface:",
            "command_timeout_ms:",
            "format_timeout_ms:",
            "health_check_interval_secs:",
            "max_retry_attempts:",
            "max_error_threshold:",
            "reconnect_initial_delay_ms:",
            "reconnect_max_delay_ms:",
            "download_dir:",
        ],
    );

    match &config_path {
        Some(p) if config_exists => kv("Config file:", format_args!("{} (loaded)", p.display()), w),
        Some(p) => kv(
            "Config file:",
            format_args!("{} (not found, using defaults)", p.display()),
            w,
        ),
        None => kv("Config file:", "(no config directory)", w),
    }
    println!();

    println!("Settings:");
    kv_indent("vendor_id:", format_args!("{:#06x}", config.vendor_id), w);
    let pids = config
        .product_ids
        .iter()
        .map(|p| format!("{p:#06x}"))
        .collect::<Vec<_>>()
        .join(", ");
    kv_indent("product_ids:", pids, w);
    kv_indent("interface:", config.interface, w);
    kv_indent("command_timeout_ms:", config.command_timeout_ms, w);
    kv_indent("format_timeout_ms:", config.format_timeout_ms, w);
    kv_indent(
        "health_check_interval_secs:",
        config.health_check_interval_secs,
        w,
    );
    kv_indent("max_retry_attempts:", config.max_retry_attempts, w);
    kv_indent("max_error_threshold:", config.max_error_threshold, w);
    kv_indent(
        "reconnect_initial_delay_ms:",
        config.reconnect_initial_delay_ms,
        w,
    );
    kv_indent("reconnect_max_delay_ms:", config.reconnect_max_delay_ms, w);
    kv_indent(
        "download_dir:",
        config.download_dir().display(),
        w,
    );

    if !problems.is_empty() {
        println!();
        println!("Problems:");
        for p in &problems {
            println!("  - {p}");
        }
    }
    Ok(())
}
