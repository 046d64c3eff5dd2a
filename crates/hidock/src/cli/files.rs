//! File management: `files`, `download`, `delete`, `format`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use hidock_lib::OperationError;

use super::{
    FileEntry, FilesOutput, HidockError, RUNNING, Result, confirm, format_duration, human_bytes,
    load_config, open_device, print_json,
};

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(super) fn cmd_files(json: bool, config_path: Option<&Path>) -> Result<()> {
    let jd = open_device(&load_config(config_path))?;
    let files = jd.list_files()?;
    let total_bytes: u64 = files.iter().map(|f| u64::from(f.length)).sum();

    if json {
        return print_json(&FilesOutput {
            count: files.len(),
            total_bytes,
            files,
        });
    }

    if files.is_empty() {
        println!("No recordings on the device.");
        return Ok(());
    }

    let name_w = files.iter().map(|f| f.name.len()).max().unwrap_or(0).max(4);
    println!(
        "{:<name_w$}  {:>10}  {:>8}  {:<19}",
        "Name", "Size", "Duration", "Recorded"
    );
    for f in &files {
        println!("{}", file_row(f, name_w));
    }
    println!();
    println!(
        "{} recording{}, {}",
        files.len(),
        if files.len() == 1 { "" } else { "s" },
        human_bytes(total_bytes)
    );
    Ok(())
}

fn file_row(f: &FileEntry, name_w: usize) -> String {
    let recorded = f
        .recorded_at
        .map(|t| t.format(DATE_FORMAT).to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<name_w$}  {:>10}  {:>8}  {recorded}",
        f.name,
        human_bytes(u64::from(f.length)),
        format_duration(f.duration)
    )
}

/// Target path for `name` under `dir`. Only the final path component of
/// the device-supplied name is used.
fn target_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let file_name = Path::new(name)
        .file_name()
        .ok_or_else(|| HidockError::Config(format!("invalid file name: {name:?}")))?;
    Ok(dir.join(file_name))
}

/// Temp name next to the target, renamed into place on success.
fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

pub(super) fn cmd_download(
    name: &str,
    output: Option<&Path>,
    config_path: Option<&Path>,
) -> Result<()> {
    let config = load_config(config_path);
    let dir = output.map(Path::to_path_buf).unwrap_or_else(|| config.download_dir());
    let target = target_path(&dir, name)?;

    let jd = open_device(&config)?;
    let entry = jd
        .list_files()?
        .into_iter()
        .find(|f| f.name == name)
        .ok_or_else(|| OperationError::Unavailable(format!("{name}: not on the device")))?;

    std::fs::create_dir_all(&dir)?;
    let partial = partial_path(&target);
    let mut sink = BufWriter::new(File::create(&partial)?);

    println!(
        "Downloading {} ({}) to {}",
        entry.name,
        human_bytes(u64::from(entry.length)),
        target.display()
    );
    let mut last_percent = None;
    let result = jd.download_file(&entry.name, entry.length, &mut sink, |received, total| {
        let percent = if total == 0 { 100 } else { received * 100 / total };
        if last_percent != Some(percent) {
            eprint!("\r  {percent:>3}%  {}", human_bytes(received));
            std::io::stderr().flush().ok();
            last_percent = Some(percent);
        }
        RUNNING.load(Ordering::SeqCst)
    });
    eprintln!();

    let received = match result {
        Ok(n) => n,
        Err(e) => {
            drop(sink);
            if let Err(rm) = std::fs::remove_file(&partial) {
                log::warn!("could not remove {}: {rm}", partial.display());
            }
            return Err(e.into());
        }
    };
    drop(sink);
    std::fs::rename(&partial, &target)?;

    println!("Saved {} ({})", target.display(), human_bytes(received));
    Ok(())
}

pub(super) fn cmd_delete(name: &str, yes: bool, config_path: Option<&Path>) -> Result<()> {
    if !yes && !confirm(&format!("Delete {name} from the device?")) {
        println!("Aborted.");
        return Ok(());
    }
    let jd = open_device(&load_config(config_path))?;
    jd.delete_file(name)?;
    println!("Deleted {name}.");
    Ok(())
}

pub(super) fn cmd_format(yes: bool, config_path: Option<&Path>) -> Result<()> {
    if !yes {
        println!("WARNING: This erases every recording on the device's storage card.");
        println!();
        if !confirm("Continue?") {
            println!("Aborted.");
            return Ok(());
        }
    }
    let jd = open_device(&load_config(config_path))?;
    println!("Formatting, this can take up to a minute...");
    jd.format_card()?;
    println!("Storage card formatted.");
    Ok(())
}
