//! Backup discovery, interactive selection, and output-directory naming.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use dialoguer::Select;
use directories::BaseDirs;
use exhume_core::info::DeviceInfo;

/// The host-side sync software keeps one directory per device, named by
/// its 24- to 40-character identifier.
const UDID_NAME_MIN: usize = 24;
const UDID_NAME_MAX: usize = 40;

/// Default per-OS location of the MobileSync backup folder.
pub fn default_backup_root() -> Result<PathBuf> {
    let base = BaseDirs::new().context("could not determine home directory")?;
    #[cfg(target_os = "macos")]
    return Ok(base
        .home_dir()
        .join("Library/Application Support/MobileSync/Backup"));
    #[cfg(target_os = "windows")]
    return Ok(base
        .config_dir()
        .join("Apple Computer")
        .join("MobileSync")
        .join("Backup"));
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    Ok(base.home_dir().join(".config/mobilesync/backup"))
}

/// Lists backup directories under the given root, sorted by name.
pub fn list_backups(root: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(root)
        .with_context(|| format!("could not read backup folder {}", root.display()))?;

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if entry.file_type()?.is_dir()
            && (UDID_NAME_MIN..=UDID_NAME_MAX).contains(&name.len())
        {
            backups.push(entry.path());
        }
    }
    backups.sort();
    Ok(backups)
}

/// Prompts the user to pick one of the backups under `root`.
pub fn select_backup(root: &Path) -> Result<PathBuf> {
    let backups = list_backups(root)?;
    if backups.is_empty() {
        bail!("no backups found under {}", root.display());
    }

    let labels: Vec<String> = backups.iter().map(|path| describe(path)).collect();
    let choice = Select::new()
        .with_prompt("Select a backup")
        .items(&labels)
        .default(0)
        .interact()?;
    Ok(backups[choice].clone())
}

fn describe(path: &Path) -> String {
    let udid = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    match DeviceInfo::from_backup_dir(path) {
        Ok(Some(info)) if !info.device_name.is_empty() => format!(
            "{udid}  {} ({}), last backup {}",
            info.device_name,
            info.product_name,
            format_backup_time(info.last_backup_time()),
        ),
        _ => udid,
    }
}

fn format_backup_time(time: Option<SystemTime>) -> String {
    match time {
        Some(time) => DateTime::<Utc>::from(time)
            .format("%Y-%m-%d %H:%M")
            .to_string(),
        None => "unknown".to_string(),
    }
}

/// Builds the output directory for a backup: the chosen root, the
/// backup's directory name, and a device-name/date suffix when
/// `Info.plist` provides one. Pure so runs are reproducible.
pub fn output_directory(
    user_output: Option<&Path>,
    configured_output: Option<&Path>,
    backup_path: &Path,
    info: Option<&DeviceInfo>,
) -> Result<PathBuf> {
    let base = match (user_output, configured_output) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(path)) => path.to_path_buf(),
        (None, None) => {
            let dirs = BaseDirs::new().context("could not determine home directory")?;
            dirs.home_dir().join("exhume")
        }
    };
    let udid = backup_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "backup".to_string());

    let out = base.join(udid);
    match info {
        Some(info) if !info.device_name.is_empty() => {
            let mut suffix = sanitize_name(&info.device_name);
            if let Some(time) = info.last_backup_time() {
                let date = DateTime::<Utc>::from(time).format("%Y-%m-%d");
                suffix = format!("{suffix}_{date}");
            }
            Ok(out.join(suffix))
        }
        _ => Ok(out),
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter_map(|c| match c {
            '\'' => None,
            ' ' | '’' | '/' | '\\' => Some('_'),
            _ => Some(c),
        })
        .collect()
}
