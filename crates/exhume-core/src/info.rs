//! Device summaries from a backup's `Info.plist`.

use std::path::Path;
use std::time::SystemTime;

use serde::Deserialize;

use crate::error::BackupResult;

/// The subset of `Info.plist` worth showing when picking a backup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "Device Name", default)]
    pub device_name: String,
    #[serde(rename = "Product Name", default)]
    pub product_name: String,
    #[serde(rename = "Product Version", default)]
    pub product_version: String,
    #[serde(rename = "Serial Number", default)]
    pub serial_number: String,
    #[serde(rename = "Unique Identifier", default)]
    pub unique_identifier: String,
    #[serde(rename = "Last Backup Date")]
    pub last_backup_date: Option<plist::Date>,
}

impl DeviceInfo {
    /// Reads `Info.plist` from a backup directory; `Ok(None)` when the
    /// backup does not carry one.
    pub fn from_backup_dir(dir: &Path) -> BackupResult<Option<Self>> {
        let path = dir.join("Info.plist");
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(plist::from_file(path)?))
    }

    pub fn last_backup_time(&self) -> Option<SystemTime> {
        self.last_backup_date.map(SystemTime::from)
    }
}
