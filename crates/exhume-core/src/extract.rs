//! The extraction pipeline: backup directory + passcode in, plaintext
//! files out.
//!
//! Everything before the row loop is fatal on failure; inside the loop
//! a failure only costs that row. Output paths are a pure function of
//! the input backup and the options, so two runs over the same backup
//! produce byte-identical trees.

use std::fs::{self, FileTimes, OpenOptions};
use std::io::Write;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, error, info, warn};

use crate::archive::{self, FileMetadata};
use crate::crypto;
use crate::error::{BackupError, BackupResult};
use crate::keybag::Keybag;
use crate::manifest::{FileEntry, FileIndex, ManifestDescriptor};

/// Name of the decrypted index written into the output directory.
pub const DECRYPTED_INDEX_NAME: &str = "Decrypted_Manifest.db";

/// Ledger of files that were stored without per-file encryption.
pub const SKIPPED_LEDGER_NAME: &str = "skipped.txt";

/// Where extracted files land relative to the output directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Layout {
    /// `<out>/<file_id>-<basename>` for every file.
    #[default]
    Flat,
    /// `<out>/<domain>/<relative_path>`, with timestamps restored.
    Preserve,
}

/// How to handle files the backup stores without per-file encryption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnencryptedPolicy {
    /// Write them flat regardless of [`Layout`] and record them in the
    /// ledger.
    #[default]
    FlatCopy,
    /// Write them wherever the layout puts encrypted files, and record
    /// them in the ledger.
    HonorLayout,
    /// Leave them out entirely.
    Skip,
}

#[derive(Debug, Default, Clone)]
pub struct ExtractOptions {
    /// When set, only the first file whose relative path contains this
    /// substring is extracted.
    pub filter: Option<String>,
    pub layout: Layout,
    pub unencrypted_policy: UnencryptedPolicy,
}

/// Callback invoked once per written file.
pub trait Progress {
    fn file_written(&self, relative_path: &str);
}

/// Progress sink that reports nothing.
pub struct NoProgress;

impl Progress for NoProgress {
    fn file_written(&self, _relative_path: &str) {}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Files decrypted and written.
    pub written: u64,
    /// Files copied out without per-file encryption.
    pub unencrypted: u64,
    /// Rows skipped because of per-file errors.
    pub skipped: u64,
}

/// Decrypts a backup and writes the recovered files under `out_dir`.
pub fn extract(
    backup_dir: &Path,
    passcode: &str,
    out_dir: &Path,
    options: &ExtractOptions,
    progress: &dyn Progress,
) -> BackupResult<ExtractSummary> {
    if !backup_dir.is_dir() {
        return Err(BackupError::BackupNotFound(backup_dir.to_path_buf()));
    }
    let manifest_path = backup_dir.join("Manifest.plist");
    if !manifest_path.is_file() {
        return Err(BackupError::MissingManifest);
    }

    let descriptor = ManifestDescriptor::from_file(&manifest_path)?;
    let mut keybag = Keybag::parse(&descriptor.backup_keybag)?;
    keybag.unlock_with_passcode(passcode.as_bytes())?;
    info!(unlocked = keybag.unlocked_classes(), "keybag unlocked");

    let (class, wrapped_db_key) = descriptor.manifest_key_parts()?;
    let db_key = keybag.unwrap_key_for_class(class, wrapped_db_key)?;

    fs::create_dir_all(out_dir)?;
    let encrypted_index = fs::read(backup_dir.join("Manifest.db"))?;
    let decrypted_index = crypto::aes_cbc_decrypt(&db_key, &encrypted_index);
    let index_path = out_dir.join(DECRYPTED_INDEX_NAME);
    write_private(&index_path, &decrypted_index)?;
    debug!(bytes = decrypted_index.len(), "file index decrypted");

    let index = FileIndex::open(&index_path)?;
    let mut run = Extraction {
        backup_dir,
        out_dir,
        keybag: &keybag,
        options,
        progress,
        summary: ExtractSummary::default(),
        matched: false,
    };
    index.for_each_entry(|entry| Ok(run.process(&entry)))?;

    if let Some(filter) = &options.filter {
        if !run.matched {
            return Err(BackupError::TargetFileNotFound(filter.clone()));
        }
    }
    info!(
        written = run.summary.written,
        unencrypted = run.summary.unencrypted,
        skipped = run.summary.skipped,
        "extraction complete"
    );
    Ok(run.summary)
}

struct Extraction<'a> {
    backup_dir: &'a Path,
    out_dir: &'a Path,
    keybag: &'a Keybag,
    options: &'a ExtractOptions,
    progress: &'a dyn Progress,
    summary: ExtractSummary,
    matched: bool,
}

impl Extraction<'_> {
    fn process(&mut self, entry: &FileEntry) -> ControlFlow<()> {
        if let Some(filter) = &self.options.filter {
            if !entry.relative_path.contains(filter.as_str()) {
                return ControlFlow::Continue(());
            }
        }

        let meta = match archive::decode_file_blob(&entry.blob) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(file_id = %entry.file_id, %err, "skipping file with undecodable record");
                self.summary.skipped += 1;
                return ControlFlow::Continue(());
            }
        };

        if entry.file_id.get(..2).is_none() {
            warn!(file_id = %entry.file_id, "skipping file with malformed content address");
            self.summary.skipped += 1;
            return ControlFlow::Continue(());
        }

        if !meta.is_encrypted() {
            if meta.size > 0 {
                self.copy_unencrypted(entry, &meta);
            }
            return ControlFlow::Continue(());
        }

        if self.write_encrypted(entry, &meta) && self.options.filter.is_some() {
            self.matched = true;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    /// Decrypts one file and writes it; returns whether it was written.
    fn write_encrypted(&mut self, entry: &FileEntry, meta: &FileMetadata) -> bool {
        let file_key = match self
            .keybag
            .unwrap_key_for_class(meta.protection_class, &meta.wrapped_key)
        {
            Ok(key) => key,
            Err(err) => {
                warn!(
                    file_id = %entry.file_id,
                    path = %entry.relative_path,
                    %err,
                    "skipping file without a usable key"
                );
                self.summary.skipped += 1;
                return false;
            }
        };

        let ciphertext = match fs::read(self.content_blob_path(entry)) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(file_id = %entry.file_id, %err, "skipping unreadable content blob");
                self.summary.skipped += 1;
                return false;
            }
        };
        let mut plaintext = crypto::aes_cbc_decrypt(&file_key, &ciphertext);
        truncate_to_size(&mut plaintext, meta.size);

        let (destination, preserved) = match self.options.layout {
            Layout::Flat => (self.flat_path(entry), false),
            Layout::Preserve => (self.preserve_path(entry), true),
        };
        if let Err(err) = self.write_output(&destination, &plaintext, meta, preserved) {
            error!(path = %destination.display(), %err, "could not write decrypted file");
            self.summary.skipped += 1;
            return false;
        }

        self.summary.written += 1;
        self.progress.file_written(&entry.relative_path);
        true
    }

    /// Copies a file the backup stores in the clear and records it in
    /// the ledger.
    fn copy_unencrypted(&mut self, entry: &FileEntry, meta: &FileMetadata) {
        if self.options.unencrypted_policy == UnencryptedPolicy::Skip {
            return;
        }

        let mut data = match fs::read(self.content_blob_path(entry)) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(file_id = %entry.file_id, %err, "skipping unreadable content blob");
                self.summary.skipped += 1;
                return;
            }
        };
        truncate_to_size(&mut data, meta.size);

        let (destination, preserved) = match (self.options.unencrypted_policy, self.options.layout)
        {
            (UnencryptedPolicy::HonorLayout, Layout::Preserve) => (self.preserve_path(entry), true),
            _ => (self.flat_path(entry), false),
        };
        if let Err(err) = self.write_output(&destination, &data, meta, preserved) {
            error!(path = %destination.display(), %err, "could not write unencrypted file");
            self.summary.skipped += 1;
            return;
        }
        if let Err(err) = self.append_to_ledger(entry) {
            error!(%err, "could not record unencrypted file in ledger");
        }

        self.summary.unencrypted += 1;
        self.progress.file_written(&entry.relative_path);
    }

    /// Writes one output file; timestamps are restored only on files
    /// placed at their preserved domain/relative path.
    fn write_output(
        &self,
        destination: &Path,
        data: &[u8],
        meta: &FileMetadata,
        preserved: bool,
    ) -> std::io::Result<()> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        write_private(destination, data)?;
        if preserved {
            set_file_times(destination, meta.birth, meta.last_modified)?;
        }
        Ok(())
    }

    fn append_to_ledger(&self, entry: &FileEntry) -> std::io::Result<()> {
        let mut ledger = OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.out_dir.join(SKIPPED_LEDGER_NAME))?;
        writeln!(
            ledger,
            "{}\t{}\t{}",
            entry.file_id, entry.domain, entry.relative_path
        )
    }

    /// Content blobs are sharded by the first two characters of the
    /// file id.
    fn content_blob_path(&self, entry: &FileEntry) -> PathBuf {
        let shard = entry.file_id[..2].to_ascii_lowercase();
        self.backup_dir.join(shard).join(&entry.file_id)
    }

    fn flat_path(&self, entry: &FileEntry) -> PathBuf {
        self.out_dir
            .join(format!("{}-{}", entry.file_id, base_name(&entry.relative_path)))
    }

    fn preserve_path(&self, entry: &FileEntry) -> PathBuf {
        self.out_dir.join(&entry.domain).join(&entry.relative_path)
    }
}

fn base_name(path: &str) -> &str {
    match path.rsplit('/').next() {
        Some(base) if !base.is_empty() => base,
        _ => path,
    }
}

fn truncate_to_size(data: &mut Vec<u8>, size: i64) {
    let size = usize::try_from(size).unwrap_or(usize::MAX);
    if data.len() > size {
        data.truncate(size);
    }
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    fs::write(path, data)
}

fn set_file_times(path: &Path, birth: i64, last_modified: i64) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    let times = FileTimes::new()
        .set_accessed(epoch_time(birth))
        .set_modified(epoch_time(last_modified));
    file.set_times(times)
}

fn epoch_time(seconds: i64) -> SystemTime {
    match u64::try_from(seconds) {
        Ok(seconds) => SystemTime::UNIX_EPOCH + Duration::from_secs(seconds),
        Err(_) => SystemTime::UNIX_EPOCH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_takes_the_last_component() {
        assert_eq!(base_name("Library/Preferences/a.plist"), "a.plist");
        assert_eq!(base_name("flat.txt"), "flat.txt");
        assert_eq!(base_name("trailing/"), "trailing/");
        assert_eq!(base_name(""), "");
    }

    #[test]
    fn truncation_never_grows_the_buffer() {
        let mut data = vec![1, 2, 3, 4, 5];
        truncate_to_size(&mut data, 3);
        assert_eq!(data, vec![1, 2, 3]);

        let mut data = vec![1, 2, 3];
        truncate_to_size(&mut data, 10);
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn epoch_time_clamps_negative_values() {
        assert_eq!(epoch_time(-5), SystemTime::UNIX_EPOCH);
        assert_eq!(
            epoch_time(100),
            SystemTime::UNIX_EPOCH + Duration::from_secs(100)
        );
    }
}
