use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("backup not found at {0}")]
    BackupNotFound(PathBuf),

    #[error("Manifest.plist not found in backup")]
    MissingManifest,

    #[error("Manifest.plist is missing BackupKeyBag or ManifestKey")]
    MissingManifestComponent,

    #[error("malformed keybag: {0}")]
    MalformedKeybag(String),

    #[error("manifest key has invalid length {0}")]
    InvalidManifestKeyLength(usize),

    #[error("wrong passcode")]
    WrongPasscode,

    #[error("no usable key for protection class {0}")]
    ClassKeyUnavailable(u32),

    #[error("corrupt file record: {0}")]
    CorruptFileBlob(String),

    #[error("wrapped key has invalid length {0}")]
    BadWrappedKeyLength(usize),

    #[error("key unwrap integrity check failed")]
    UnwrapIntegrity,

    #[error("target file not found: {0}")]
    TargetFileNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("file index error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type BackupResult<T> = Result<T, BackupError>;
