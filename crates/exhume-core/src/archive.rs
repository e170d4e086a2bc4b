//! Keyed-archive file records.
//!
//! The `file` column of the index database holds a keyed-archive plist:
//! an object table under `$objects` addressed by uid, with the record
//! dictionary at `$top.root`. Only the root dictionary and its one-hop
//! `EncryptionKey` reference are resolved; nothing else in the graph is
//! followed.

use std::io::Cursor;

use plist::{Dictionary, Value};

use crate::error::{BackupError, BackupResult};
use crate::keybag::WRAPPED_KEY_LEN;

/// Some writers prefix `NS.data` with a redundant 4-byte class tag.
const CLASS_TAG_LEN: usize = 4;

/// Metadata for one file entry, decoded from its archive blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub protection_class: u32,
    /// Wrapped per-file key; empty when the file is stored unencrypted.
    pub wrapped_key: Vec<u8>,
    pub size: i64,
    /// Seconds since the Unix epoch.
    pub birth: i64,
    /// Seconds since the Unix epoch.
    pub last_modified: i64,
}

impl FileMetadata {
    pub fn is_encrypted(&self) -> bool {
        !self.wrapped_key.is_empty()
    }
}

/// Decodes a file record blob into [`FileMetadata`].
pub fn decode_file_blob(blob: &[u8]) -> BackupResult<FileMetadata> {
    let value = Value::from_reader(Cursor::new(blob))
        .map_err(|err| corrupt(format!("not a plist: {err}")))?;
    let archive = value
        .as_dictionary()
        .ok_or_else(|| corrupt("archive is not a dictionary"))?;
    let objects = archive
        .get("$objects")
        .and_then(Value::as_array)
        .ok_or_else(|| corrupt("missing $objects table"))?;
    let root_uid = archive
        .get("$top")
        .and_then(Value::as_dictionary)
        .and_then(|top| top.get("root"))
        .and_then(as_uid)
        .ok_or_else(|| corrupt("missing root uid"))?;

    let root = objects
        .get(root_uid as usize)
        .ok_or_else(|| corrupt("root uid out of range"))?
        .as_dictionary()
        .ok_or_else(|| corrupt("root object is not a dictionary"))?;

    let protection_class = int_field(root, "ProtectionClass")?.unwrap_or(0);
    let protection_class = u32::try_from(protection_class)
        .map_err(|_| corrupt("protection class out of range"))?;
    let size = int_field(root, "Size")?.unwrap_or(0);
    if size < 0 {
        return Err(corrupt("negative file size"));
    }
    let birth = int_field(root, "Birth")?.unwrap_or(0);
    let last_modified = int_field(root, "LastModified")?.unwrap_or(0);

    // uid 0 points at the archive's $null placeholder; out-of-range uids
    // are treated the same as an absent key.
    let wrapped_key = match root.get("EncryptionKey").and_then(as_uid) {
        Some(uid) if uid > 0 && (uid as usize) < objects.len() => {
            let key_object = objects[uid as usize]
                .as_dictionary()
                .ok_or_else(|| corrupt("encryption key object is not a dictionary"))?;
            let data = key_object
                .get("NS.data")
                .and_then(Value::as_data)
                .ok_or_else(|| corrupt("encryption key object has no NS.data"))?;
            if data.len() >= CLASS_TAG_LEN + WRAPPED_KEY_LEN {
                data[CLASS_TAG_LEN..].to_vec()
            } else {
                data.to_vec()
            }
        }
        _ => Vec::new(),
    };

    Ok(FileMetadata {
        protection_class,
        wrapped_key,
        size,
        birth,
        last_modified,
    })
}

fn corrupt(msg: impl Into<String>) -> BackupError {
    BackupError::CorruptFileBlob(msg.into())
}

fn as_uid(value: &Value) -> Option<u64> {
    match value {
        Value::Uid(uid) => Some(uid.get()),
        _ => None,
    }
}

/// Numeric fields are usually integers, but some writers emit them as
/// whole-valued floats; both decode.
fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(n) => n.as_signed(),
        Value::Real(f) if f.fract() == 0.0 => Some(*f as i64),
        _ => None,
    }
}

fn int_field(dict: &Dictionary, name: &str) -> BackupResult<Option<i64>> {
    match dict.get(name) {
        None => Ok(None),
        Some(value) => coerce_int(value)
            .map(Some)
            .ok_or_else(|| corrupt(format!("field {name} is not numeric"))),
    }
}
