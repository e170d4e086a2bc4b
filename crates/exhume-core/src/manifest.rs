//! The manifest descriptor and the decrypted file index.

use std::ops::ControlFlow;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;

use crate::error::{BackupError, BackupResult};
use crate::keybag::WRAPPED_KEY_LEN;

/// The `ManifestKey` blob is a little-endian protection class id
/// followed by the wrapped database key.
const CLASS_TAG_LEN: usize = 4;

#[derive(Deserialize)]
struct RawDescriptor {
    #[serde(rename = "BackupKeyBag")]
    backup_keybag: Option<plist::Data>,
    #[serde(rename = "ManifestKey")]
    manifest_key: Option<plist::Data>,
}

/// The two artifacts `Manifest.plist` must carry: the TLV keybag and
/// the wrapped file-index key.
pub struct ManifestDescriptor {
    pub backup_keybag: Vec<u8>,
    pub manifest_key: Vec<u8>,
}

impl ManifestDescriptor {
    pub fn from_file(path: &Path) -> BackupResult<Self> {
        let raw: RawDescriptor = plist::from_file(path)?;
        match (raw.backup_keybag, raw.manifest_key) {
            (Some(keybag), Some(key)) => Ok(Self {
                backup_keybag: keybag.into(),
                manifest_key: key.into(),
            }),
            _ => Err(BackupError::MissingManifestComponent),
        }
    }

    /// Splits `ManifestKey` into its protection class and the 40-byte
    /// wrapped database key.
    pub fn manifest_key_parts(&self) -> BackupResult<(u32, &[u8])> {
        if self.manifest_key.len() != CLASS_TAG_LEN + WRAPPED_KEY_LEN {
            return Err(BackupError::InvalidManifestKeyLength(self.manifest_key.len()));
        }
        let mut class = [0u8; 4];
        class.copy_from_slice(&self.manifest_key[..CLASS_TAG_LEN]);
        Ok((u32::from_le_bytes(class), &self.manifest_key[CLASS_TAG_LEN..]))
    }
}

/// One row of the `Files` table.
pub struct FileEntry {
    /// 40-character lowercase hex content address.
    pub file_id: String,
    pub domain: String,
    pub relative_path: String,
    /// Keyed-archive blob describing the file.
    pub blob: Vec<u8>,
}

/// Read-only handle on the decrypted index database.
pub struct FileIndex {
    conn: Connection,
}

impl FileIndex {
    pub fn open(path: &Path) -> BackupResult<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self { conn })
    }

    /// Streams every file record, ordered by domain then relative path
    /// so output is deterministic across runs.
    pub fn for_each_entry<F>(&self, mut handler: F) -> BackupResult<()>
    where
        F: FnMut(FileEntry) -> BackupResult<ControlFlow<()>>,
    {
        let mut stmt = self.conn.prepare(
            "SELECT fileID, domain, relativePath, file FROM Files ORDER BY domain, relativePath",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let entry = FileEntry {
                file_id: row.get(0)?,
                domain: row.get(1)?,
                relative_path: row.get(2)?,
                blob: row.get(3)?,
            };
            if let ControlFlow::Break(()) = handler(entry)? {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plist::{Dictionary, Value};

    fn write_manifest_plist(dir: &Path, keybag: Option<&[u8]>, key: Option<&[u8]>) -> std::path::PathBuf {
        let mut dict = Dictionary::new();
        if let Some(keybag) = keybag {
            dict.insert("BackupKeyBag".into(), Value::Data(keybag.to_vec()));
        }
        if let Some(key) = key {
            dict.insert("ManifestKey".into(), Value::Data(key.to_vec()));
        }
        dict.insert("Version".into(), Value::String("10.0".into()));
        let path = dir.join("Manifest.plist");
        let mut out = Vec::new();
        Value::Dictionary(dict).to_writer_binary(&mut out).unwrap();
        std::fs::write(&path, out).unwrap();
        path
    }

    #[test]
    fn descriptor_requires_both_components() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest_plist(dir.path(), Some(b"keybag".as_slice()), None);
        assert!(matches!(
            ManifestDescriptor::from_file(&path),
            Err(BackupError::MissingManifestComponent)
        ));

        let path = write_manifest_plist(dir.path(), Some(b"keybag".as_slice()), Some([1u8; 44].as_slice()));
        let descriptor = ManifestDescriptor::from_file(&path).unwrap();
        assert_eq!(descriptor.backup_keybag, b"keybag");
        assert_eq!(descriptor.manifest_key.len(), 44);
    }

    #[test]
    fn manifest_key_splits_class_and_wrapped_key() {
        let mut key = 7u32.to_le_bytes().to_vec();
        key.extend_from_slice(&[0xaa; WRAPPED_KEY_LEN]);
        let descriptor = ManifestDescriptor {
            backup_keybag: Vec::new(),
            manifest_key: key,
        };
        let (class, wrapped) = descriptor.manifest_key_parts().unwrap();
        assert_eq!(class, 7);
        assert_eq!(wrapped, &[0xaa; WRAPPED_KEY_LEN]);
    }

    #[test]
    fn manifest_key_rejects_wrong_length() {
        let descriptor = ManifestDescriptor {
            backup_keybag: Vec::new(),
            manifest_key: vec![0u8; 20],
        };
        assert!(matches!(
            descriptor.manifest_key_parts(),
            Err(BackupError::InvalidManifestKeyLength(20))
        ));
    }

    #[test]
    fn index_iterates_in_deterministic_order() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("index.db");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE Files (fileID TEXT, domain TEXT, relativePath TEXT, flags INTEGER, file BLOB);",
        )
        .unwrap();
        for (id, domain, path) in [
            ("cc", "HomeDomain", "b.txt"),
            ("aa", "AppDomain", "z.txt"),
            ("bb", "HomeDomain", "a.txt"),
        ] {
            conn.execute(
                "INSERT INTO Files (fileID, domain, relativePath, flags, file) VALUES (?1, ?2, ?3, 1, x'00')",
                (id, domain, path),
            )
            .unwrap();
        }
        drop(conn);

        let index = FileIndex::open(&db_path).unwrap();
        let mut seen = Vec::new();
        index
            .for_each_entry(|entry| {
                seen.push(entry.file_id);
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        assert_eq!(seen, vec!["aa", "bb", "cc"]);
    }

    #[test]
    fn iteration_stops_on_break() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("index.db");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE Files (fileID TEXT, domain TEXT, relativePath TEXT, flags INTEGER, file BLOB);
             INSERT INTO Files VALUES ('aa', 'd', 'a', 1, x'00');
             INSERT INTO Files VALUES ('bb', 'd', 'b', 1, x'00');",
        )
        .unwrap();
        drop(conn);

        let index = FileIndex::open(&db_path).unwrap();
        let mut count = 0;
        index
            .for_each_entry(|_| {
                count += 1;
                Ok(ControlFlow::Break(()))
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
