//! Decryption and extraction of encrypted iOS device backups.
//!
//! A backup directory holds content-addressed ciphertext blobs plus two
//! index artifacts: `Manifest.plist` (carrying a binary keybag and a
//! wrapped database key) and `Manifest.db` (an AES-CBC-encrypted SQLite
//! file index). Recovering the original files takes three nested layers
//! of key unwrapping:
//!
//! 1. The passcode is stretched through PBKDF2-HMAC-SHA256 and then
//!    PBKDF2-HMAC-SHA1 into the passcode key ([`keybag`]).
//! 2. The passcode key unwraps one AES key per protection class
//!    (RFC 3394, [`crypto`]).
//! 3. Class keys unwrap the database key and each per-file key, which
//!    decrypt the index and the file contents ([`extract`]).
//!
//! [`extract::extract`] runs the whole pipeline; the other modules are
//! exposed for callers that need the individual stages.

pub mod archive;
pub mod crypto;
pub mod error;
pub mod extract;
pub mod info;
pub mod keybag;
pub mod manifest;

pub use error::{BackupError, BackupResult};
pub use extract::{
    extract, ExtractOptions, ExtractSummary, Layout, NoProgress, Progress, UnencryptedPolicy,
};
pub use keybag::Keybag;
