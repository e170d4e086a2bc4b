//! The backup keybag: TLV parsing and the passcode key ladder.
//!
//! `Manifest.plist` embeds a binary keybag as a stream of
//! tag-length-value records (`tag: 4 ASCII bytes`, `length: u32 BE`,
//! then `length` payload bytes). The keybag carries global passcode
//! parameters plus one wrapped AES key per protection class; unlocking
//! it with the passcode is what makes every other key in the backup
//! reachable.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::{self, UnwrapError, KEY_LEN};
use crate::error::{BackupError, BackupResult};

/// `WRAP` bit marking a class key as wrapped with the passcode key.
pub const WRAP_PASSCODE: u32 = 0x2;

/// Wrapped keys carried in file records and the manifest key are always
/// a 32-byte key plus the 8-byte RFC 3394 header.
pub const WRAPPED_KEY_LEN: usize = 40;

const TLV_HEADER_LEN: usize = 8;
const MAX_KEYBAG_TYPE: u32 = 3;

/// One protection class entry of the keybag.
pub struct ClassKey {
    pub class: u32,
    pub wrap: u32,
    pub key_type: u32,
    pub uuid: Vec<u8>,
    pub wrapped_key: Vec<u8>,
    /// Set exactly once by a successful passcode unlock.
    key: Option<Zeroizing<[u8; KEY_LEN]>>,
}

impl ClassKey {
    fn new(uuid: Vec<u8>) -> Self {
        Self {
            class: 0,
            wrap: 0,
            key_type: 0,
            uuid,
            wrapped_key: Vec::new(),
            key: None,
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.key.is_some()
    }
}

/// Parsed keybag: global attributes plus the class-key table.
pub struct Keybag {
    pub kind: u32,
    pub uuid: Vec<u8>,
    pub wrap: u32,
    attributes: HashMap<String, Vec<u8>>,
    class_keys: BTreeMap<u32, ClassKey>,
}

impl Keybag {
    /// Decodes a keybag TLV blob.
    ///
    /// The first `UUID` record identifies the keybag itself; every
    /// later `UUID` opens a new class-key block. A block is committed
    /// when the next one starts (or at end of input), and only if its
    /// `CLAS` is non-zero.
    pub fn parse(blob: &[u8]) -> BackupResult<Self> {
        let mut keybag = Keybag {
            kind: 0,
            uuid: Vec::new(),
            wrap: 0,
            attributes: HashMap::new(),
            class_keys: BTreeMap::new(),
        };
        let mut seen_keybag_uuid = false;
        let mut current: Option<ClassKey> = None;

        let mut cursor = 0usize;
        while cursor < blob.len() {
            if blob.len() - cursor < TLV_HEADER_LEN {
                return Err(malformed("truncated record header"));
            }
            let tag = std::str::from_utf8(&blob[cursor..cursor + 4])
                .map_err(|_| malformed("non-ASCII record tag"))?
                .to_owned();
            let len = read_u32(&blob[cursor + 4..cursor + 8]) as usize;
            cursor += TLV_HEADER_LEN;
            if blob.len() - cursor < len {
                return Err(malformed(format!("truncated payload for tag {tag}")));
            }
            let value = &blob[cursor..cursor + len];
            cursor += len;

            match tag.as_str() {
                "TYPE" => {
                    keybag.kind = tag_u32(&tag, value)?;
                    if keybag.kind > MAX_KEYBAG_TYPE {
                        return Err(malformed(format!("unsupported keybag type {}", keybag.kind)));
                    }
                }
                "UUID" => {
                    if !seen_keybag_uuid {
                        keybag.uuid = value.to_vec();
                        seen_keybag_uuid = true;
                    } else {
                        keybag.commit(current.take());
                        current = Some(ClassKey::new(value.to_vec()));
                    }
                }
                "WRAP" => match current.as_mut() {
                    Some(class_key) => class_key.wrap = tag_u32(&tag, value)?,
                    None => keybag.wrap = tag_u32(&tag, value)?,
                },
                "CLAS" => {
                    if let Some(class_key) = current.as_mut() {
                        class_key.class = tag_u32(&tag, value)?;
                    }
                }
                "WPKY" => {
                    if let Some(class_key) = current.as_mut() {
                        class_key.wrapped_key = value.to_vec();
                    }
                }
                "KTYP" => {
                    if let Some(class_key) = current.as_mut() {
                        class_key.key_type = tag_u32(&tag, value)?;
                    }
                }
                _ => {
                    keybag.attributes.insert(tag, value.to_vec());
                }
            }
        }
        keybag.commit(current.take());

        keybag.validate_passcode_attributes()?;
        debug!(classes = keybag.class_keys.len(), kind = keybag.kind, "keybag parsed");
        Ok(keybag)
    }

    fn commit(&mut self, class_key: Option<ClassKey>) {
        if let Some(class_key) = class_key {
            // zero-CLAS sentinel blocks carry no usable key
            if class_key.class != 0 {
                self.class_keys.insert(class_key.class, class_key);
            }
        }
    }

    fn validate_passcode_attributes(&self) -> BackupResult<()> {
        for (tag, min_len) in [("DPSL", 1), ("DPIC", 4), ("SALT", 1), ("ITER", 4)] {
            match self.attributes.get(tag) {
                None => return Err(malformed(format!("missing required attribute {tag}"))),
                Some(value) if value.len() < min_len => {
                    return Err(malformed(format!("undersized attribute {tag}")))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn attribute(&self, tag: &str) -> Option<&[u8]> {
        self.attributes.get(tag).map(Vec::as_slice)
    }

    pub fn class_key(&self, class: u32) -> Option<&ClassKey> {
        self.class_keys.get(&class)
    }

    pub fn class_keys(&self) -> impl Iterator<Item = &ClassKey> {
        self.class_keys.values()
    }

    /// Two-stage passcode key derivation:
    ///
    /// ```text
    /// stage1       = PBKDF2-HMAC-SHA256(passcode, DPSL, DPIC)
    /// passcode_key = PBKDF2-HMAC-SHA1(stage1, SALT, ITER)
    /// ```
    ///
    /// Iteration counts come from the keybag and are honored as-is.
    pub fn derive_passcode_key(&self, passcode: &[u8]) -> BackupResult<Zeroizing<[u8; KEY_LEN]>> {
        let dpsl = self.required_attribute("DPSL")?;
        let salt = self.required_attribute("SALT")?;
        let dpic = read_u32(&self.required_attribute("DPIC")?[..4]);
        let iterations = read_u32(&self.required_attribute("ITER")?[..4]);

        let stage1 = crypto::pbkdf2_sha256(passcode, dpsl, dpic);
        Ok(crypto::pbkdf2_sha1(&stage1[..], salt, iterations))
    }

    /// Unwraps every passcode-wrapped class key with the given passcode.
    ///
    /// Class keys without the passcode wrap bit are device-bound and
    /// left locked; files referencing them are skipped downstream.
    pub fn unlock_with_passcode(&mut self, passcode: &[u8]) -> BackupResult<()> {
        let passcode_key = self.derive_passcode_key(passcode)?;
        for class_key in self.class_keys.values_mut() {
            if class_key.wrap & WRAP_PASSCODE == 0 || class_key.key.is_some() {
                continue;
            }
            let unwrapped = crypto::aes_key_unwrap(&passcode_key, &class_key.wrapped_key)
                .map_err(|err| match err {
                    UnwrapError::Integrity => BackupError::WrongPasscode,
                    UnwrapError::BadLength(len) => malformed(format!(
                        "class {} wrapped key has invalid length {len}",
                        class_key.class
                    )),
                })?;
            if unwrapped.len() != KEY_LEN {
                return Err(malformed(format!(
                    "class {} key unwrapped to {} bytes",
                    class_key.class,
                    unwrapped.len()
                )));
            }
            let mut key = Zeroizing::new([0u8; KEY_LEN]);
            key.copy_from_slice(&unwrapped);
            class_key.key = Some(key);
        }
        Ok(())
    }

    pub fn unlocked_classes(&self) -> usize {
        self.class_keys.values().filter(|ck| ck.is_unlocked()).count()
    }

    /// Unwraps a 40-byte wrapped key under the named protection class.
    pub fn unwrap_key_for_class(
        &self,
        class: u32,
        wrapped: &[u8],
    ) -> BackupResult<Zeroizing<[u8; KEY_LEN]>> {
        let class_key = self
            .class_keys
            .get(&class)
            .ok_or(BackupError::ClassKeyUnavailable(class))?;
        let key = class_key
            .key
            .as_ref()
            .ok_or(BackupError::ClassKeyUnavailable(class))?;
        if wrapped.len() != WRAPPED_KEY_LEN {
            return Err(BackupError::BadWrappedKeyLength(wrapped.len()));
        }
        let unwrapped = crypto::aes_key_unwrap(key, wrapped).map_err(|err| match err {
            UnwrapError::Integrity => BackupError::UnwrapIntegrity,
            UnwrapError::BadLength(len) => BackupError::BadWrappedKeyLength(len),
        })?;
        let mut out = Zeroizing::new([0u8; KEY_LEN]);
        out.copy_from_slice(&unwrapped);
        Ok(out)
    }

    fn required_attribute(&self, tag: &str) -> BackupResult<&[u8]> {
        self.attribute(tag)
            .ok_or_else(|| malformed(format!("missing required attribute {tag}")))
    }
}

fn malformed(msg: impl Into<String>) -> BackupError {
    BackupError::MalformedKeybag(msg.into())
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

fn tag_u32(tag: &str, value: &[u8]) -> BackupResult<u32> {
    if value.len() < 4 {
        return Err(malformed(format!("tag {tag} payload shorter than 4 bytes")));
    }
    Ok(read_u32(value))
}
