//! AES and PBKDF2 primitives for the backup key ladder.
//!
//! Every key in a backup is reachable from the passcode through two
//! PBKDF2 stages and one or two AES key-unwrap steps; file contents and
//! the file index are AES-256-CBC with a zero IV and no padding. These
//! helpers are deliberately small and take fixed-size keys so the
//! length invariants live at the call sites that produce them.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, KeyInit, KeyIvInit};
use aes::Aes256;
use sha1::Sha1;
use sha2::Sha256;
use zeroize::Zeroizing;

type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Derived keys are always 256-bit.
pub const KEY_LEN: usize = 32;

const BLOCK_LEN: usize = 16;
const SEMIBLOCK_LEN: usize = 8;

/// RFC 3394 initial value, recovered intact only when the KEK matches.
const INTEGRITY_VALUE: u64 = 0xa6a6_a6a6_a6a6_a6a6;

/// Failure modes of [`aes_key_unwrap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwrapError {
    /// Input is not a positive multiple of 8 bytes of at least 16.
    BadLength(usize),
    /// The recovered initial value was not `0xa6a6a6a6a6a6a6a6`.
    Integrity,
}

/// AES key unwrap (RFC 3394 inverse).
///
/// Returns the full plaintext only when the final integrity value checks
/// out; there are no partial outputs.
pub fn aes_key_unwrap(
    kek: &[u8; KEY_LEN],
    wrapped: &[u8],
) -> Result<Zeroizing<Vec<u8>>, UnwrapError> {
    if wrapped.len() < 2 * SEMIBLOCK_LEN || wrapped.len() % SEMIBLOCK_LEN != 0 {
        return Err(UnwrapError::BadLength(wrapped.len()));
    }
    let n = wrapped.len() / SEMIBLOCK_LEN - 1;
    let cipher = Aes256::new(GenericArray::from_slice(kek));

    let mut a = read_u64_be(&wrapped[..SEMIBLOCK_LEN]);
    let mut r: Zeroizing<Vec<u8>> = Zeroizing::new(wrapped[SEMIBLOCK_LEN..].to_vec());

    for j in (0..6u64).rev() {
        for i in (1..=n).rev() {
            let t = n as u64 * j + i as u64;
            let mut block = [0u8; BLOCK_LEN];
            block[..SEMIBLOCK_LEN].copy_from_slice(&(a ^ t).to_be_bytes());
            block[SEMIBLOCK_LEN..].copy_from_slice(&r[(i - 1) * SEMIBLOCK_LEN..i * SEMIBLOCK_LEN]);
            cipher.decrypt_block(GenericArray::from_mut_slice(&mut block));
            a = read_u64_be(&block[..SEMIBLOCK_LEN]);
            r[(i - 1) * SEMIBLOCK_LEN..i * SEMIBLOCK_LEN].copy_from_slice(&block[SEMIBLOCK_LEN..]);
        }
    }

    if a != INTEGRITY_VALUE {
        return Err(UnwrapError::Integrity);
    }
    Ok(r)
}

/// AES key wrap (RFC 3394 forward direction), the inverse of
/// [`aes_key_unwrap`]. The plaintext must be a positive multiple of 8
/// bytes.
pub fn aes_key_wrap(kek: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, UnwrapError> {
    if plaintext.is_empty() || plaintext.len() % SEMIBLOCK_LEN != 0 {
        return Err(UnwrapError::BadLength(plaintext.len()));
    }
    let n = plaintext.len() / SEMIBLOCK_LEN;
    let cipher = Aes256::new(GenericArray::from_slice(kek));

    let mut a = INTEGRITY_VALUE;
    let mut r = plaintext.to_vec();

    for j in 0..6u64 {
        for i in 1..=n {
            let mut block = [0u8; BLOCK_LEN];
            block[..SEMIBLOCK_LEN].copy_from_slice(&a.to_be_bytes());
            block[SEMIBLOCK_LEN..].copy_from_slice(&r[(i - 1) * SEMIBLOCK_LEN..i * SEMIBLOCK_LEN]);
            cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
            let t = n as u64 * j + i as u64;
            a = read_u64_be(&block[..SEMIBLOCK_LEN]) ^ t;
            r[(i - 1) * SEMIBLOCK_LEN..i * SEMIBLOCK_LEN].copy_from_slice(&block[SEMIBLOCK_LEN..]);
        }
    }

    let mut out = Vec::with_capacity(SEMIBLOCK_LEN + r.len());
    out.extend_from_slice(&a.to_be_bytes());
    out.extend_from_slice(&r);
    Ok(out)
}

/// AES-256-CBC decryption with a zero IV and no padding removal.
///
/// Trailing bytes beyond the last whole block are discarded before
/// decryption; the caller truncates the result to the declared file
/// size.
pub fn aes_cbc_decrypt(key: &[u8; KEY_LEN], ciphertext: &[u8]) -> Vec<u8> {
    let usable = ciphertext.len() - ciphertext.len() % BLOCK_LEN;
    let mut buf = ciphertext[..usable].to_vec();
    if buf.is_empty() {
        return buf;
    }
    let iv = [0u8; BLOCK_LEN];
    let decryptor = Aes256CbcDec::new(GenericArray::from_slice(key), GenericArray::from_slice(&iv));
    // cannot fail: the buffer is block-aligned by construction
    let ok = decryptor.decrypt_padded_mut::<NoPadding>(&mut buf).is_ok();
    debug_assert!(ok);
    buf
}

/// PBKDF2-HMAC-SHA256 with a 32-byte output.
pub fn pbkdf2_sha256(password: &[u8], salt: &[u8], rounds: u32) -> Zeroizing<[u8; KEY_LEN]> {
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, rounds, &mut out[..]);
    out
}

/// PBKDF2-HMAC-SHA1 with a 32-byte output.
pub fn pbkdf2_sha1(password: &[u8], salt: &[u8], rounds: u32) -> Zeroizing<[u8; KEY_LEN]> {
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, rounds, &mut out[..]);
    out
}

fn read_u64_be(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;

    type Aes256CbcEnc = cbc::Encryptor<Aes256>;

    fn kek() -> [u8; KEY_LEN] {
        let mut kek = [0u8; KEY_LEN];
        kek.copy_from_slice(
            &hex::decode("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f")
                .unwrap(),
        );
        kek
    }

    #[test]
    fn unwrap_matches_rfc3394_vector() {
        // RFC 3394 section 4.6: 256-bit key data with a 256-bit KEK.
        let wrapped = hex::decode(
            "28c9f404c4b810f4cbccb35cfb87f8263f5786e2d80ed326cbc7f0e71a99f43bfb988b9b7a02dd21",
        )
        .unwrap();
        let expected =
            hex::decode("00112233445566778899aabbccddeeff000102030405060708090a0b0c0d0e0f")
                .unwrap();

        let plain = aes_key_unwrap(&kek(), &wrapped).unwrap();
        assert_eq!(&plain[..], &expected[..]);
    }

    #[test]
    fn wrap_then_unwrap_roundtrip() {
        let data = [0x5au8; 24];
        let wrapped = aes_key_wrap(&kek(), &data).unwrap();
        assert_eq!(wrapped.len(), data.len() + 8);
        let plain = aes_key_unwrap(&kek(), &wrapped).unwrap();
        assert_eq!(&plain[..], &data[..]);
    }

    #[test]
    fn unwrap_detects_tampering() {
        let data = [0x5au8; 32];
        let mut wrapped = aes_key_wrap(&kek(), &data).unwrap();
        *wrapped.last_mut().unwrap() ^= 1;
        assert!(matches!(
            aes_key_unwrap(&kek(), &wrapped),
            Err(UnwrapError::Integrity)
        ));
    }

    #[test]
    fn unwrap_rejects_bad_lengths() {
        assert!(matches!(
            aes_key_unwrap(&kek(), &[0u8; 8]),
            Err(UnwrapError::BadLength(8))
        ));
        assert!(matches!(
            aes_key_unwrap(&kek(), &[0u8; 41]),
            Err(UnwrapError::BadLength(41))
        ));
        assert!(matches!(aes_key_wrap(&kek(), &[]), Err(UnwrapError::BadLength(0))));
    }

    fn cbc_encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Vec<u8> {
        assert_eq!(plaintext.len() % BLOCK_LEN, 0);
        let mut buf = plaintext.to_vec();
        let len = buf.len();
        let iv = [0u8; BLOCK_LEN];
        let encryptor =
            Aes256CbcEnc::new(GenericArray::from_slice(key), GenericArray::from_slice(&iv));
        encryptor
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .unwrap();
        buf
    }

    #[test]
    fn cbc_decrypt_roundtrip() {
        let key = [7u8; KEY_LEN];
        let plaintext = b"sixteen byte blkand another one!";
        let ciphertext = cbc_encrypt(&key, plaintext);
        assert_eq!(aes_cbc_decrypt(&key, &ciphertext), plaintext);
    }

    #[test]
    fn cbc_decrypt_discards_trailing_partial_block() {
        let key = [7u8; KEY_LEN];
        let plaintext = b"sixteen byte blk";
        let mut ciphertext = cbc_encrypt(&key, plaintext);
        ciphertext.extend_from_slice(&[0xff; 5]);
        assert_eq!(aes_cbc_decrypt(&key, &ciphertext), plaintext);
    }

    #[test]
    fn cbc_decrypt_of_short_input_is_empty() {
        let key = [7u8; KEY_LEN];
        assert!(aes_cbc_decrypt(&key, &[1, 2, 3]).is_empty());
        assert!(aes_cbc_decrypt(&key, &[]).is_empty());
    }

    #[test]
    fn pbkdf2_flavors_differ_and_are_deterministic() {
        let a = pbkdf2_sha256(b"passcode", b"salt", 10);
        let b = pbkdf2_sha256(b"passcode", b"salt", 10);
        let c = pbkdf2_sha1(b"passcode", b"salt", 10);
        assert_eq!(&a[..], &b[..]);
        assert_ne!(&a[..], &c[..]);
    }
}
