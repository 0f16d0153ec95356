// Passphrase encryption for credential notifications: PBKDF2 + AES-256-CBC
//
// Flow:
// 1. Generate a random 32-byte salt
// 2. KDF: PBKDF2-HMAC-SHA1(passphrase, salt, 1000 rounds) → 256-bit key
// 3. Generate a random 16-byte IV (one AES block)
// 4. Encrypt: AES-256-CBC(key, iv, PKCS#7(plaintext))
// 5. Output: base64(salt) "]" base64(iv) "]" base64(ciphertext)
//
// Recipient reverses:
// 1. Split on "]" into exactly three segments, base64-decode each
// 2. KDF: same derivation from the embedded salt → key
// 3. Decrypt and unpad with the embedded iv
//
// The constants are shared with the Android peers already in the field.
// Changing any of them breaks compatibility with every deployed device.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// PBKDF2 iteration count
pub const ITERATION_COUNT: u32 = 1000;

/// Derived key length in bytes (AES-256)
pub const KEY_LENGTH: usize = 32;

/// Salt length in bytes
pub const SALT_LENGTH: usize = 32;

/// IV length in bytes (AES block size)
pub const IV_LENGTH: usize = 16;

/// Segment delimiter of the encrypted wire format
pub const DELIMITER: char = ']';

/// Errors for the passphrase codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid encrypted text format: expected {expected} segments, got {found}")]
    Format { expected: usize, found: usize },
    #[error("Invalid base64 segment: {0}")]
    Base64(String),
    #[error("Invalid key or iv length")]
    InvalidLength,
    #[error("Decryption failed: wrong passphrase or corrupted ciphertext")]
    Decrypt,
    #[error("Decrypted payload is not valid UTF-8")]
    Utf8,
}

impl CryptoError {
    /// Whether this error came from a malformed envelope rather than the cipher.
    pub fn is_format(&self) -> bool {
        matches!(self, CryptoError::Format { .. } | CryptoError::Base64(_))
    }
}

/// A symmetric key derived from a passphrase.
///
/// Peers that already agreed on a key can skip the per-message KDF by
/// holding on to one of these. The salt is `None` for raw keys, in which
/// case encryption emits the two-segment `iv]ciphertext` form.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    key: [u8; KEY_LENGTH],
    salt: Option<[u8; SALT_LENGTH]>,
}

impl DerivedKey {
    /// Derive a key from `secret` with a fresh random salt.
    pub fn derive(secret: &str) -> Self {
        Self::derive_with_salt(secret, generate_salt())
    }

    /// Derive a key from `secret` with a known salt.
    pub fn derive_with_salt(secret: &str, salt: [u8; SALT_LENGTH]) -> Self {
        let mut key = [0u8; KEY_LENGTH];
        pbkdf2::pbkdf2_hmac::<sha1::Sha1>(secret.as_bytes(), &salt, ITERATION_COUNT, &mut key);
        Self {
            key,
            salt: Some(salt),
        }
    }

    /// Wrap raw key bytes that were exchanged out of band.
    pub fn from_raw(key: [u8; KEY_LENGTH]) -> Self {
        Self { key, salt: None }
    }

    pub fn salt(&self) -> Option<&[u8; SALT_LENGTH]> {
        self.salt.as_ref()
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("key", &"<redacted>")
            .field("salted", &self.salt.is_some())
            .finish()
    }
}

/// Generate a fresh random salt.
pub fn generate_salt() -> [u8; SALT_LENGTH] {
    let mut salt = [0u8; SALT_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

fn generate_iv() -> [u8; IV_LENGTH] {
    let mut iv = [0u8; IV_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

fn seal(key: &[u8; KEY_LENGTH], iv: &[u8; IV_LENGTH], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidLength)?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn open(key: &[u8; KEY_LENGTH], iv: &[u8], ciphertext: &[u8]) -> Result<String, CryptoError> {
    if iv.len() != IV_LENGTH {
        return Err(CryptoError::InvalidLength);
    }
    let cipher = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidLength)?;
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
}

fn from_base64(segment: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(segment)
        .map_err(|e| CryptoError::Base64(e.to_string()))
}

fn split_segments(ciphertext: &str, expected: usize) -> Result<Vec<&str>, CryptoError> {
    let fields: Vec<&str> = ciphertext.split(DELIMITER).collect();
    if fields.len() != expected {
        return Err(CryptoError::Format {
            expected,
            found: fields.len(),
        });
    }
    Ok(fields)
}

fn join_segments(salt: Option<&[u8]>, iv: &[u8], ciphertext: &[u8]) -> String {
    match salt {
        Some(salt) => format!(
            "{}{DELIMITER}{}{DELIMITER}{}",
            STANDARD.encode(salt),
            STANDARD.encode(iv),
            STANDARD.encode(ciphertext)
        ),
        None => format!(
            "{}{DELIMITER}{}",
            STANDARD.encode(iv),
            STANDARD.encode(ciphertext)
        ),
    }
}

/// Encrypt `plaintext` under a key derived from `secret`.
///
/// Every call draws a fresh salt and iv, so identical inputs never produce
/// the same output.
pub fn encrypt(plaintext: &str, secret: &str) -> Result<String, CryptoError> {
    let key = DerivedKey::derive(secret);
    encrypt_with_key(plaintext, &key)
}

/// Decrypt a `salt]iv]ciphertext` string produced by [`encrypt`].
pub fn decrypt(ciphertext: &str, secret: &str) -> Result<String, CryptoError> {
    let fields = split_segments(ciphertext, 3)?;
    let salt = from_base64(fields[0])?;
    let iv = from_base64(fields[1])?;
    let body = from_base64(fields[2])?;

    let salt: [u8; SALT_LENGTH] = salt.try_into().map_err(|_| CryptoError::InvalidLength)?;
    let key = DerivedKey::derive_with_salt(secret, salt);
    open(key.as_bytes(), &iv, &body)
}

/// Encrypt with a pre-derived key.
///
/// Salted keys emit the three-segment form (so a passphrase holder can still
/// decrypt); raw keys emit `iv]ciphertext`.
pub fn encrypt_with_key(plaintext: &str, key: &DerivedKey) -> Result<String, CryptoError> {
    let iv = generate_iv();
    let body = seal(key.as_bytes(), &iv, plaintext.as_bytes())?;
    Ok(join_segments(
        key.salt().map(|s| s.as_slice()),
        &iv,
        &body,
    ))
}

/// Decrypt with a pre-derived key. Accepts both the three-segment form
/// (embedded salt is ignored) and the salt-less two-segment form.
pub fn decrypt_with_key(ciphertext: &str, key: &DerivedKey) -> Result<String, CryptoError> {
    let found = ciphertext.matches(DELIMITER).count() + 1;
    let fields = match found {
        2 => split_segments(ciphertext, 2)?,
        3 => split_segments(ciphertext, 3)?[1..].to_vec(),
        _ => {
            return Err(CryptoError::Format { expected: 3, found });
        }
    };
    let iv = from_base64(fields[0])?;
    let body = from_base64(fields[1])?;
    open(key.as_bytes(), &iv, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let encrypted = encrypt("hola", "password").expect("Encryption");
        let decrypted = decrypt(&encrypted, "password").expect("Decryption");
        assert_eq!(decrypted, "hola");
    }

    #[test]
    fn test_encrypt_is_probabilistic() {
        let a = encrypt("ssid:pass:peer", "secret").expect("Encryption");
        let b = encrypt("ssid:pass:peer", "secret").expect("Encryption");
        assert_ne!(a, b);
    }

    #[test]
    fn test_encrypted_shape() {
        let encrypted = encrypt("payload", "secret").expect("Encryption");
        let fields: Vec<&str> = encrypted.split(DELIMITER).collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(STANDARD.decode(fields[0]).unwrap().len(), SALT_LENGTH);
        assert_eq!(STANDARD.decode(fields[1]).unwrap().len(), IV_LENGTH);
        // one block of PKCS#7 padding on a 7 byte message
        assert_eq!(STANDARD.decode(fields[2]).unwrap().len(), 16);
    }

    #[test]
    fn test_decrypt_rejects_wrong_segment_count() {
        for bad in ["", "abc", "a]b", "a]b]c]d", "]]]"] {
            let err = decrypt(bad, "secret").unwrap_err();
            assert!(
                matches!(err, CryptoError::Format { .. }),
                "{:?} should be a format error, got {:?}",
                bad,
                err
            );
        }
    }

    #[test]
    fn test_decrypt_rejects_bad_base64() {
        let err = decrypt("!!!]AAAA]AAAA", "secret").unwrap_err();
        assert!(err.is_format());
    }

    #[test]
    fn test_decrypt_wrong_secret_fails_or_differs() {
        let encrypted = encrypt("network:password:info", "right").expect("Encryption");
        match decrypt(&encrypted, "wrong") {
            Ok(plaintext) => assert_ne!(plaintext, "network:password:info"),
            Err(e) => assert!(!e.is_format()),
        }
    }

    #[test]
    fn test_empty_plaintext() {
        let encrypted = encrypt("", "secret").expect("Encryption");
        assert_eq!(decrypt(&encrypted, "secret").expect("Decryption"), "");
    }

    #[test]
    fn test_derived_key_roundtrip_three_segments() {
        let key = DerivedKey::derive("shared");
        let encrypted = encrypt_with_key("hello", &key).expect("Encryption");
        assert_eq!(encrypted.matches(DELIMITER).count(), 2);

        assert_eq!(decrypt_with_key(&encrypted, &key).unwrap(), "hello");
        // the embedded salt lets a passphrase holder decrypt too
        assert_eq!(decrypt(&encrypted, "shared").unwrap(), "hello");
    }

    #[test]
    fn test_raw_key_emits_two_segments() {
        let key = DerivedKey::from_raw([7u8; KEY_LENGTH]);
        let encrypted = encrypt_with_key("hello", &key).expect("Encryption");
        assert_eq!(encrypted.matches(DELIMITER).count(), 1);
        assert_eq!(decrypt_with_key(&encrypted, &key).unwrap(), "hello");

        // the passphrase path refuses the salt-less form
        assert!(matches!(
            decrypt(&encrypted, "anything"),
            Err(CryptoError::Format { expected: 3, found: 2 })
        ));
    }

    #[test]
    fn test_derive_with_salt_is_deterministic() {
        let salt = [3u8; SALT_LENGTH];
        let a = DerivedKey::derive_with_salt("pw", salt);
        let b = DerivedKey::derive_with_salt("pw", salt);
        let c = DerivedKey::derive_with_salt("other", salt);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = DerivedKey::from_raw([0xAB; KEY_LENGTH]);
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("171"));
    }

    mod properties {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(24))]

            #[test]
            fn roundtrip_any_plaintext(plaintext in ".{0,64}", secret in "[a-zA-Z0-9]{1,16}") {
                let encrypted = encrypt(&plaintext, &secret).unwrap();
                prop_assert_eq!(decrypt(&encrypted, &secret).unwrap(), plaintext);
            }

            #[test]
            fn separator_count_other_than_two_is_format_error(input in "[A-Za-z0-9+/=\\]]{0,40}") {
                prop_assume!(input.matches(']').count() != 2);
                let is_format = matches!(decrypt(&input, "s"), Err(CryptoError::Format { .. }));
                prop_assert!(is_format);
            }
        }
    }
}
