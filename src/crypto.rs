//! AES-256-GCM sealing for stored credentials (workspace bot tokens, the
//! upstream API key).
//!
//! A sealed secret is three base64 fields: ciphertext, 12-byte IV and
//! 16-byte auth tag.  Decryption fails closed on any mismatch.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption key must be 32 bytes, got {0}")]
    KeyLength(usize),
    #[error("invalid base64 in {field}: {source}")]
    Decode {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
    #[error("IV must be 12 bytes, got {0}")]
    IvLength(usize),
    #[error("auth tag must be 16 bytes, got {0}")]
    TagLength(usize),
    #[error("decryption failed (wrong key or tampered data)")]
    Auth,
    #[error("decrypted secret is not valid UTF-8")]
    Utf8,
}

/// The process-wide key.  Never printed.
#[derive(Clone)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::KeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn from_base64(raw: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(raw.trim().as_bytes())
            .map_err(|source| CryptoError::Decode {
                field: "key",
                source,
            })?;
        Self::from_bytes(&bytes)
    }

    /// `ENCRYPTION_KEY` (base64).  `Ok(None)` when unset; a set but invalid
    /// key is an error.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var("ENCRYPTION_KEY") {
            Ok(raw) if !raw.trim().is_empty() => Ok(Some(
                Self::from_base64(&raw).context("ENCRYPTION_KEY is invalid")?,
            )),
            _ => Ok(None),
        }
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    pub ciphertext: String,
    pub iv: String,
    pub auth_tag: String,
}

fn decode(field: &'static str, raw: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64
        .decode(raw.trim().as_bytes())
        .map_err(|source| CryptoError::Decode { field, source })
}

pub fn decrypt(key: &SecretKey, sealed: &SealedSecret) -> Result<String, CryptoError> {
    let iv = decode("iv", &sealed.iv)?;
    if iv.len() != IV_LEN {
        return Err(CryptoError::IvLength(iv.len()));
    }
    let tag = decode("auth_tag", &sealed.auth_tag)?;
    if tag.len() != TAG_LEN {
        return Err(CryptoError::TagLength(tag.len()));
    }
    let mut payload = decode("ciphertext", &sealed.ciphertext)?;
    payload.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|_| CryptoError::KeyLength(KEY_LEN))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), payload.as_ref())
        .map_err(|_| CryptoError::Auth)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
}

pub fn encrypt(key: &SecretKey, plaintext: &str) -> Result<SealedSecret, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|_| CryptoError::KeyLength(KEY_LEN))?;
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
        .map_err(|_| CryptoError::Auth)?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);
    Ok(SealedSecret {
        ciphertext: BASE64.encode(&sealed),
        iv: BASE64.encode(iv),
        auth_tag: BASE64.encode(tag),
    })
}

#[cfg(test)]
pub(crate) fn test_key(seed: u8) -> SecretKey {
    SecretKey([seed; KEY_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_token_decrypts_with_same_key() {
        let key = test_key(7);
        let sealed = encrypt(&key, "xoxb-123-abc").unwrap();
        assert!(!sealed.ciphertext.contains("xoxb"));
        assert_eq!(decrypt(&key, &sealed).unwrap(), "xoxb-123-abc");
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = encrypt(&test_key(1), "xoxb-secret").unwrap();
        let err = decrypt(&test_key(2), &sealed).unwrap_err();
        assert!(matches!(err, CryptoError::Auth));
    }

    #[test]
    fn tampered_tag_fails_closed() {
        let key = test_key(3);
        let mut sealed = encrypt(&key, "xoxb-secret").unwrap();
        sealed.auth_tag = BASE64.encode([0u8; TAG_LEN]);
        assert!(matches!(decrypt(&key, &sealed), Err(CryptoError::Auth)));
    }

    #[test]
    fn key_length_is_enforced() {
        let short = BASE64.encode([1u8; 16]);
        assert!(matches!(
            SecretKey::from_base64(&short),
            Err(CryptoError::KeyLength(16))
        ));
        assert!(SecretKey::from_base64(&BASE64.encode([1u8; 32])).is_ok());
    }

    #[test]
    fn malformed_fields_are_rejected() {
        let key = test_key(4);
        let mut sealed = encrypt(&key, "x").unwrap();
        sealed.iv = BASE64.encode([0u8; 8]);
        assert!(matches!(decrypt(&key, &sealed), Err(CryptoError::IvLength(8))));
        sealed.iv = "%%%".into();
        assert!(matches!(
            decrypt(&key, &sealed),
            Err(CryptoError::Decode { field: "iv", .. })
        ));
    }
}
