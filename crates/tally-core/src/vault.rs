//! # Credential Vault
//!
//! AES-256-GCM sealing of provider credentials.
//!
//! ## Bundle Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  payload (JSON) ──► AES-256-GCM(key, random 96-bit iv)                  │
//! │                          │                                              │
//! │                          ▼                                              │
//! │             ciphertext ‖ 128-bit tag                                    │
//! │                          │                                              │
//! │            ┌─────────────┼──────────────┐                               │
//! │            ▼             ▼              ▼                               │
//! │    { iv: base64,   tag: base64,   data: base64 }                        │
//! │                                                                         │
//! │  Opening verifies the tag BEFORE any plaintext is released. A wrong     │
//! │  key, a flipped bit in iv / tag / data: all are AuthenticationFailed.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A fresh iv is drawn from the OS RNG for every seal, so sealing the same
//! payload twice never produces the same bundle.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::VaultError;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

// =============================================================================
// Key
// =============================================================================

/// The 256-bit vault key.
///
/// Configured as 64 hex characters (`TALLY_VAULT_KEY` or `[vault] key_hex`).
#[derive(Clone)]
pub struct VaultKey([u8; KEY_LEN]);

impl VaultKey {
    /// Parses a key from 64 hex characters.
    ///
    /// ## Example
    /// ```rust
    /// use tally_core::VaultKey;
    ///
    /// assert!(VaultKey::from_hex(&"ab".repeat(32)).is_ok());
    /// assert!(VaultKey::from_hex("abcd").is_err());
    /// ```
    pub fn from_hex(key_hex: &str) -> Result<Self, VaultError> {
        let mut key = [0u8; KEY_LEN];
        hex::decode_to_slice(key_hex.trim(), &mut key)
            .map_err(|e| VaultError::InvalidKeyMaterial(format!("vault key: {}", e)))?;
        Ok(VaultKey(key))
    }

    /// Draws a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        VaultKey(key)
    }

    /// Hex form, for writing a freshly generated key to config.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn cipher(&self) -> Result<Aes256Gcm, VaultError> {
        Aes256Gcm::new_from_slice(&self.0)
            .map_err(|_| VaultError::InvalidKeyMaterial("key length".to_string()))
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultKey(<redacted>)")
    }
}

// =============================================================================
// Bundle
// =============================================================================

/// A sealed credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherBundle {
    pub iv: String,
    pub tag: String,
    pub data: String,
}

/// Serializes `payload` to JSON and seals it.
pub fn seal<T: Serialize>(key: &VaultKey, payload: &T) -> Result<CipherBundle, VaultError> {
    let plaintext =
        serde_json::to_vec(payload).map_err(|e| VaultError::Payload(e.to_string()))?;

    let cipher = key.cipher()?;
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let mut sealed = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|_| VaultError::Payload("encryption failed".to_string()))?;

    // aes-gcm appends the tag to the ciphertext; the bundle stores it apart.
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(CipherBundle {
        iv: BASE64.encode(iv),
        tag: BASE64.encode(tag),
        data: BASE64.encode(sealed),
    })
}

/// Verifies and decrypts `bundle`, then deserializes the payload.
pub fn open<T: DeserializeOwned>(key: &VaultKey, bundle: &CipherBundle) -> Result<T, VaultError> {
    let iv = decode("iv", &bundle.iv)?;
    if iv.len() != IV_LEN {
        return Err(VaultError::MalformedBundle(format!(
            "iv must be {} bytes, got {}",
            IV_LEN,
            iv.len()
        )));
    }
    let tag = decode("tag", &bundle.tag)?;
    if tag.len() != TAG_LEN {
        return Err(VaultError::MalformedBundle(format!(
            "tag must be {} bytes, got {}",
            TAG_LEN,
            tag.len()
        )));
    }
    let mut sealed = decode("data", &bundle.data)?;
    sealed.extend_from_slice(&tag);

    let cipher = key.cipher()?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), sealed.as_ref())
        .map_err(|_| VaultError::AuthenticationFailed)?;

    serde_json::from_slice(&plaintext).map_err(|e| VaultError::Payload(e.to_string()))
}

fn decode(part: &str, value: &str) -> Result<Vec<u8>, VaultError> {
    BASE64
        .decode(value.as_bytes())
        .map_err(|e| VaultError::MalformedBundle(format!("{}: {}", part, e)))
}

// =============================================================================
// Unit Tests
// =============================================================================
