//! Field encryption engine.
//!
//! Encrypts individual record fields under a user's DEK with
//! ChaCha20-Poly1305. Wire form is `v1:` followed by the base64url of
//! `nonce || ciphertext || tag`. The associated data binds each ciphertext to
//! `entity_kind|record_id|field_name|user_id`, so a value moved to another
//! row, column, or owner fails authentication instead of decrypting.
//!
//! Compatibility rules:
//! - decrypting a value without the `v1:` prefix returns it unchanged
//!   (legacy plaintext records)
//! - encrypting a value that already carries the prefix is a no-op

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use super::registry::EntityKind;
use crate::keys::{Dek, NONCE_LEN, TAG_LEN};
use crate::types::{DrawbridgeError, Result, UserId};

/// Version prefix of the current wire format.
pub const VERSION_PREFIX: &str = "v1:";

/// Context a field ciphertext is bound to.
#[derive(Debug, Clone)]
pub struct FieldContext<'a> {
    pub kind: EntityKind,
    pub record_id: &'a str,
    pub field_name: &'a str,
    pub user_id: &'a UserId,
}

impl FieldContext<'_> {
    /// Associated-data bytes: `entity_kind|record_id|field_name|user_id`.
    fn aad(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}",
            self.kind.as_str(),
            self.record_id,
            self.field_name,
            self.user_id
        )
        .into_bytes()
    }
}

/// Seal bytes under a 32-byte key with explicit associated data, producing
/// the `v1:` wire form. The field paths wrap this with the registry
/// context; the pending-share pipeline calls it with its own binding.
pub fn seal_bytes(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<String> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| DrawbridgeError::CryptoFailed(format!("field encryption failed: {e}")))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);

    Ok(format!("{VERSION_PREFIX}{}", URL_SAFE_NO_PAD.encode(sealed)))
}

/// Open a `v1:` wire-form value with a 32-byte key and associated data.
pub fn open_bytes(key: &[u8; 32], value: &str, aad: &[u8]) -> Result<Vec<u8>> {
    let Some(encoded) = value.strip_prefix(VERSION_PREFIX) else {
        return Err(DrawbridgeError::CryptoFailed(
            "value is not in encrypted wire form".into(),
        ));
    };

    let sealed = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| DrawbridgeError::CryptoFailed(format!("malformed field ciphertext: {e}")))?;

    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(DrawbridgeError::CryptoFailed(
            "field ciphertext too short".into(),
        ));
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| DrawbridgeError::CryptoFailed("field decryption failed".into()))
}

/// Encrypt a field value under the user's DEK.
///
/// Idempotent: a value already in wire form is returned unchanged.
pub fn encrypt_field(plaintext: &str, dek: &Dek, ctx: &FieldContext<'_>) -> Result<String> {
    if plaintext.starts_with(VERSION_PREFIX) {
        return Ok(plaintext.to_string());
    }
    seal_bytes(dek.as_bytes(), plaintext.as_bytes(), &ctx.aad())
}

/// Decrypt a field value with the user's DEK.
///
/// Values without the version prefix pass through unchanged. Wrong key,
/// wrong associated data, or tampering yield `CryptoFailed`.
pub fn decrypt_field(value: &str, dek: &Dek, ctx: &FieldContext<'_>) -> Result<String> {
    if !value.starts_with(VERSION_PREFIX) {
        return Ok(value.to_string());
    }

    let plaintext = open_bytes(dek.as_bytes(), value, &ctx.aad())?;
    String::from_utf8(plaintext)
        .map_err(|_| DrawbridgeError::CryptoFailed("decrypted field is not UTF-8".into()))
}

/// Whether a stored value is in the current encrypted wire form.
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(VERSION_PREFIX)
}
