//! Data-key wrapping.
//!
//! A user's 256-bit data key (DEK) is sealed under their KEK (password
//! users) or under a system-derived key (external-identity users). The
//! sealed form is `nonce(12) || ciphertext || tag(16)`; the Poly1305 tag
//! doubles as the integrity check that detects wrong-key attempts.

use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::{DrawbridgeError, Result};

/// DEK length (32 bytes)
pub const DEK_LEN: usize = 32;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 auth tag length (16 bytes)
pub const TAG_LEN: usize = 16;

/// A user's data-encryption key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Dek([u8; DEK_LEN]);

impl Dek {
    /// Generate a fresh random DEK (registration, destructive reset).
    pub fn generate() -> Self {
        let mut bytes = [0u8; DEK_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; DEK_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DEK_LEN] {
        &self.0
    }
}

// Debug impl that doesn't leak key material
impl std::fmt::Debug for Dek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dek").finish_non_exhaustive()
    }
}

/// Seal a DEK under a 32-byte wrapping key.
///
/// Returns `nonce || ciphertext || tag`. A fresh nonce is drawn per call, so
/// re-wrapping the same DEK produces different bytes every time.
pub fn wrap_dek(dek: &Dek, wrapping_key: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(wrapping_key));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), dek.as_bytes().as_slice())
        .map_err(|e| DrawbridgeError::CryptoFailed(format!("DEK wrap failed: {e}")))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a sealed DEK with a 32-byte wrapping key.
///
/// Fails with `CryptoFailed` when the key is wrong or the sealed bytes were
/// tampered with; callers on the login path collapse this into the generic
/// auth failure.
pub fn unwrap_dek(sealed: &[u8], wrapping_key: &[u8; 32]) -> Result<Dek> {
    if sealed.len() != NONCE_LEN + DEK_LEN + TAG_LEN {
        return Err(DrawbridgeError::CryptoFailed(format!(
            "sealed DEK has invalid length {}",
            sealed.len()
        )));
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(wrapping_key));

    let mut plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| DrawbridgeError::CryptoFailed("DEK unwrap authentication failed".into()))?;

    let mut bytes = [0u8; DEK_LEN];
    bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(Dek::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_key() -> [u8; 32] {
        let mut k = [0u8; 32];
        OsRng.fill_bytes(&mut k);
        k
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let dek = Dek::generate();
        let kek = random_key();

        let sealed = wrap_dek(&dek, &kek).unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + DEK_LEN + TAG_LEN);

        let opened = unwrap_dek(&sealed, &kek).unwrap();
        assert_eq!(opened.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let dek = Dek::generate();
        let sealed = wrap_dek(&dek, &random_key()).unwrap();

        let result = unwrap_dek(&sealed, &random_key());
        assert!(result.is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let dek = Dek::generate();
        let kek = random_key();
        let mut sealed = wrap_dek(&dek, &kek).unwrap();

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(unwrap_dek(&sealed, &kek).is_err());
    }

    #[test]
    fn test_truncated_sealed_rejected() {
        let dek = Dek::generate();
        let kek = random_key();
        let sealed = wrap_dek(&dek, &kek).unwrap();

        assert!(unwrap_dek(&sealed[..sealed.len() - 1], &kek).is_err());
        assert!(unwrap_dek(&[], &kek).is_err());
    }

    #[test]
    fn test_rewrap_produces_fresh_nonce() {
        let dek = Dek::generate();
        let kek = random_key();

        let s1 = wrap_dek(&dek, &kek).unwrap();
        let s2 = wrap_dek(&dek, &kek).unwrap();
        assert_ne!(s1, s2);
        assert_eq!(
            unwrap_dek(&s1, &kek).unwrap().as_bytes(),
            unwrap_dek(&s2, &kek).unwrap().as_bytes()
        );
    }
}
