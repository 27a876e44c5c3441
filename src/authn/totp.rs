//! Second factor: TOTP codes and single-use backup codes.
//!
//! The TOTP secret is a sensitive field of the `user` entity and is stored
//! encrypted under the user's own DEK; this module only ever sees the
//! decrypted base32 secret. Backup codes are random, shown to the user
//! once, and stored as a JSON array of SHA-256 hashes (itself encrypted).

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use totp_rs::{Algorithm, Secret, TOTP};

use crate::types::{DrawbridgeError, Result};

/// Number of backup codes issued at enrollment.
pub const BACKUP_CODE_COUNT: usize = 10;

/// Issuer label used in provisioning URIs.
const ISSUER: &str = "Drawbridge";

fn build_totp(secret_b32: &str, account: &str) -> Result<TOTP> {
    let secret = Secret::Encoded(secret_b32.to_string())
        .to_bytes()
        .map_err(|e| DrawbridgeError::Internal(format!("invalid TOTP secret: {e:?}")))?;

    TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        secret,
        Some(ISSUER.to_string()),
        account.to_string(),
    )
    .map_err(|e| DrawbridgeError::Internal(format!("TOTP construction failed: {e}")))
}

/// Generate a fresh base32 TOTP secret (160-bit, RFC 4226 recommendation).
pub fn generate_secret() -> String {
    let mut bytes = vec![0u8; 20];
    OsRng.fill_bytes(&mut bytes);
    match Secret::Raw(bytes).to_encoded() {
        Secret::Encoded(encoded) => encoded,
        Secret::Raw(_) => unreachable!("to_encoded always yields the encoded form"),
    }
}

/// The otpauth:// URI authenticator apps enroll from.
pub fn provisioning_uri(secret_b32: &str, account: &str) -> Result<String> {
    Ok(build_totp(secret_b32, account)?.get_url())
}

/// Verify a 6-digit code against the secret, honoring one step of skew.
pub fn verify_code(secret_b32: &str, code: &str) -> Result<bool> {
    let totp = build_totp(secret_b32, "verify")?;
    totp.check_current(code)
        .map_err(|e| DrawbridgeError::Internal(format!("system clock error: {e}")))
}

/// Generate backup codes. Returns the plain codes (displayed once, never
/// stored) and the JSON array of their hashes for storage.
pub fn generate_backup_codes() -> (Vec<String>, String) {
    let mut plain = Vec::with_capacity(BACKUP_CODE_COUNT);
    for _ in 0..BACKUP_CODE_COUNT {
        let mut bytes = [0u8; 5];
        OsRng.fill_bytes(&mut bytes);
        let hex = hex::encode(bytes);
        plain.push(format!("{}-{}", &hex[..5], &hex[5..]));
    }

    let hashes: Vec<String> = plain.iter().map(|c| hash_code(c)).collect();
    let stored = serde_json::to_string(&hashes).expect("hash list serializes");
    (plain, stored)
}

/// Try to consume a backup code against the stored hash list.
///
/// On a match returns the updated list with that hash removed (codes are
/// single-use); `None` means the code did not match any remaining hash.
pub fn consume_backup_code(stored: &str, code: &str) -> Result<Option<String>> {
    let mut hashes: Vec<String> = serde_json::from_str(stored)
        .map_err(|e| DrawbridgeError::Internal(format!("corrupt backup code list: {e}")))?;

    let candidate = hash_code(code.trim());
    let before = hashes.len();
    hashes.retain(|h| h != &candidate);

    if hashes.len() == before {
        return Ok(None);
    }

    let updated = serde_json::to_string(&hashes).expect("hash list serializes");
    Ok(Some(updated))
}

fn hash_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}
