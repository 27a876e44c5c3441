//! Password-derived key material: the KEK deriver and password verifiers.
//!
//! Both run Argon2id, but on deliberately separate salt material. The KEK
//! comes from the per-user salt row and only ever wraps the DEK; the
//! verifier is a PHC string with its own embedded salt and parameters, so
//! a password check proves knowledge without touching anything the wrap
//! depends on.
//!
//! # Security Parameters
//!
//! Defaults are tuned for password-based key encryption:
//! - 64 MB memory (prevents GPU attacks)
//! - 3 iterations
//! - 4 parallelism threads

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::{DrawbridgeError, Result};

/// Default Argon2id memory cost in KiB (64 MB)
pub const DEFAULT_MEMORY_KIB: u32 = 65536;

/// Default Argon2id iteration count
pub const DEFAULT_ITERATIONS: u32 = 3;

/// Default Argon2id parallelism (threads)
pub const DEFAULT_PARALLELISM: u32 = 4;

/// Salt length for key derivation (16 bytes)
pub const SALT_LEN: usize = 16;

/// KEK length (32 bytes)
pub const KEK_LEN: usize = 32;

/// Tunable Argon2id parameters, stored next to each user's salt.
///
/// A row keeps the parameters it was written with; changing the defaults
/// only affects keys derived after the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    fn to_argon2(&self, output_len: Option<usize>) -> Result<Argon2<'static>> {
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, output_len)
            .map_err(|e| DrawbridgeError::Internal(format!("invalid KDF parameters: {e}")))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: DEFAULT_MEMORY_KIB,
            iterations: DEFAULT_ITERATIONS,
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

/// A derived key-encryption key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Kek([u8; KEK_LEN]);

impl Kek {
    pub fn as_bytes(&self) -> &[u8; KEK_LEN] {
        &self.0
    }
}

// Debug impl that doesn't leak key material
impl std::fmt::Debug for Kek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kek").finish_non_exhaustive()
    }
}

/// Generate a fresh random salt for a new user (or a destructive reset).
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a 256-bit KEK from a password using Argon2id.
///
/// Each call recomputes; the deriver keeps no cache. The KEK is used only
/// to wrap and unwrap the user's data key, never to encrypt records
/// directly.
///
/// # Errors
///
/// - Invalid parameters (zero memory, bad parallelism) map to `Internal`
///   with an `invalid KDF parameters` message.
/// - Allocation failure inside the hasher maps to `Internal` with an
///   `out of memory` message.
pub fn derive_kek(password: &[u8], salt: &[u8], params: &KdfParams) -> Result<Kek> {
    let argon2 = params.to_argon2(Some(KEK_LEN))?;

    let mut key = [0u8; KEK_LEN];
    argon2.hash_password_into(password, salt, &mut key).map_err(|e| match e {
        argon2::Error::MemoryTooLittle | argon2::Error::MemoryTooMuch => {
            DrawbridgeError::Internal(format!("invalid KDF parameters: {e}"))
        }
        other => DrawbridgeError::Internal(format!("key derivation out of memory or failed: {other}")),
    })?;

    Ok(Kek(key))
}

/// Hash a password into a PHC verifier string using the deployment's
/// tuned parameters.
///
/// The verifier draws a fresh salt of its own, distinct from the KEK salt
/// row, and the PHC form embeds both that salt and the parameters. Two
/// consequences the auth paths rely on: a verifier check reveals nothing
/// about the wrap material, and re-tuning [`KdfParams`] never invalidates
/// verifiers already at rest.
pub fn hash_verifier(password: &str, params: &KdfParams) -> Result<String> {
    let hasher = params.to_argon2(None)?;
    let salt = SaltString::generate(&mut OsRng);

    hasher
        .hash_password(password.as_bytes(), &salt)
        .map(|phc| phc.to_string())
        .map_err(|e| DrawbridgeError::Internal(format!("verifier hashing failed: {e}")))
}

/// Check a password against a stored PHC verifier.
///
/// The parameters embedded in the verifier drive the computation, not the
/// current deployment tuning, so verifiers written under old tunings keep
/// verifying.
pub fn check_verifier(password: &str, verifier: &str) -> Result<bool> {
    let parsed = PasswordHash::new(verifier)
        .map_err(|e| DrawbridgeError::Internal(format!("malformed verifier: {e}")))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Burn derivation work comparable to a real credential check.
///
/// The login path calls this when there is nothing to check against (no
/// such user, or an external-only account with an empty verifier), so
/// those rejections cost about as much as a wrong password and the
/// response leaks nothing through timing.
pub fn burn_verification_work(password: &str, params: &KdfParams) {
    const FIXED_SALT: [u8; SALT_LEN] = [0u8; SALT_LEN];
    let _ = derive_kek(password.as_bytes(), &FIXED_SALT, params);
}
