//! Key-hierarchy rows: KEK salts and wrapped DEKs.
//!
//! Salts (with their KDF parameters) are plaintext; salts are not secret.
//! The wrapped DEK is the sealed form produced by the key-wrap layer,
//! base64-encoded for storage. Exactly one active wrapping exists per user.

use serde::{Deserialize, Serialize};

use crate::keys::KdfParams;
use crate::types::UserId;

/// Per-user KDF salt and the parameters it was written with.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct KekSaltRow {
    pub user_id: UserId,

    /// Base64-encoded random salt. Immutable except on destructive reset.
    pub salt: String,

    /// Argon2id parameters captured at write time so tuning can evolve
    /// without invalidating stored wraps.
    pub kdf_params: KdfParams,
}

/// How a stored DEK is wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WrapKind {
    /// Sealed under the KEK derived from the user's password.
    Kek,
    /// Sealed under the system key bound to the user's external subject.
    ExtIdentity,
}

/// The user's sealed data key.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WrappedDekRow {
    pub user_id: UserId,

    /// Base64 of `nonce || ciphertext || tag`.
    pub ciphertext: String,

    pub wrap_kind: WrapKind,
}
