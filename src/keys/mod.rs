//! Key hierarchy: KEK derivation, DEK wrapping, the resident-key vault,
//! and the system key manager.
//!
//! The layering is strict: a password derives a KEK (never stored), the KEK
//! wraps the user's DEK (stored sealed), and only the DEK ever encrypts
//! record fields. External-identity users have no password; their DEK is
//! wrapped under a system-derived key bound to the foreign subject id.

pub mod kdf;
pub mod system;
pub mod vault;
pub mod wrap;

pub use kdf::{
    burn_verification_work, check_verifier, derive_kek, generate_salt, hash_verifier, KdfParams,
    Kek, KEK_LEN, SALT_LEN,
};
pub use system::SystemKeys;
pub use vault::DekVault;
pub use wrap::{unwrap_dek, wrap_dek, Dek, DEK_LEN, NONCE_LEN, TAG_LEN};
