//! System key manager.
//!
//! Persists a machine-local 32-byte root secret and derives fixed-purpose
//! sub-keys from it with HKDF-SHA256. The root never leaves this struct;
//! sub-keys are derived once at boot and cached for the process lifetime.
//!
//! Purposes:
//! - `ext-identity-wrap`: wraps DEKs of external-identity users
//! - `internal-rpc-token`: bearer bytes for loopback admin endpoints
//! - `pending-share-wrap`: wraps pending-share ciphertexts
//! - `token-sign`: signing key for session bearer tokens

use std::fs;
use std::io::Write;
use std::path::Path;

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::info;
use zeroize::Zeroizing;

use crate::types::{DrawbridgeError, Result};

/// Root secret length (32 bytes)
pub const ROOT_LEN: usize = 32;

/// Default internal RPC token length (32 bytes)
pub const DEFAULT_INTERNAL_TOKEN_LEN: usize = 32;

/// Machine-local root secret with cached purpose sub-keys.
pub struct SystemKeys {
    root: Zeroizing<[u8; ROOT_LEN]>,
    ext_identity_wrap: [u8; 32],
    pending_share_wrap: [u8; 32],
    token_sign: [u8; 32],
    internal_token: Vec<u8>,
}

impl SystemKeys {
    /// Load the root secret from `path`, generating and persisting a fresh
    /// one on first boot. The file is written with owner-only permissions.
    pub fn load_or_create(path: &Path, internal_token_len: usize) -> Result<Self> {
        let root = if path.exists() {
            let encoded = fs::read_to_string(path)
                .map_err(|e| DrawbridgeError::Internal(format!("cannot read system key: {e}")))?;
            let bytes = hex::decode(encoded.trim())
                .map_err(|e| DrawbridgeError::Internal(format!("corrupt system key file: {e}")))?;
            let arr: [u8; ROOT_LEN] = bytes.try_into().map_err(|_| {
                DrawbridgeError::Internal("system key file has wrong length".into())
            })?;
            arr
        } else {
            let mut arr = [0u8; ROOT_LEN];
            OsRng.fill_bytes(&mut arr);
            write_restricted(path, hex::encode(arr).as_bytes())?;
            info!(path = %path.display(), "Generated new system root secret");
            arr
        };

        Ok(Self::from_root(root, internal_token_len))
    }

    /// Build directly from root bytes. Test and embedding hook; production
    /// boots go through [`SystemKeys::load_or_create`].
    pub fn from_root(root: [u8; ROOT_LEN], internal_token_len: usize) -> Self {
        let ext_identity_wrap = derive_subkey(&root, "ext-identity-wrap");
        let pending_share_wrap = derive_subkey(&root, "pending-share-wrap");
        let token_sign = derive_subkey(&root, "token-sign");

        let mut internal_token = vec![0u8; internal_token_len.max(1)];
        let hk = Hkdf::<Sha256>::new(None, &root);
        hk.expand(b"purpose:internal-rpc-token", &mut internal_token)
            .expect("HKDF output length within bounds");

        Self {
            root: Zeroizing::new(root),
            ext_identity_wrap,
            pending_share_wrap,
            token_sign,
            internal_token,
        }
    }

    /// Wrapping key for pending-share ciphertexts.
    pub fn pending_share_wrap(&self) -> &[u8; 32] {
        &self.pending_share_wrap
    }

    /// Signing key for session bearer tokens.
    pub fn token_sign(&self) -> &[u8; 32] {
        &self.token_sign
    }

    /// Per-subject wrapping key for an external-identity user's DEK.
    ///
    /// Binds the wrap to the foreign subject id so ciphertext cannot be
    /// re-pointed at another subject.
    pub fn external_wrap_key(&self, subject: &str) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(Some(subject.as_bytes()), &self.ext_identity_wrap);
        let mut out = [0u8; 32];
        hk.expand(b"subject-wrap", &mut out)
            .expect("HKDF output length within bounds");
        out
    }

    /// The internal RPC token, for handing to co-located workers at spawn.
    pub fn internal_token(&self) -> &[u8] {
        &self.internal_token
    }

    /// Constant-time check of a presented internal RPC token.
    pub fn verify_internal_token(&self, presented: &[u8]) -> bool {
        if presented.len() != self.internal_token.len() {
            return false;
        }
        self.internal_token.ct_eq(presented).into()
    }

    /// Root bytes for test assertions only; the root is otherwise never read.
    #[cfg(test)]
    fn root_bytes(&self) -> &[u8; ROOT_LEN] {
        &self.root
    }
}

fn derive_subkey(root: &[u8; ROOT_LEN], name: &str) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, root);
    let mut out = [0u8; 32];
    hk.expand(format!("purpose:{name}").as_bytes(), &mut out)
        .expect("HKDF output length within bounds");
    out
}

/// Write a file with owner-only permissions (0600 on unix).
fn write_restricted(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| DrawbridgeError::Internal(format!("cannot create data dir: {e}")))?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .map_err(|e| DrawbridgeError::Internal(format!("cannot write system key: {e}")))?;
    file.write_all(contents)
        .map_err(|e| DrawbridgeError::Internal(format!("cannot write system key: {e}")))?;
    Ok(())
}
