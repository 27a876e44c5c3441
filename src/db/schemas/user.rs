//! User row schema
//!
//! Identity records. The password verifier is an Argon2 PHC string and is
//! empty for external-only users. The TOTP secret and backup codes are
//! sensitive fields of the `user` entity kind and are stored encrypted
//! under the user's own DEK.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metadata::Metadata;
use crate::types::UserId;

/// User row
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct UserRow {
    /// Opaque id, never mutated after creation
    pub id: UserId,

    /// Common metadata (created_at, updated_at)
    #[serde(default)]
    pub metadata: Metadata,

    /// Display name, unique across users
    pub name: String,

    /// Argon2 PHC verifier; empty string for external-only users
    #[serde(default)]
    pub verifier: String,

    /// Administrator flag
    #[serde(default)]
    pub is_admin: bool,

    /// Whether this user authenticates via an external identity provider
    #[serde(default)]
    pub is_external: bool,

    /// Foreign subject id at the external provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_subject: Option<String>,

    /// TOTP secret, encrypted (`v1:` wire form) when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totp_secret: Option<String>,

    /// TOTP backup codes (JSON array of hashes), encrypted when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totp_backup_codes: Option<String>,

    /// Whether the second factor is active for this user
    #[serde(default)]
    pub totp_enabled: bool,
}

impl UserRow {
    /// Create a password user.
    pub fn new(name: String, verifier: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            metadata: Metadata::new(),
            name,
            verifier,
            ..Default::default()
        }
    }

    /// Create an external-identity user with no password verifier.
    pub fn new_external(name: String, subject: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            metadata: Metadata::new(),
            name,
            verifier: String::new(),
            is_external: true,
            external_subject: Some(subject),
            ..Default::default()
        }
    }

    /// Whether this user can log in with a password at all.
    pub fn has_password(&self) -> bool {
        !self.verifier.is_empty()
    }

    /// Dual-auth users have both a verifier and an external link; either
    /// path must unlock the same DEK record.
    pub fn is_dual_auth(&self) -> bool {
        self.has_password() && self.external_subject.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_user() {
        let user = UserRow::new("alice".into(), "$argon2id$stub".into());
        assert!(user.has_password());
        assert!(!user.is_external);
        assert!(!user.is_dual_auth());
        assert!(!user.id.is_empty());
    }

    #[test]
    fn test_external_user_has_no_verifier() {
        let user = UserRow::new_external("bob".into(), "sub-123".into());
        assert!(!user.has_password());
        assert!(user.is_external);
        assert_eq!(user.external_subject.as_deref(), Some("sub-123"));
    }

    #[test]
    fn test_dual_auth() {
        let mut user = UserRow::new("carol".into(), "$argon2id$stub".into());
        user.external_subject = Some("sub-9".into());
        assert!(user.is_dual_auth());
    }
}
