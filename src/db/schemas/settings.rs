//! Settings row schema
//!
//! Key/value settings, system-wide (no user id) or per-user. The value of
//! an external-identity provider config is a sensitive field of the
//! `settings` entity kind; it may arrive in legacy plaintext form and is
//! re-encrypted the next time it is saved while an admin DEK is resident.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metadata::Metadata;
use crate::types::UserId;

/// Settings row
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SettingsRow {
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    /// Absent for system-wide settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,

    pub key: String,

    /// Encrypted (`v1:`) for provider configs, plaintext otherwise
    pub value: String,

    /// Marks rows whose value must be encrypted when a capable key is
    /// resident at save time
    #[serde(default)]
    pub sensitive: bool,

    /// Which user's DEK sealed the value; absent for plaintext values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_by: Option<UserId>,
}

impl SettingsRow {
    pub fn new(user_id: Option<UserId>, key: String, value: String, sensitive: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            metadata: Metadata::new(),
            user_id,
            key,
            value,
            sensitive,
            encrypted_by: None,
        }
    }

    pub fn is_system(&self) -> bool {
        self.user_id.is_none()
    }
}
