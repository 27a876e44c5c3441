//! Credential row schema
//!
//! Reusable auth material referenced by hosts. Secret columns are sensitive
//! fields of the `credential` entity kind.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::host::HostAuthType;
use super::metadata::Metadata;
use crate::types::{CredentialId, UserId};

/// Credential row
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CredentialRow {
    pub id: CredentialId,

    #[serde(default)]
    pub metadata: Metadata,

    pub owner_id: UserId,

    /// Display name, unique per owner
    pub name: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub auth_type: HostAuthType,

    // Sensitive columns (encrypted at rest)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_passphrase: Option<String>,
}

impl CredentialRow {
    pub fn new(owner_id: UserId, name: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            metadata: Metadata::new(),
            owner_id,
            name,
            ..Default::default()
        }
    }
}
