//! Host row schema
//!
//! A host is a user-owned SSH connection profile. All secret-bearing
//! columns are sensitive fields of the `host` entity kind and are only
//! ever persisted in `v1:` wire form. The `autostart_*` columns are copies
//! used by co-located workers that bring tunnels up without a user session.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metadata::Metadata;
use crate::types::{CredentialId, HostId, UserId};

/// How a host authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostAuthType {
    #[default]
    Password,
    Key,
    /// Auth material lives in a referenced credential row.
    Credential,
}

/// Host row
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct HostRow {
    pub id: HostId,

    #[serde(default)]
    pub metadata: Metadata,

    pub owner_id: UserId,

    /// Display name, unique per owner
    pub name: String,

    pub hostname: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub auth_type: HostAuthType,

    /// Referenced credential when `auth_type` is `credential`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<CredentialId>,

    // Sensitive columns (encrypted at rest)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_passphrase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sudo_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_password: Option<String>,

    /// Whether workers may bring this host's tunnels up unattended
    #[serde(default)]
    pub autostart: bool,

    // Autostart copies, wrapped separately so workers can resolve them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autostart_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autostart_private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autostart_key_passphrase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autostart_sudo_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autostart_proxy_password: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl HostRow {
    pub fn new(owner_id: UserId, name: String, hostname: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            metadata: Metadata::new(),
            owner_id,
            name,
            hostname,
            port: 22,
            ..Default::default()
        }
    }
}
