//! Share-grant and role schemas
//!
//! A grant gives a principal (user or role) read or write access to a
//! host. Expiry comparison is UTC; a grant whose expiry equals the current
//! instant is already expired.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{HostId, UserId};

/// Principal kind a grant points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    User,
    Role,
}

/// Grant permission level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantLevel {
    Read,
    Write,
}

/// Host grant row
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GrantRow {
    pub id: String,

    pub host_id: HostId,

    pub principal_kind: PrincipalKind,

    /// User id or role id, per `principal_kind`
    pub principal_id: String,

    pub level: GrantLevel,

    /// Open-ended when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl GrantRow {
    pub fn new(
        host_id: HostId,
        principal_kind: PrincipalKind,
        principal_id: String,
        level: GrantLevel,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            host_id,
            principal_kind,
            principal_id,
            level,
            expires_at,
            created_at: Utc::now(),
        }
    }

    /// Active means not yet expired. Expiry equal to `now` counts as expired.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => now < expiry,
            None => true,
        }
    }
}

/// Role row
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RoleRow {
    pub id: String,
    pub name: String,
}

impl RoleRow {
    pub fn new(name: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
        }
    }
}

/// Role assignment row
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RoleAssignmentRow {
    pub user_id: UserId,
    pub role_id: String,
}
