//! Shared-credential rows: grantee-wrapped views and pending wraps.
//!
//! When a grant is created the grantor re-encrypts each secret field for
//! the grantee. If the grantee has a resident DEK the result lands in a
//! shared-credential row immediately; otherwise it is held under the
//! system pending-share key in a pending row and promoted at the grantee's
//! next unlock.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metadata::Metadata;
use crate::types::{HostId, UserId};

/// A secret field re-encrypted under the grantee's DEK.
///
/// Ciphertext context binds to the host record and the grantee, so the
/// grantee's ordinary read path can decrypt it with their own key.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SharedCredentialRow {
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub grant_id: String,

    pub host_id: HostId,

    pub grantee_user_id: UserId,

    /// Field name within the host entity (e.g. `password`)
    pub field: String,

    /// `v1:` wire form under the grantee's DEK
    pub ciphertext: String,
}

impl SharedCredentialRow {
    pub fn new(
        grant_id: String,
        host_id: HostId,
        grantee_user_id: UserId,
        field: String,
        ciphertext: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            metadata: Metadata::new(),
            grant_id,
            host_id,
            grantee_user_id,
            field,
            ciphertext,
        }
    }
}

/// A secret field held under the system pending-share key because the
/// grantee was not unlocked at grant time.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PendingShareRow {
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub grant_id: String,

    pub host_id: HostId,

    pub grantee_user_id: UserId,

    /// Field name within the host entity
    pub field: String,

    /// `v1:` wire form under the pending-share key, associated data
    /// `pending|grant_id|grantee|field`
    pub ciphertext: String,
}

impl PendingShareRow {
    pub fn new(
        grant_id: String,
        host_id: HostId,
        grantee_user_id: UserId,
        field: String,
        ciphertext: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            metadata: Metadata::new(),
            grant_id,
            host_id,
            grantee_user_id,
            field,
            ciphertext,
        }
    }
}
