//! Session row schema
//!
//! Sessions are persisted so a restart keeps them; the data-unlocked bit is
//! deliberately not part of the row (it lives in memory with the vault).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{SessionId, UserId};

/// Default browser session lifetime (7 days), in seconds.
pub const DEFAULT_TTL_BROWSER_SECS: i64 = 7 * 24 * 3600;

/// Default desktop/mobile session lifetime (30 days), in seconds.
pub const DEFAULT_TTL_DEVICE_SECS: i64 = 30 * 24 * 3600;

/// Class of device holding the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Browser,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Desktop => "desktop",
            DeviceClass::Mobile => "mobile",
            DeviceClass::Browser => "browser",
        }
    }
}

/// Session row
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SessionRow {
    pub id: SessionId,

    pub user_id: UserId,

    pub device_class: DeviceClass,

    /// Free-form device descriptor ("Firefox on Linux", "drawbridge-cli 1.2")
    pub device_desc: String,

    pub created_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,

    /// Bumped on each verified request
    pub last_activity: DateTime<Utc>,

    /// Set when the session is revoked; revoked rows never verify again
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl SessionRow {
    pub fn new(user_id: UserId, device_class: DeviceClass, device_desc: String, ttl_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            device_class,
            device_desc,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
            last_activity: now,
            revoked_at: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Expired-or-revoked rows are dead weight the sweeper removes.
    pub fn is_live(&self) -> bool {
        !self.is_expired() && !self.is_revoked()
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}
