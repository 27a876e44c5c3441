//! Common metadata for all rows
//!
//! Tracks creation and update timestamps. Deletion is always a hard
//! delete here (cascades remove rows outright), so there is no
//! soft-delete state to carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Common metadata for all rows
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Metadata {
    /// When the row was last updated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// When the row was created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Metadata {
    /// Create new metadata with current timestamp
    pub fn new() -> Self {
        Self {
            updated_at: Some(Utc::now()),
            created_at: Some(Utc::now()),
        }
    }

    /// Record an update
    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}
