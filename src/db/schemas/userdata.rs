//! Per-user data rows: file bookmarks, command history, session
//! recordings, snippets, folders, external tokens, dashboard preferences.
//!
//! Bookmark paths and names, command text, and recording payloads are
//! sensitive fields of their respective entity kinds.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metadata::Metadata;
use crate::types::{HostId, UserId};

/// Bookmark kind, one table per kind in the entity registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookmarkKind {
    Recent,
    Pinned,
    Shortcut,
}

/// File bookmark row (recent / pinned / shortcut)
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BookmarkRow {
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub owner_id: UserId,

    pub kind: BookmarkKind,

    pub host_id: HostId,

    /// Remote path, encrypted at rest
    pub path: String,

    /// Display label, encrypted at rest
    pub display_name: String,
}

impl BookmarkRow {
    pub fn new(
        owner_id: UserId,
        kind: BookmarkKind,
        host_id: HostId,
        path: String,
        display_name: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            metadata: Metadata::new(),
            owner_id,
            kind,
            host_id,
            path,
            display_name,
        }
    }
}

/// Command history row
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CommandHistoryRow {
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub owner_id: UserId,

    pub host_id: HostId,

    /// Command text, encrypted at rest
    pub command: String,
}

impl CommandHistoryRow {
    pub fn new(owner_id: UserId, host_id: HostId, command: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            metadata: Metadata::new(),
            owner_id,
            host_id,
            command,
        }
    }
}

/// Session recording row
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RecordingRow {
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub owner_id: UserId,

    pub host_id: HostId,

    /// Recorded terminal payload, encrypted at rest, lazy-read
    pub payload: String,
}

impl RecordingRow {
    pub fn new(owner_id: UserId, host_id: HostId, payload: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            metadata: Metadata::new(),
            owner_id,
            host_id,
            payload,
        }
    }
}

/// Snippet row (saved commands)
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SnippetRow {
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub owner_id: UserId,
    pub name: String,
    pub content: String,
}

/// Folder row (host organization)
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FolderRow {
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub owner_id: UserId,
    pub name: String,
}

/// Stored external-provider token row
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ExternalTokenRow {
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub user_id: UserId,
    pub provider: String,
    pub token: String,
}

/// Dashboard preferences row, one per user
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DashboardPrefsRow {
    pub user_id: UserId,
    pub value: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bookmark_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&BookmarkKind::Shortcut).unwrap(),
            "\"shortcut\""
        );
    }

    #[test]
    fn test_row_constructors() {
        let b = BookmarkRow::new(
            "u-1".into(),
            BookmarkKind::Pinned,
            "h-1".into(),
            "/var/log".into(),
            "logs".into(),
        );
        assert!(!b.id.is_empty());

        let c = CommandHistoryRow::new("u-1".into(), "h-1".into(), "ls -la".into());
        assert_eq!(c.command, "ls -la");
    }
}
