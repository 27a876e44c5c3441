//! Entity-kind registry of sensitive fields.
//!
//! The table is compile-time and never mutated at runtime. Each entity kind
//! lists the record fields that must only ever be persisted encrypted, and
//! whether a field is "lazy" (readable on demand without decrypting the
//! surrounding record).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Entity kinds that carry sensitive fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Host,
    Credential,
    User,
    Settings,
    FileBookmarkRecent,
    FileBookmarkPinned,
    FileBookmarkShortcut,
    CommandHistory,
    SessionRecording,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Host => "host",
            EntityKind::Credential => "credential",
            EntityKind::User => "user",
            EntityKind::Settings => "settings",
            EntityKind::FileBookmarkRecent => "file_bookmark_recent",
            EntityKind::FileBookmarkPinned => "file_bookmark_pinned",
            EntityKind::FileBookmarkShortcut => "file_bookmark_shortcut",
            EntityKind::CommandHistory => "command_history",
            EntityKind::SessionRecording => "session_recording",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A sensitive field of an entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    /// Lazy fields are skipped by bulk decryption and read selectively.
    pub lazy: bool,
}

const fn field(name: &'static str) -> FieldSpec {
    FieldSpec { name, lazy: false }
}

const fn lazy_field(name: &'static str) -> FieldSpec {
    FieldSpec { name, lazy: true }
}

const HOST_FIELDS: &[FieldSpec] = &[
    field("password"),
    lazy_field("private_key"),
    field("key_passphrase"),
    field("sudo_password"),
    field("proxy_password"),
    field("autostart_password"),
    lazy_field("autostart_private_key"),
    field("autostart_key_passphrase"),
    field("autostart_sudo_password"),
    field("autostart_proxy_password"),
];

const CREDENTIAL_FIELDS: &[FieldSpec] = &[
    field("password"),
    lazy_field("private_key"),
    field("key_passphrase"),
];

const USER_FIELDS: &[FieldSpec] = &[field("totp_secret"), field("totp_backup_codes")];

const SETTINGS_FIELDS: &[FieldSpec] = &[field("value")];

const BOOKMARK_FIELDS: &[FieldSpec] = &[field("path"), field("display_name")];

const COMMAND_HISTORY_FIELDS: &[FieldSpec] = &[field("command")];

const SESSION_RECORDING_FIELDS: &[FieldSpec] = &[lazy_field("payload")];

/// Sensitive fields of an entity kind.
pub fn sensitive_fields(kind: EntityKind) -> &'static [FieldSpec] {
    match kind {
        EntityKind::Host => HOST_FIELDS,
        EntityKind::Credential => CREDENTIAL_FIELDS,
        EntityKind::User => USER_FIELDS,
        EntityKind::Settings => SETTINGS_FIELDS,
        EntityKind::FileBookmarkRecent
        | EntityKind::FileBookmarkPinned
        | EntityKind::FileBookmarkShortcut => BOOKMARK_FIELDS,
        EntityKind::CommandHistory => COMMAND_HISTORY_FIELDS,
        EntityKind::SessionRecording => SESSION_RECORDING_FIELDS,
    }
}

/// Whether a field of the given kind is sensitive.
pub fn is_sensitive(kind: EntityKind, field_name: &str) -> bool {
    sensitive_fields(kind).iter().any(|f| f.name == field_name)
}

/// Whether a field is lazy (selective decrypt on demand).
pub fn is_lazy(kind: EntityKind, field_name: &str) -> bool {
    sensitive_fields(kind)
        .iter()
        .any(|f| f.name == field_name && f.lazy)
}
