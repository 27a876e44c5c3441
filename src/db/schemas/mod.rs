//! Row schemas for the hot store
//!
//! Defines the persisted shapes for users, keys, sessions, hosts,
//! credentials, grants, shares, per-user data, and settings.

mod credential;
mod grant;
mod host;
mod keyrows;
mod metadata;
mod session;
mod settings;
mod share;
mod user;
mod userdata;

pub use credential::CredentialRow;
pub use grant::{GrantLevel, GrantRow, PrincipalKind, RoleAssignmentRow, RoleRow};
pub use host::{HostAuthType, HostRow};
pub use keyrows::{KekSaltRow, WrapKind, WrappedDekRow};
pub use metadata::Metadata;
pub use session::{DeviceClass, SessionRow, DEFAULT_TTL_BROWSER_SECS, DEFAULT_TTL_DEVICE_SECS};
pub use settings::SettingsRow;
pub use share::{PendingShareRow, SharedCredentialRow};
pub use user::UserRow;
pub use userdata::{
    BookmarkKind, BookmarkRow, CommandHistoryRow, DashboardPrefsRow, ExternalTokenRow, FolderRow,
    RecordingRow, SnippetRow,
};
