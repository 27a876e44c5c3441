//! Hot in-memory store with disk snapshots.
//!
//! All tables live in memory behind one `RwLock`; the save coordinator
//! flushes a JSON snapshot to disk (write-temp-then-rename, owner-only
//! permissions). The storage layer only ever sees ciphertext in sensitive
//! columns; encryption happens above it, on the record-crypto paths.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

use super::schemas::*;
use crate::types::{CredentialId, DrawbridgeError, HostId, Result, SessionId, UserId};

/// Snapshot file name inside the data directory.
pub const SNAPSHOT_FILE: &str = "drawbridge.json";

/// The full table set, serialized as one snapshot document.
#[derive(Serialize, Deserialize, Default)]
pub struct Tables {
    pub users: HashMap<UserId, UserRow>,
    pub kek_salts: HashMap<UserId, KekSaltRow>,
    pub wrapped_deks: HashMap<UserId, WrappedDekRow>,
    pub sessions: HashMap<SessionId, SessionRow>,
    pub hosts: HashMap<HostId, HostRow>,
    pub credentials: HashMap<CredentialId, CredentialRow>,
    pub grants: HashMap<String, GrantRow>,
    pub roles: HashMap<String, RoleRow>,
    pub role_assignments: Vec<RoleAssignmentRow>,
    pub shared_credentials: HashMap<String, SharedCredentialRow>,
    pub pending_shares: HashMap<String, PendingShareRow>,
    pub bookmarks: HashMap<String, BookmarkRow>,
    pub command_history: HashMap<String, CommandHistoryRow>,
    pub recordings: HashMap<String, RecordingRow>,
    pub snippets: HashMap<String, SnippetRow>,
    pub folders: HashMap<String, FolderRow>,
    pub external_tokens: HashMap<String, ExternalTokenRow>,
    pub dashboard_prefs: HashMap<UserId, DashboardPrefsRow>,
    pub settings: HashMap<String, SettingsRow>,
}

impl Tables {
    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Insert a user; display names are unique.
    pub fn insert_user(&mut self, user: UserRow) -> Result<()> {
        if self.users.values().any(|u| u.name == user.name) {
            return Err(DrawbridgeError::Conflict(format!(
                "user name '{}' is taken",
                user.name
            )));
        }
        self.users.insert(user.id.clone(), user);
        Ok(())
    }

    pub fn user(&self, id: &UserId) -> Option<&UserRow> {
        self.users.get(id)
    }

    pub fn user_mut(&mut self, id: &UserId) -> Option<&mut UserRow> {
        self.users.get_mut(id)
    }

    pub fn user_by_name(&self, name: &str) -> Option<&UserRow> {
        self.users.values().find(|u| u.name == name)
    }

    pub fn user_by_external_subject(&self, subject: &str) -> Option<&UserRow> {
        self.users
            .values()
            .find(|u| u.external_subject.as_deref() == Some(subject))
    }

    pub fn admin_count(&self) -> usize {
        self.users.values().filter(|u| u.is_admin).count()
    }

    // ------------------------------------------------------------------
    // Key rows
    // ------------------------------------------------------------------

    pub fn set_kek_salt(&mut self, row: KekSaltRow) {
        self.kek_salts.insert(row.user_id.clone(), row);
    }

    pub fn kek_salt(&self, user_id: &UserId) -> Option<&KekSaltRow> {
        self.kek_salts.get(user_id)
    }

    pub fn set_wrapped_dek(&mut self, row: WrappedDekRow) {
        self.wrapped_deks.insert(row.user_id.clone(), row);
    }

    pub fn wrapped_dek(&self, user_id: &UserId) -> Option<&WrappedDekRow> {
        self.wrapped_deks.get(user_id)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub fn insert_session(&mut self, session: SessionRow) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn session(&self, id: &SessionId) -> Option<&SessionRow> {
        self.sessions.get(id)
    }

    pub fn session_mut(&mut self, id: &SessionId) -> Option<&mut SessionRow> {
        self.sessions.get_mut(id)
    }

    pub fn sessions_by_user(&self, user_id: &UserId) -> Vec<&SessionRow> {
        let mut rows: Vec<_> = self
            .sessions
            .values()
            .filter(|s| &s.user_id == user_id)
            .collect();
        rows.sort_by_key(|s| s.created_at);
        rows
    }

    pub fn all_sessions(&self) -> Vec<&SessionRow> {
        self.sessions.values().collect()
    }

    /// Remove expired and revoked rows; returns how many were dropped.
    pub fn prune_dead_sessions(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.is_live());
        before - self.sessions.len()
    }

    // ------------------------------------------------------------------
    // Hosts and credentials
    // ------------------------------------------------------------------

    pub fn insert_host(&mut self, host: HostRow) -> Result<()> {
        if self
            .hosts
            .values()
            .any(|h| h.owner_id == host.owner_id && h.name == host.name)
        {
            return Err(DrawbridgeError::Conflict(format!(
                "host name '{}' is taken",
                host.name
            )));
        }
        self.hosts.insert(host.id.clone(), host);
        Ok(())
    }

    pub fn host(&self, id: &HostId) -> Option<&HostRow> {
        self.hosts.get(id)
    }

    pub fn host_mut(&mut self, id: &HostId) -> Option<&mut HostRow> {
        self.hosts.get_mut(id)
    }

    pub fn remove_host(&mut self, id: &HostId) -> Option<HostRow> {
        self.hosts.remove(id)
    }

    pub fn hosts_by_owner(&self, owner_id: &UserId) -> Vec<&HostRow> {
        self.hosts
            .values()
            .filter(|h| &h.owner_id == owner_id)
            .collect()
    }

    pub fn insert_credential(&mut self, cred: CredentialRow) -> Result<()> {
        if self
            .credentials
            .values()
            .any(|c| c.owner_id == cred.owner_id && c.name == cred.name)
        {
            return Err(DrawbridgeError::Conflict(format!(
                "credential name '{}' is taken",
                cred.name
            )));
        }
        self.credentials.insert(cred.id.clone(), cred);
        Ok(())
    }

    pub fn credential(&self, id: &CredentialId) -> Option<&CredentialRow> {
        self.credentials.get(id)
    }

    pub fn credential_mut(&mut self, id: &CredentialId) -> Option<&mut CredentialRow> {
        self.credentials.get_mut(id)
    }

    pub fn remove_credential(&mut self, id: &CredentialId) -> Option<CredentialRow> {
        self.credentials.remove(id)
    }

    pub fn credentials_by_owner(&self, owner_id: &UserId) -> Vec<&CredentialRow> {
        self.credentials
            .values()
            .filter(|c| &c.owner_id == owner_id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Grants and roles
    // ------------------------------------------------------------------

    pub fn insert_grant(&mut self, grant: GrantRow) {
        self.grants.insert(grant.id.clone(), grant);
    }

    pub fn grant(&self, id: &str) -> Option<&GrantRow> {
        self.grants.get(id)
    }

    pub fn remove_grant(&mut self, id: &str) -> Option<GrantRow> {
        self.grants.remove(id)
    }

    pub fn grants_for_host(&self, host_id: &HostId) -> Vec<&GrantRow> {
        self.grants
            .values()
            .filter(|g| &g.host_id == host_id)
            .collect()
    }

    pub fn insert_role(&mut self, role: RoleRow) {
        self.roles.insert(role.id.clone(), role);
    }

    pub fn assign_role(&mut self, user_id: UserId, role_id: String) {
        let assignment = RoleAssignmentRow { user_id, role_id };
        if !self.role_assignments.contains(&assignment) {
            self.role_assignments.push(assignment);
        }
    }

    pub fn role_ids_for_user(&self, user_id: &UserId) -> Vec<String> {
        self.role_assignments
            .iter()
            .filter(|a| &a.user_id == user_id)
            .map(|a| a.role_id.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Shared credentials and pending shares
    // ------------------------------------------------------------------

    /// Insert or replace the shared row for (grant, field).
    pub fn upsert_shared_credential(&mut self, row: SharedCredentialRow) {
        self.shared_credentials
            .retain(|_, r| !(r.grant_id == row.grant_id && r.field == row.field));
        self.shared_credentials.insert(row.id.clone(), row);
    }

    pub fn shared_credentials_for(
        &self,
        host_id: &HostId,
        grantee: &UserId,
    ) -> Vec<&SharedCredentialRow> {
        self.shared_credentials
            .values()
            .filter(|r| &r.host_id == host_id && &r.grantee_user_id == grantee)
            .collect()
    }

    pub fn remove_shared_by_grant(&mut self, grant_id: &str) -> usize {
        let before = self.shared_credentials.len();
        self.shared_credentials.retain(|_, r| r.grant_id != grant_id);
        before - self.shared_credentials.len()
    }

    pub fn insert_pending_share(&mut self, row: PendingShareRow) {
        self.pending_shares.insert(row.id.clone(), row);
    }

    pub fn pending_shares_for(&self, grantee: &UserId) -> Vec<PendingShareRow> {
        self.pending_shares
            .values()
            .filter(|r| &r.grantee_user_id == grantee)
            .cloned()
            .collect()
    }

    pub fn remove_pending_share(&mut self, id: &str) -> Option<PendingShareRow> {
        self.pending_shares.remove(id)
    }

    pub fn remove_pending_by_grant(&mut self, grant_id: &str) -> usize {
        let before = self.pending_shares.len();
        self.pending_shares.retain(|_, r| r.grant_id != grant_id);
        before - self.pending_shares.len()
    }

    // ------------------------------------------------------------------
    // Per-user data
    // ------------------------------------------------------------------

    pub fn insert_bookmark(&mut self, row: BookmarkRow) {
        self.bookmarks.insert(row.id.clone(), row);
    }

    pub fn bookmarks_by_owner(&self, owner_id: &UserId) -> Vec<&BookmarkRow> {
        self.bookmarks
            .values()
            .filter(|b| &b.owner_id == owner_id)
            .collect()
    }

    pub fn insert_command_history(&mut self, row: CommandHistoryRow) {
        self.command_history.insert(row.id.clone(), row);
    }

    pub fn command_history_by_owner(&self, owner_id: &UserId) -> Vec<&CommandHistoryRow> {
        self.command_history
            .values()
            .filter(|c| &c.owner_id == owner_id)
            .collect()
    }

    pub fn insert_recording(&mut self, row: RecordingRow) {
        self.recordings.insert(row.id.clone(), row);
    }

    pub fn recordings_by_owner(&self, owner_id: &UserId) -> Vec<&RecordingRow> {
        self.recordings
            .values()
            .filter(|r| &r.owner_id == owner_id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Insert or replace the row for (user, key).
    pub fn upsert_setting(&mut self, row: SettingsRow) {
        self.settings
            .retain(|_, r| !(r.user_id == row.user_id && r.key == row.key));
        self.settings.insert(row.id.clone(), row);
    }

    pub fn setting(&self, user_id: Option<&UserId>, key: &str) -> Option<&SettingsRow> {
        self.settings
            .values()
            .find(|r| r.user_id.as_ref() == user_id && r.key == key)
    }

    // ------------------------------------------------------------------
    // Cascades
    // ------------------------------------------------------------------

    /// Delete every row owned by a user, in dependency order, finishing
    /// with the user row itself. The last remaining admin is protected.
    pub fn cascade_delete_user(&mut self, user_id: &UserId) -> Result<()> {
        let Some(user) = self.users.get(user_id) else {
            return Err(DrawbridgeError::NotFound);
        };
        if user.is_admin && self.admin_count() == 1 {
            return Err(DrawbridgeError::Conflict(
                "cannot delete the last admin user".into(),
            ));
        }

        let owned_hosts: Vec<HostId> = self
            .hosts
            .values()
            .filter(|h| &h.owner_id == user_id)
            .map(|h| h.id.clone())
            .collect();

        // Share grants: to this principal, and on this user's hosts.
        self.grants.retain(|_, g| {
            !(g.principal_kind == PrincipalKind::User && &g.principal_id == user_id)
                && !owned_hosts.contains(&g.host_id)
        });
        self.shared_credentials.retain(|_, r| {
            &r.grantee_user_id != user_id && !owned_hosts.contains(&r.host_id)
        });
        self.pending_shares.retain(|_, r| {
            &r.grantee_user_id != user_id && !owned_hosts.contains(&r.host_id)
        });

        self.sessions.retain(|_, s| &s.user_id != user_id);
        self.recordings.retain(|_, r| &r.owner_id != user_id);
        self.bookmarks.retain(|_, b| &b.owner_id != user_id);
        self.command_history.retain(|_, c| &c.owner_id != user_id);
        self.snippets.retain(|_, s| &s.owner_id != user_id);
        self.folders.retain(|_, f| &f.owner_id != user_id);
        self.hosts.retain(|_, h| &h.owner_id != user_id);
        self.credentials.retain(|_, c| &c.owner_id != user_id);
        self.external_tokens.retain(|_, t| &t.user_id != user_id);
        self.dashboard_prefs.remove(user_id);
        self.role_assignments.retain(|a| &a.user_id != user_id);
        self.settings.retain(|_, s| s.user_id.as_ref() != Some(user_id));

        self.kek_salts.remove(user_id);
        self.wrapped_deks.remove(user_id);
        self.users.remove(user_id);

        info!(user_id = %user_id, operation = "cascade_delete_user", "Deleted user and owned rows");
        Ok(())
    }

    /// Destructive-reset purge: drop every row of this user that holds
    /// ciphertext the old DEK made unreadable. The user row survives.
    pub fn purge_encrypted_rows(&mut self, user_id: &UserId) -> usize {
        let owned_hosts: Vec<HostId> = self
            .hosts
            .values()
            .filter(|h| &h.owner_id == user_id)
            .map(|h| h.id.clone())
            .collect();

        let mut removed = 0usize;

        let grants_before = self.grants.len();
        self.grants.retain(|_, g| !owned_hosts.contains(&g.host_id));
        removed += grants_before - self.grants.len();

        let shared_before = self.shared_credentials.len();
        self.shared_credentials.retain(|_, r| {
            &r.grantee_user_id != user_id && !owned_hosts.contains(&r.host_id)
        });
        removed += shared_before - self.shared_credentials.len();

        let pending_before = self.pending_shares.len();
        self.pending_shares.retain(|_, r| {
            &r.grantee_user_id != user_id && !owned_hosts.contains(&r.host_id)
        });
        removed += pending_before - self.pending_shares.len();

        let hosts_before = self.hosts.len();
        self.hosts.retain(|_, h| &h.owner_id != user_id);
        removed += hosts_before - self.hosts.len();

        let creds_before = self.credentials.len();
        self.credentials.retain(|_, c| &c.owner_id != user_id);
        removed += creds_before - self.credentials.len();

        let bookmarks_before = self.bookmarks.len();
        self.bookmarks.retain(|_, b| &b.owner_id != user_id);
        removed += bookmarks_before - self.bookmarks.len();

        let history_before = self.command_history.len();
        self.command_history.retain(|_, c| &c.owner_id != user_id);
        removed += history_before - self.command_history.len();

        let recordings_before = self.recordings.len();
        self.recordings.retain(|_, r| &r.owner_id != user_id);
        removed += recordings_before - self.recordings.len();

        removed
    }
}

/// The hot store: in-memory tables plus snapshot persistence.
pub struct HotStore {
    tables: RwLock<Tables>,
    /// Absent for purely in-memory stores (tests).
    path: Option<PathBuf>,
}

impl HotStore {
    /// Load the snapshot from `data_dir`, starting empty when none exists.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(SNAPSHOT_FILE);
        let tables = if path.exists() {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| DrawbridgeError::Internal(format!("cannot read snapshot: {e}")))?;
            serde_json::from_str(&raw)
                .map_err(|e| DrawbridgeError::Internal(format!("corrupt snapshot: {e}")))?
        } else {
            Tables::default()
        };

        Ok(Self {
            tables: RwLock::new(tables),
            path: Some(path),
        })
    }

    /// An in-memory store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            path: None,
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().await
    }

    /// Serialize the tables and atomically replace the snapshot file.
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let serialized = {
            let tables = self.tables.read().await;
            serde_json::to_string(&*tables)
                .map_err(|e| DrawbridgeError::Internal(format!("snapshot serialization: {e}")))?
        };

        let tmp = path.with_extension(format!("tmp.{}", Utc::now().timestamp_millis()));
        tokio::fs::write(&tmp, serialized.as_bytes())
            .await
            .map_err(|e| DrawbridgeError::Internal(format!("snapshot write: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            {
                warn!(error = %e, "Could not restrict snapshot permissions");
            }
        }

        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| DrawbridgeError::Internal(format!("snapshot rename: {e}")))?;
        Ok(())
    }
}
