//! Admin user management.
//!
//! Listing, deletion (full owned-row cascade), and admin-flag changes.
//! The last remaining admin can neither be deleted nor demoted.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::access::RequestContext;
use crate::db::{HotStore, SaveCoordinator};
use crate::keys::DekVault;
use crate::sessions::SessionService;
use crate::types::{DrawbridgeError, Result, UserId};

/// User summary for the admin view; never carries sensitive columns.
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    pub is_admin: bool,
    pub is_external: bool,
    pub totp_enabled: bool,
    pub session_count: usize,
}

/// Admin operations on user accounts.
pub struct AdminService {
    store: Arc<HotStore>,
    vault: Arc<DekVault>,
    sessions: Arc<SessionService>,
    saver: Arc<SaveCoordinator>,
}

impl AdminService {
    pub fn new(
        store: Arc<HotStore>,
        vault: Arc<DekVault>,
        sessions: Arc<SessionService>,
        saver: Arc<SaveCoordinator>,
    ) -> Self {
        Self {
            store,
            vault,
            sessions,
            saver,
        }
    }

    fn require_admin(ctx: &RequestContext) -> Result<()> {
        if ctx.is_admin {
            Ok(())
        } else {
            Err(DrawbridgeError::Forbidden)
        }
    }

    pub async fn list_users(&self, ctx: &RequestContext) -> Result<Vec<UserSummary>> {
        Self::require_admin(ctx)?;

        let tables = self.store.read().await;
        let mut users: Vec<UserSummary> = tables
            .users
            .values()
            .map(|u| UserSummary {
                id: u.id.clone(),
                name: u.name.clone(),
                is_admin: u.is_admin,
                is_external: u.is_external,
                totp_enabled: u.totp_enabled,
                session_count: tables
                    .sessions_by_user(&u.id)
                    .iter()
                    .filter(|s| s.is_live())
                    .count(),
            })
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(users)
    }

    /// Delete a user and every row they own, in cascade order. The
    /// resident DEK (if any) is evicted first so nothing can decrypt the
    /// rows while they are going away.
    pub async fn delete_user(&self, ctx: &RequestContext, user_id: &UserId) -> Result<()> {
        Self::require_admin(ctx)?;

        self.vault.evict(user_id);
        self.sessions.lock_all(user_id);

        {
            let mut tables = self.store.write().await;
            tables.cascade_delete_user(user_id)?;
        }

        warn!(
            operation = "user_deleted",
            user_id = %user_id,
            reason = "admin deletion",
            "Deleted user account"
        );
        self.saver.trigger_save("user-deleted");
        Ok(())
    }

    /// Grant or revoke the admin flag. Demoting the last admin is refused.
    pub async fn set_admin(&self, ctx: &RequestContext, user_id: &UserId, admin: bool) -> Result<()> {
        Self::require_admin(ctx)?;

        {
            let mut tables = self.store.write().await;
            let currently_admin = tables
                .user(user_id)
                .map(|u| u.is_admin)
                .ok_or(DrawbridgeError::NotFound)?;

            if currently_admin && !admin && tables.admin_count() == 1 {
                return Err(DrawbridgeError::Conflict(
                    "cannot demote the last admin user".into(),
                ));
            }

            let user = tables.user_mut(user_id).ok_or(DrawbridgeError::NotFound)?;
            user.is_admin = admin;
            user.metadata.touch();
        }
        self.saver.trigger_save("admin-flag-changed");
        Ok(())
    }
}
