//! Session service.
//!
//! Session rows are persisted (a restart keeps them); the data-unlocked
//! bit is in-memory only and is cleared whenever the owning user's DEK
//! leaves the vault. Revocation is visible to subsequent verifications in
//! this process as soon as `revoke` returns.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::db::schemas::{DeviceClass, SessionRow, DEFAULT_TTL_BROWSER_SECS, DEFAULT_TTL_DEVICE_SECS};
use crate::db::HotStore;
use crate::types::{DrawbridgeError, Result, SessionId, UserId};

/// Soft cap on live sessions per user.
pub const DEFAULT_MAX_SESSIONS_PER_USER: usize = 50;

/// Session lifetimes and caps.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ttl_browser_secs: i64,
    pub ttl_device_secs: i64,
    pub max_sessions_per_user: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_browser_secs: DEFAULT_TTL_BROWSER_SECS,
            ttl_device_secs: DEFAULT_TTL_DEVICE_SECS,
            max_sessions_per_user: DEFAULT_MAX_SESSIONS_PER_USER,
        }
    }
}

/// Persisted sessions with in-memory unlock state.
pub struct SessionService {
    store: Arc<HotStore>,
    /// Data-unlocked bits, keyed by session id. Never persisted.
    unlocked: DashMap<SessionId, UserId>,
    config: SessionConfig,
}

impl SessionService {
    pub fn new(store: Arc<HotStore>, config: SessionConfig) -> Self {
        Self {
            store,
            unlocked: DashMap::new(),
            config,
        }
    }

    fn ttl_for(&self, device_class: DeviceClass) -> i64 {
        match device_class {
            DeviceClass::Browser => self.config.ttl_browser_secs,
            DeviceClass::Desktop | DeviceClass::Mobile => self.config.ttl_device_secs,
        }
    }

    /// Create a session, enforcing the per-user cap by revoking the oldest
    /// non-current session once the cap is exceeded.
    pub async fn create(
        &self,
        user_id: &UserId,
        device_class: DeviceClass,
        device_desc: &str,
    ) -> Result<SessionRow> {
        let row = SessionRow::new(
            user_id.clone(),
            device_class,
            device_desc.to_string(),
            self.ttl_for(device_class),
        );
        let new_id = row.id.clone();

        let mut tables = self.store.write().await;
        tables.insert_session(row.clone());

        let live: Vec<SessionId> = tables
            .sessions_by_user(user_id)
            .iter()
            .filter(|s| s.is_live())
            .map(|s| s.id.clone())
            .collect();

        if live.len() > self.config.max_sessions_per_user {
            // sessions_by_user sorts by creation; the first live row that
            // is not the one just created is the oldest.
            if let Some(oldest) = live.iter().find(|id| **id != new_id).cloned() {
                if let Some(s) = tables.session_mut(&oldest) {
                    s.revoked_at = Some(chrono::Utc::now());
                }
                self.unlocked.remove(&oldest);
                info!(user_id = %user_id, session_id = %oldest, "Revoked oldest session over cap");
            }
        }

        debug!(user_id = %user_id, session_id = %new_id, device = device_class.as_str(), "Created session");
        Ok(row)
    }

    /// Verify a session id: exists, not revoked, not expired. Bumps the
    /// activity timestamp on success.
    pub async fn verify(&self, session_id: &SessionId) -> Result<SessionRow> {
        let mut tables = self.store.write().await;
        let session = tables
            .session_mut(session_id)
            .ok_or(DrawbridgeError::AuthInvalid)?;

        if session.is_revoked() {
            return Err(DrawbridgeError::AuthInvalid);
        }
        if session.is_expired() {
            return Err(DrawbridgeError::AuthExpired);
        }

        session.touch();
        Ok(session.clone())
    }

    /// Set the data-unlocked bit. Only the auth service calls this, right
    /// after installing the DEK in the vault.
    pub fn mark_unlocked(&self, session_id: &SessionId, user_id: &UserId) {
        self.unlocked.insert(session_id.clone(), user_id.clone());
    }

    /// Clear the data-unlocked bit for one session.
    pub fn mark_locked(&self, session_id: &SessionId) {
        self.unlocked.remove(session_id);
    }

    pub fn is_unlocked(&self, session_id: &SessionId) -> bool {
        self.unlocked.contains_key(session_id)
    }

    /// Clear unlocked bits for every session of a user (vault eviction).
    pub fn lock_all(&self, user_id: &UserId) -> usize {
        let mut removed = 0;
        self.unlocked.retain(|_, uid| {
            if uid == user_id {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(user_id = %user_id, sessions = removed, "Cleared unlocked bits");
        }
        removed
    }

    /// Count of currently unlocked sessions for a user.
    pub fn unlocked_count(&self, user_id: &UserId) -> usize {
        self.unlocked.iter().filter(|e| e.value() == user_id).count()
    }

    /// Revoke one session. Visible to subsequent verifications immediately.
    pub async fn revoke(&self, session_id: &SessionId) -> Result<()> {
        let mut tables = self.store.write().await;
        let session = tables
            .session_mut(session_id)
            .ok_or(DrawbridgeError::NotFound)?;
        if session.revoked_at.is_none() {
            session.revoked_at = Some(chrono::Utc::now());
        }
        self.unlocked.remove(session_id);
        debug!(session_id = %session_id, "Revoked session");
        Ok(())
    }

    /// Revoke every session of a user, optionally sparing one (the session
    /// performing a password change keeps itself alive).
    pub async fn revoke_all(&self, user_id: &UserId, except: Option<&SessionId>) -> usize {
        let mut tables = self.store.write().await;
        let ids: Vec<SessionId> = tables
            .sessions_by_user(user_id)
            .iter()
            .filter(|s| s.revoked_at.is_none())
            .filter(|s| except != Some(&s.id))
            .map(|s| s.id.clone())
            .collect();

        let now = chrono::Utc::now();
        for id in &ids {
            if let Some(s) = tables.session_mut(id) {
                s.revoked_at = Some(now);
            }
            self.unlocked.remove(id);
        }

        if !ids.is_empty() {
            info!(user_id = %user_id, sessions = ids.len(), "Revoked sessions");
        }
        ids.len()
    }

    /// Sessions of one user, newest last, with the unlocked bit applied.
    pub async fn list_by_user(&self, user_id: &UserId) -> Vec<SessionRow> {
        let tables = self.store.read().await;
        tables
            .sessions_by_user(user_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// All sessions (admin view).
    pub async fn list_all(&self) -> Vec<SessionRow> {
        let tables = self.store.read().await;
        tables.all_sessions().into_iter().cloned().collect()
    }

    /// Remove expired and revoked rows, clearing any stale unlocked bits.
    /// Called periodically by the app's sweeper task.
    pub async fn sweep(&self) -> usize {
        let mut tables = self.store.write().await;
        let removed = tables.prune_dead_sessions();
        self.unlocked.retain(|sid, _| tables.session(sid).is_some());
        if removed > 0 {
            debug!(sessions = removed, "Swept dead sessions");
        }
        removed
    }
}
