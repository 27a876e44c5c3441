//! Data-access gate.
//!
//! Request-scoped resolution from bearer token to `{user, DEK}`. Every
//! handler that touches sensitive records goes through here; none of them
//! reach into the vault directly. A valid session whose DEK is no longer
//! resident (idle eviction, fleet revocation) resolves to `locked-data`,
//! prompting a re-unlock rather than a fresh login.

use std::sync::Arc;

use crate::db::HotStore;
use crate::keys::{Dek, DekVault};
use crate::sessions::{extract_bearer, SessionService, TokenService};
use crate::types::{DrawbridgeError, Result, SessionId, UserId};

/// What the gate attaches to an authenticated, unlocked request.
pub struct RequestContext {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub is_admin: bool,
    pub dek: Dek,
}

/// Resolves bearer tokens into request contexts.
pub struct AccessGate {
    store: Arc<HotStore>,
    vault: Arc<DekVault>,
    sessions: Arc<SessionService>,
    tokens: Arc<TokenService>,
}

impl AccessGate {
    pub fn new(
        store: Arc<HotStore>,
        vault: Arc<DekVault>,
        sessions: Arc<SessionService>,
        tokens: Arc<TokenService>,
    ) -> Self {
        Self {
            store,
            vault,
            sessions,
            tokens,
        }
    }

    /// Resolve an `Authorization` header value into a request context.
    pub async fn resolve_header(&self, header: Option<&str>) -> Result<RequestContext> {
        let token = header
            .and_then(extract_bearer)
            .ok_or(DrawbridgeError::AuthMissing)?;
        self.resolve_token(token).await
    }

    /// Resolve a bearer token into a request context.
    ///
    /// Order matters: token signature/expiry, then session liveness, then
    /// DEK residency. A pending-TOTP token opens nothing here.
    pub async fn resolve_token(&self, token: &str) -> Result<RequestContext> {
        let claims = self.tokens.verify(token)?;
        if claims.pending_totp {
            return Err(DrawbridgeError::AuthInvalid);
        }

        let session = self.sessions.verify(&claims.sid).await?;
        if session.user_id != claims.sub {
            return Err(DrawbridgeError::AuthInvalid);
        }

        let dek = self
            .vault
            .get(&session.user_id)
            .ok_or(DrawbridgeError::LockedData)?;
        if !self.sessions.is_unlocked(&session.id) {
            return Err(DrawbridgeError::LockedData);
        }

        let is_admin = {
            let tables = self.store.read().await;
            tables
                .user(&session.user_id)
                .map(|u| u.is_admin)
                .unwrap_or(false)
        };

        Ok(RequestContext {
            user_id: session.user_id,
            session_id: session.id,
            is_admin,
            dek,
        })
    }
}
