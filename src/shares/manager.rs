//! Shared-credential manager.
//!
//! A grantor owns credential ciphertext under their own DEK; a grantee
//! must be able to decrypt without ever touching the grantor's key. At
//! grant time the grantor (who is unlocked) decrypts each secret field and
//! re-encrypts it either under the grantee's DEK (grantee unlocked) or
//! under the system pending-share key (grantee offline). Pending rows are
//! promoted at the grantee's next successful unlock.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::db::schemas::{
    GrantLevel, GrantRow, HostAuthType, PendingShareRow, PrincipalKind, SharedCredentialRow,
};
use crate::db::HotStore;
use crate::fieldcrypto::{decrypt_field, encrypt_field, open_bytes, seal_bytes, EntityKind, FieldContext};
use crate::keys::{Dek, DekVault, SystemKeys};
use crate::types::{DrawbridgeError, HostId, Result, UserId};

/// Secret fields shared with a grantee.
const SHARED_SECRET_FIELDS: &[&str] = &["password", "private_key", "key_passphrase"];

/// Associated data for a pending-share ciphertext.
fn pending_aad(grant_id: &str, grantee: &UserId, field: &str) -> Vec<u8> {
    format!("pending|{grant_id}|{grantee}|{field}").into_bytes()
}

/// Re-wraps credential secrets between user keys, with a pending queue for
/// offline grantees.
pub struct ShareManager {
    store: Arc<HotStore>,
    vault: Arc<DekVault>,
    system: Arc<SystemKeys>,
}

impl ShareManager {
    pub fn new(store: Arc<HotStore>, vault: Arc<DekVault>, system: Arc<SystemKeys>) -> Self {
        Self {
            store,
            vault,
            system,
        }
    }

    /// Create a grant and materialize the secret re-wraps for its
    /// grantee(s). The caller must be the host owner and unlocked.
    pub async fn create_grant(
        &self,
        owner_id: &UserId,
        owner_dek: &Dek,
        host_id: &HostId,
        principal_kind: PrincipalKind,
        principal_id: &str,
        level: GrantLevel,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<GrantRow> {
        // Resolve the secret plaintexts under the owner's key first; a
        // decrypt failure must not leave a half-created grant behind.
        let plaintexts = self.resolve_owner_secrets(owner_id, owner_dek, host_id).await?;

        let grant = GrantRow::new(
            host_id.clone(),
            principal_kind,
            principal_id.to_string(),
            level,
            expires_at,
        );

        let grantees: Vec<UserId> = match principal_kind {
            PrincipalKind::User => vec![principal_id.to_string()],
            PrincipalKind::Role => {
                let tables = self.store.read().await;
                tables
                    .role_assignments
                    .iter()
                    .filter(|a| a.role_id == principal_id)
                    .map(|a| a.user_id.clone())
                    .collect()
            }
        };

        let mut tables = self.store.write().await;
        tables.insert_grant(grant.clone());

        for grantee in &grantees {
            if grantee == owner_id {
                continue;
            }
            for (field, plaintext) in &plaintexts {
                if let Some(grantee_dek) = self.vault.get(grantee) {
                    let ctx = FieldContext {
                        kind: EntityKind::Host,
                        record_id: host_id,
                        field_name: field,
                        user_id: grantee,
                    };
                    let ciphertext = encrypt_field(plaintext, &grantee_dek, &ctx)?;
                    tables.upsert_shared_credential(SharedCredentialRow::new(
                        grant.id.clone(),
                        host_id.clone(),
                        grantee.clone(),
                        field.to_string(),
                        ciphertext,
                    ));
                } else {
                    let ciphertext = seal_bytes(
                        self.system.pending_share_wrap(),
                        plaintext.as_bytes(),
                        &pending_aad(&grant.id, grantee, field),
                    )?;
                    tables.insert_pending_share(PendingShareRow::new(
                        grant.id.clone(),
                        host_id.clone(),
                        grantee.clone(),
                        field.to_string(),
                        ciphertext,
                    ));
                }
            }
        }

        info!(
            grant_id = %grant.id,
            host_id = %host_id,
            grantees = grantees.len(),
            "Created share grant"
        );
        Ok(grant)
    }

    /// Promote pending rows for a user who just unlocked. Idempotent per
    /// row; a single bad row is logged and left for the next unlock.
    pub async fn flush_pending(&self, user_id: &UserId, dek: &Dek) -> usize {
        let pending = {
            let tables = self.store.read().await;
            tables.pending_shares_for(user_id)
        };
        if pending.is_empty() {
            return 0;
        }

        let mut flushed = 0;
        for row in pending {
            let opened = open_bytes(
                self.system.pending_share_wrap(),
                &row.ciphertext,
                &pending_aad(&row.grant_id, &row.grantee_user_id, &row.field),
            )
            .and_then(|bytes| {
                String::from_utf8(bytes).map_err(|_| {
                    DrawbridgeError::CryptoFailed("pending share is not UTF-8".into())
                })
            });

            let plaintext = match opened {
                Ok(p) => p,
                Err(e) => {
                    warn!(
                        pending_id = %row.id,
                        grant_id = %row.grant_id,
                        error = %e,
                        "Skipping undecryptable pending share"
                    );
                    continue;
                }
            };

            let ctx = FieldContext {
                kind: EntityKind::Host,
                record_id: &row.host_id,
                field_name: &row.field,
                user_id: user_id,
            };
            let sealed = match encrypt_field(&plaintext, dek, &ctx) {
                Ok(s) => s,
                Err(e) => {
                    warn!(pending_id = %row.id, error = %e, "Skipping pending share re-wrap");
                    continue;
                }
            };

            let mut tables = self.store.write().await;
            // Re-check under the lock; another flush of the same user may
            // have consumed the row already.
            if tables.remove_pending_share(&row.id).is_none() {
                continue;
            }
            tables.upsert_shared_credential(SharedCredentialRow::new(
                row.grant_id.clone(),
                row.host_id.clone(),
                row.grantee_user_id.clone(),
                row.field.clone(),
                sealed,
            ));
            flushed += 1;
        }

        if flushed > 0 {
            debug!(user_id = %user_id, rows = flushed, "Flushed pending shares");
        }
        flushed
    }

    /// Revoke a grant: the grantee-wrapped rows and any pending rows go;
    /// the grantor's own ciphertext is untouched.
    pub async fn revoke_grant(&self, caller_id: &UserId, grant_id: &str) -> Result<()> {
        let mut tables = self.store.write().await;

        let Some(grant) = tables.grant(grant_id) else {
            return Err(DrawbridgeError::NotFound);
        };
        let host_owner = tables
            .host(&grant.host_id)
            .map(|h| h.owner_id.clone())
            .ok_or(DrawbridgeError::NotFound)?;
        let is_admin = tables.user(caller_id).map(|u| u.is_admin).unwrap_or(false);
        if &host_owner != caller_id && !is_admin {
            return Err(DrawbridgeError::Forbidden);
        }

        tables.remove_grant(grant_id);
        let shared = tables.remove_shared_by_grant(grant_id);
        let pending = tables.remove_pending_by_grant(grant_id);

        info!(
            grant_id = %grant_id,
            shared_rows = shared,
            pending_rows = pending,
            "Revoked share grant"
        );
        Ok(())
    }

    /// Resolve the secrets a grantee can see on a shared host, decrypted
    /// with the grantee's own DEK.
    ///
    /// When a grant is active but the shared rows have not been
    /// materialized yet (the grantee has not unlocked since the grant),
    /// this fails with `LockedData` and the UI shows the host as pending.
    pub async fn resolve_shared_secrets(
        &self,
        grantee_id: &UserId,
        grantee_dek: &Dek,
        host_id: &HostId,
    ) -> Result<BTreeMap<String, String>> {
        let rows = {
            let tables = self.store.read().await;

            let now = Utc::now();
            let roles = tables.role_ids_for_user(grantee_id);
            let has_active_grant = tables.grants_for_host(host_id).iter().any(|g| {
                g.is_active_at(now)
                    && match g.principal_kind {
                        PrincipalKind::User => &g.principal_id == grantee_id,
                        PrincipalKind::Role => roles.contains(&g.principal_id),
                    }
            });
            if !has_active_grant {
                return Err(DrawbridgeError::Forbidden);
            }

            tables
                .shared_credentials_for(host_id, grantee_id)
                .into_iter()
                .cloned()
                .collect::<Vec<_>>()
        };

        if rows.is_empty() {
            // Grant exists but nothing materialized: pending until the
            // grantee's next unlock.
            let tables = self.store.read().await;
            let has_pending = tables
                .pending_shares_for(grantee_id)
                .iter()
                .any(|p| &p.host_id == host_id);
            if has_pending {
                return Err(DrawbridgeError::LockedData);
            }
            return Ok(BTreeMap::new());
        }

        let mut secrets = BTreeMap::new();
        for row in rows {
            let ctx = FieldContext {
                kind: EntityKind::Host,
                record_id: host_id,
                field_name: &row.field,
                user_id: grantee_id,
            };
            let plaintext =
                decrypt_field(&row.ciphertext, grantee_dek, &ctx).map_err(|e| e.sanitize_data_path())?;
            secrets.insert(row.field, plaintext);
        }
        Ok(secrets)
    }

    /// Decrypt the owner's shareable secret fields for a host, following a
    /// credential reference when the host uses one.
    async fn resolve_owner_secrets(
        &self,
        owner_id: &UserId,
        owner_dek: &Dek,
        host_id: &HostId,
    ) -> Result<Vec<(String, String)>> {
        let tables = self.store.read().await;
        let host = tables.host(host_id).ok_or(DrawbridgeError::NotFound)?;
        if &host.owner_id != owner_id {
            return Err(DrawbridgeError::Forbidden);
        }

        let mut out = Vec::new();

        if host.auth_type == HostAuthType::Credential {
            let cred_id = host
                .credential_id
                .as_ref()
                .ok_or_else(|| DrawbridgeError::Internal("host references no credential".into()))?;
            let cred = tables.credential(cred_id).ok_or(DrawbridgeError::NotFound)?;

            for (field, value) in [
                ("password", &cred.password),
                ("private_key", &cred.private_key),
                ("key_passphrase", &cred.key_passphrase),
            ] {
                if let Some(stored) = value {
                    let ctx = FieldContext {
                        kind: EntityKind::Credential,
                        record_id: cred_id,
                        field_name: field,
                        user_id: owner_id,
                    };
                    out.push((field.to_string(), decrypt_field(stored, owner_dek, &ctx)?));
                }
            }
        } else {
            for (field, value) in [
                ("password", &host.password),
                ("private_key", &host.private_key),
                ("key_passphrase", &host.key_passphrase),
            ] {
                if let Some(stored) = value {
                    let ctx = FieldContext {
                        kind: EntityKind::Host,
                        record_id: host_id,
                        field_name: field,
                        user_id: owner_id,
                    };
                    out.push((field.to_string(), decrypt_field(stored, owner_dek, &ctx)?));
                }
            }
        }

        debug_assert!(out
            .iter()
            .all(|(f, _)| SHARED_SECRET_FIELDS.contains(&f.as_str())));
        Ok(out)
    }
}
