//! Record service: the storage-facing write and read paths.
//!
//! Owner-scoped CRUD for hosts, credentials, and the per-user data
//! entities, all routed through the record crypto layer so sensitive
//! columns only ever hit the store in `v1:` wire form. Grantee reads
//! resolve secrets through the share manager, never by decrypting the
//! owner's ciphertext.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::access::{Intent, PermissionResolver, RequestContext};
use crate::db::schemas::{
    BookmarkKind, BookmarkRow, CommandHistoryRow, CredentialRow, HostRow, RecordingRow,
    SettingsRow,
};
use crate::db::{HotStore, SaveCoordinator};
use crate::fieldcrypto::{decrypt_field, encrypt_field, is_encrypted, EntityKind, FieldContext, RecordCrypto};
use crate::keys::{DekVault, SystemKeys};
use crate::shares::ShareManager;
use crate::types::{CredentialId, DrawbridgeError, HostId, Result, UserId};

/// Host columns only the owner may change; a write grant does not cover
/// auth configuration.
const HOST_AUTH_CONFIG_FIELDS: &[&str] = &["auth_type", "credential_id"];

/// Host columns a non-owner write grant may touch.
const HOST_SHARED_WRITABLE_FIELDS: &[&str] = &["name", "hostname", "port", "username"];

fn to_row<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(DrawbridgeError::Internal("row is not an object".into())),
        Err(e) => Err(DrawbridgeError::Internal(format!("row serialization: {e}"))),
    }
}

fn from_row<T: DeserializeOwned>(map: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(map))
        .map_err(|e| DrawbridgeError::Internal(format!("row deserialization: {e}")))
}

/// Entity-level operations over the hot store.
pub struct RecordService {
    store: Arc<HotStore>,
    vault: Arc<DekVault>,
    system: Arc<SystemKeys>,
    resolver: Arc<PermissionResolver>,
    shares: Arc<ShareManager>,
    saver: Arc<SaveCoordinator>,
}

impl RecordService {
    pub fn new(
        store: Arc<HotStore>,
        vault: Arc<DekVault>,
        system: Arc<SystemKeys>,
        resolver: Arc<PermissionResolver>,
        shares: Arc<ShareManager>,
        saver: Arc<SaveCoordinator>,
    ) -> Self {
        Self {
            store,
            vault,
            system,
            resolver,
            shares,
            saver,
        }
    }

    // ------------------------------------------------------------------
    // Hosts
    // ------------------------------------------------------------------

    /// Create a host. Plaintext secrets in the input are sealed before the
    /// row reaches the store.
    pub async fn create_host(&self, ctx: &RequestContext, mut host: HostRow) -> Result<HostRow> {
        host.owner_id = ctx.user_id.clone();

        let mut row = to_row(&host)?;
        RecordCrypto::encrypt_for_insert(EntityKind::Host, &mut row, &ctx.user_id, &ctx.dek)?;
        let sealed: HostRow = from_row(row)?;

        {
            let mut tables = self.store.write().await;
            tables.insert_host(sealed.clone())?;
        }
        self.saver.trigger_save("host-created");
        Ok(sealed)
    }

    /// Read a host. Owners get their own fields decrypted (lazy ones stay
    /// sealed); grantees get the shared secret set resolved through the
    /// share manager.
    pub async fn get_host(&self, ctx: &RequestContext, host_id: &HostId) -> Result<HostRow> {
        let access = self.resolver.resolve(&ctx.user_id, host_id, Intent::Read).await?;
        if !access.allowed {
            return Err(DrawbridgeError::Forbidden);
        }

        let stored = {
            let tables = self.store.read().await;
            tables.host(host_id).cloned().ok_or(DrawbridgeError::NotFound)?
        };

        if access.is_owner {
            let mut row = to_row(&stored)?;
            RecordCrypto::decrypt_row(EntityKind::Host, &mut row, &ctx.user_id, &ctx.dek, false)
                .map_err(|e| e.sanitize_data_path())?;
            return from_row(row);
        }

        // Grantee view: owner ciphertext is stripped, shared secrets (if
        // materialized) are merged in.
        let mut view = stored;
        view.password = None;
        view.private_key = None;
        view.key_passphrase = None;
        view.sudo_password = None;
        view.proxy_password = None;
        view.autostart_password = None;
        view.autostart_private_key = None;
        view.autostart_key_passphrase = None;
        view.autostart_sudo_password = None;
        view.autostart_proxy_password = None;

        match self
            .shares
            .resolve_shared_secrets(&ctx.user_id, &ctx.dek, host_id)
            .await
        {
            Ok(secrets) => {
                view.password = secrets.get("password").cloned();
                view.private_key = secrets.get("private_key").cloned();
                view.key_passphrase = secrets.get("key_passphrase").cloned();
                Ok(view)
            }
            // The host row is visible while the share is still pending;
            // operations that need the secret surface the locked state.
            Err(DrawbridgeError::LockedData) => Ok(view),
            Err(e) => Err(e),
        }
    }

    /// Selectively decrypt one lazy host field (private key material).
    pub async fn host_lazy_field(
        &self,
        ctx: &RequestContext,
        host_id: &HostId,
        field: &str,
    ) -> Result<Option<String>> {
        let access = self.resolver.resolve(&ctx.user_id, host_id, Intent::Read).await?;
        if !access.allowed {
            return Err(DrawbridgeError::Forbidden);
        }

        if !access.is_owner {
            let secrets = self
                .shares
                .resolve_shared_secrets(&ctx.user_id, &ctx.dek, host_id)
                .await?;
            return Ok(secrets.get(field).cloned());
        }

        let tables = self.store.read().await;
        let host = tables.host(host_id).ok_or(DrawbridgeError::NotFound)?;
        let row = to_row(host)?;
        RecordCrypto::decrypt_lazy_field(EntityKind::Host, &row, field, &ctx.user_id, &ctx.dek)
            .map_err(|e| e.sanitize_data_path())
    }

    /// Patch a host. Owners may change anything; a non-owner write grant
    /// covers connection basics but never auth configuration or secrets.
    pub async fn update_host(
        &self,
        ctx: &RequestContext,
        host_id: &HostId,
        patch: Map<String, Value>,
    ) -> Result<()> {
        let access = self.resolver.resolve(&ctx.user_id, host_id, Intent::Write).await?;
        if !access.allowed {
            return Err(DrawbridgeError::Forbidden);
        }

        if !access.is_owner {
            let illegal = patch.keys().any(|k| {
                HOST_AUTH_CONFIG_FIELDS.contains(&k.as_str())
                    || !HOST_SHARED_WRITABLE_FIELDS.contains(&k.as_str())
            });
            if illegal {
                return Err(DrawbridgeError::Forbidden);
            }
        }

        let owner_id = {
            let tables = self.store.read().await;
            tables.host(host_id).map(|h| h.owner_id.clone()).ok_or(DrawbridgeError::NotFound)?
        };

        // Sensitive patch values are sealed under the owner's key; only
        // the owner reaches this point with secrets in the patch.
        let mut patch = patch;
        patch.insert("id".into(), Value::String(host_id.clone()));
        RecordCrypto::encrypt_for_insert(EntityKind::Host, &mut patch, &owner_id, &ctx.dek)?;
        patch.remove("id");

        {
            let mut tables = self.store.write().await;
            let host = tables.host_mut(host_id).ok_or(DrawbridgeError::NotFound)?;
            let mut row = to_row(&*host)?;
            for (k, v) in patch {
                row.insert(k, v);
            }
            *host = from_row(row)?;
            host.metadata.touch();
        }
        self.saver.trigger_save("host-updated");
        Ok(())
    }

    /// Delete a host; owner only. Grants and shared rows on it go too.
    pub async fn delete_host(&self, ctx: &RequestContext, host_id: &HostId) -> Result<()> {
        let access = self.resolver.resolve(&ctx.user_id, host_id, Intent::Write).await?;
        if !access.is_owner {
            return Err(DrawbridgeError::Forbidden);
        }

        {
            let mut tables = self.store.write().await;
            let grant_ids: Vec<String> = tables
                .grants_for_host(host_id)
                .iter()
                .map(|g| g.id.clone())
                .collect();
            for grant_id in grant_ids {
                tables.remove_grant(&grant_id);
                tables.remove_shared_by_grant(&grant_id);
                tables.remove_pending_by_grant(&grant_id);
            }
            tables.remove_host(host_id).ok_or(DrawbridgeError::NotFound)?;
        }
        self.saver.trigger_save("host-deleted");
        Ok(())
    }

    /// The caller's own hosts, secrets decrypted (lazy fields sealed).
    pub async fn list_hosts(&self, ctx: &RequestContext) -> Result<Vec<HostRow>> {
        let stored: Vec<HostRow> = {
            let tables = self.store.read().await;
            tables.hosts_by_owner(&ctx.user_id).into_iter().cloned().collect()
        };

        let mut rows = Vec::with_capacity(stored.len());
        for host in &stored {
            rows.push(to_row(host)?);
        }
        RecordCrypto::decrypt_after_select(EntityKind::Host, &mut rows, &ctx.user_id, &ctx.dek)
            .map_err(|e| e.sanitize_data_path())?;

        rows.into_iter().map(from_row).collect()
    }

    // ------------------------------------------------------------------
    // Autostart
    // ------------------------------------------------------------------

    /// Enable autostart for a host: current connection secrets are copied
    /// into the autostart columns (each sealed under its own field
    /// binding) so the tunnel worker can resolve them while the owner is
    /// unlocked. Disabling clears the copies.
    pub async fn set_autostart(&self, ctx: &RequestContext, host_id: &HostId, enable: bool) -> Result<()> {
        let access = self.resolver.resolve(&ctx.user_id, host_id, Intent::Write).await?;
        if !access.is_owner {
            return Err(DrawbridgeError::Forbidden);
        }

        let stored = {
            let tables = self.store.read().await;
            tables.host(host_id).cloned().ok_or(DrawbridgeError::NotFound)?
        };

        let mut updated = stored.clone();
        updated.autostart = enable;

        if enable {
            for (source, target) in [
                ("password", "autostart_password"),
                ("private_key", "autostart_private_key"),
                ("key_passphrase", "autostart_key_passphrase"),
                ("sudo_password", "autostart_sudo_password"),
                ("proxy_password", "autostart_proxy_password"),
            ] {
                let row = to_row(&stored)?;
                let Some(plaintext) = RecordCrypto::decrypt_lazy_field(
                    EntityKind::Host,
                    &row,
                    source,
                    &ctx.user_id,
                    &ctx.dek,
                )
                .map_err(|e| e.sanitize_data_path())?
                else {
                    continue;
                };

                let target_ctx = FieldContext {
                    kind: EntityKind::Host,
                    record_id: host_id,
                    field_name: target,
                    user_id: &ctx.user_id,
                };
                let sealed = encrypt_field(&plaintext, &ctx.dek, &target_ctx)?;
                match target {
                    "autostart_password" => updated.autostart_password = Some(sealed),
                    "autostart_private_key" => updated.autostart_private_key = Some(sealed),
                    "autostart_key_passphrase" => updated.autostart_key_passphrase = Some(sealed),
                    "autostart_sudo_password" => updated.autostart_sudo_password = Some(sealed),
                    "autostart_proxy_password" => updated.autostart_proxy_password = Some(sealed),
                    _ => unreachable!(),
                }
            }
        } else {
            updated.autostart_password = None;
            updated.autostart_private_key = None;
            updated.autostart_key_passphrase = None;
            updated.autostart_sudo_password = None;
            updated.autostart_proxy_password = None;
        }

        {
            let mut tables = self.store.write().await;
            let host = tables.host_mut(host_id).ok_or(DrawbridgeError::NotFound)?;
            *host = updated;
            host.metadata.touch();
        }
        self.saver.trigger_save("autostart-changed");
        Ok(())
    }

    /// Resolve autostart credentials for a co-located worker. The caller
    /// presents the internal RPC token; the owner's DEK must be resident.
    pub async fn autostart_credentials(
        &self,
        internal_token: &[u8],
        host_id: &HostId,
    ) -> Result<Map<String, Value>> {
        if !self.system.verify_internal_token(internal_token) {
            return Err(DrawbridgeError::AuthInvalid);
        }

        let host = {
            let tables = self.store.read().await;
            tables.host(host_id).cloned().ok_or(DrawbridgeError::NotFound)?
        };
        if !host.autostart {
            return Err(DrawbridgeError::Forbidden);
        }

        let dek = self.vault.get(&host.owner_id).ok_or(DrawbridgeError::LockedData)?;

        let mut out = Map::new();
        for (field, value) in [
            ("autostart_password", &host.autostart_password),
            ("autostart_private_key", &host.autostart_private_key),
            ("autostart_key_passphrase", &host.autostart_key_passphrase),
            ("autostart_sudo_password", &host.autostart_sudo_password),
            ("autostart_proxy_password", &host.autostart_proxy_password),
        ] {
            if let Some(stored) = value {
                let field_ctx = FieldContext {
                    kind: EntityKind::Host,
                    record_id: host_id,
                    field_name: field,
                    user_id: &host.owner_id,
                };
                let plaintext =
                    decrypt_field(stored, &dek, &field_ctx).map_err(|e| e.sanitize_data_path())?;
                out.insert(field.to_string(), Value::String(plaintext));
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    pub async fn create_credential(
        &self,
        ctx: &RequestContext,
        mut credential: CredentialRow,
    ) -> Result<CredentialRow> {
        credential.owner_id = ctx.user_id.clone();

        let mut row = to_row(&credential)?;
        RecordCrypto::encrypt_for_insert(EntityKind::Credential, &mut row, &ctx.user_id, &ctx.dek)?;
        let sealed: CredentialRow = from_row(row)?;

        {
            let mut tables = self.store.write().await;
            tables.insert_credential(sealed.clone())?;
        }
        self.saver.trigger_save("credential-created");
        Ok(sealed)
    }

    pub async fn get_credential(
        &self,
        ctx: &RequestContext,
        credential_id: &CredentialId,
    ) -> Result<CredentialRow> {
        let stored = {
            let tables = self.store.read().await;
            tables
                .credential(credential_id)
                .cloned()
                .ok_or(DrawbridgeError::NotFound)?
        };
        if stored.owner_id != ctx.user_id {
            return Err(DrawbridgeError::Forbidden);
        }

        let mut row = to_row(&stored)?;
        RecordCrypto::decrypt_row(EntityKind::Credential, &mut row, &ctx.user_id, &ctx.dek, false)
            .map_err(|e| e.sanitize_data_path())?;
        from_row(row)
    }

    pub async fn list_credentials(&self, ctx: &RequestContext) -> Result<Vec<CredentialRow>> {
        let stored: Vec<CredentialRow> = {
            let tables = self.store.read().await;
            tables
                .credentials_by_owner(&ctx.user_id)
                .into_iter()
                .cloned()
                .collect()
        };

        let mut rows = Vec::with_capacity(stored.len());
        for cred in &stored {
            rows.push(to_row(cred)?);
        }
        RecordCrypto::decrypt_after_select(EntityKind::Credential, &mut rows, &ctx.user_id, &ctx.dek)
            .map_err(|e| e.sanitize_data_path())?;
        rows.into_iter().map(from_row).collect()
    }

    /// Delete a credential; refused while a host still references it.
    pub async fn delete_credential(&self, ctx: &RequestContext, credential_id: &CredentialId) -> Result<()> {
        let mut tables = self.store.write().await;
        let stored = tables
            .credential(credential_id)
            .ok_or(DrawbridgeError::NotFound)?;
        if stored.owner_id != ctx.user_id {
            return Err(DrawbridgeError::Forbidden);
        }

        let in_use = tables
            .hosts_by_owner(&ctx.user_id)
            .iter()
            .any(|h| h.credential_id.as_deref() == Some(credential_id));
        if in_use {
            return Err(DrawbridgeError::Conflict(
                "credential is referenced by a host".into(),
            ));
        }

        tables.remove_credential(credential_id);
        drop(tables);
        self.saver.trigger_save("credential-deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-user data
    // ------------------------------------------------------------------

    pub async fn add_bookmark(
        &self,
        ctx: &RequestContext,
        kind: BookmarkKind,
        host_id: &HostId,
        path: &str,
        display_name: &str,
    ) -> Result<BookmarkRow> {
        let bookmark = BookmarkRow::new(
            ctx.user_id.clone(),
            kind,
            host_id.clone(),
            path.to_string(),
            display_name.to_string(),
        );

        let entity_kind = bookmark_entity_kind(kind);
        let mut row = to_row(&bookmark)?;
        RecordCrypto::encrypt_for_insert(entity_kind, &mut row, &ctx.user_id, &ctx.dek)?;
        let sealed: BookmarkRow = from_row(row)?;

        {
            let mut tables = self.store.write().await;
            tables.insert_bookmark(sealed.clone());
        }
        self.saver.trigger_save("bookmark-added");
        Ok(sealed)
    }

    pub async fn list_bookmarks(
        &self,
        ctx: &RequestContext,
        kind: BookmarkKind,
    ) -> Result<Vec<BookmarkRow>> {
        let stored: Vec<BookmarkRow> = {
            let tables = self.store.read().await;
            tables
                .bookmarks_by_owner(&ctx.user_id)
                .into_iter()
                .filter(|b| b.kind == kind)
                .cloned()
                .collect()
        };

        let entity_kind = bookmark_entity_kind(kind);
        let mut rows = Vec::with_capacity(stored.len());
        for b in &stored {
            rows.push(to_row(b)?);
        }
        RecordCrypto::decrypt_after_select(entity_kind, &mut rows, &ctx.user_id, &ctx.dek)
            .map_err(|e| e.sanitize_data_path())?;
        rows.into_iter().map(from_row).collect()
    }

    pub async fn record_command(
        &self,
        ctx: &RequestContext,
        host_id: &HostId,
        command: &str,
    ) -> Result<()> {
        let entry = CommandHistoryRow::new(ctx.user_id.clone(), host_id.clone(), command.to_string());

        let mut row = to_row(&entry)?;
        RecordCrypto::encrypt_for_insert(EntityKind::CommandHistory, &mut row, &ctx.user_id, &ctx.dek)?;
        let sealed: CommandHistoryRow = from_row(row)?;

        {
            let mut tables = self.store.write().await;
            tables.insert_command_history(sealed);
        }
        self.saver.trigger_save("command-recorded");
        Ok(())
    }

    pub async fn list_command_history(&self, ctx: &RequestContext) -> Result<Vec<CommandHistoryRow>> {
        let stored: Vec<CommandHistoryRow> = {
            let tables = self.store.read().await;
            tables
                .command_history_by_owner(&ctx.user_id)
                .into_iter()
                .cloned()
                .collect()
        };

        let mut rows = Vec::with_capacity(stored.len());
        for c in &stored {
            rows.push(to_row(c)?);
        }
        RecordCrypto::decrypt_after_select(EntityKind::CommandHistory, &mut rows, &ctx.user_id, &ctx.dek)
            .map_err(|e| e.sanitize_data_path())?;
        rows.into_iter().map(from_row).collect()
    }

    pub async fn store_recording(
        &self,
        ctx: &RequestContext,
        host_id: &HostId,
        payload: &str,
    ) -> Result<RecordingRow> {
        let recording = RecordingRow::new(ctx.user_id.clone(), host_id.clone(), payload.to_string());

        let mut row = to_row(&recording)?;
        RecordCrypto::encrypt_for_insert(EntityKind::SessionRecording, &mut row, &ctx.user_id, &ctx.dek)?;
        let sealed: RecordingRow = from_row(row)?;

        {
            let mut tables = self.store.write().await;
            tables.insert_recording(sealed.clone());
        }
        self.saver.trigger_save("recording-stored");
        Ok(sealed)
    }

    /// Read one recording's payload (lazy field, decrypted on demand).
    pub async fn read_recording(&self, ctx: &RequestContext, recording_id: &str) -> Result<String> {
        let stored = {
            let tables = self.store.read().await;
            tables
                .recordings_by_owner(&ctx.user_id)
                .into_iter()
                .find(|r| r.id == recording_id)
                .cloned()
                .ok_or(DrawbridgeError::NotFound)?
        };

        let row = to_row(&stored)?;
        RecordCrypto::decrypt_lazy_field(
            EntityKind::SessionRecording,
            &row,
            "payload",
            &ctx.user_id,
            &ctx.dek,
        )
        .map_err(|e| e.sanitize_data_path())?
        .ok_or(DrawbridgeError::NotFound)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Store a setting. Sensitive system values (provider configs) are
    /// sealed under the saving admin's DEK; a legacy plaintext value is
    /// re-encrypted the next time it is saved with a capable key resident.
    pub async fn put_setting(
        &self,
        ctx: &RequestContext,
        system_scope: bool,
        key: &str,
        value: &str,
        sensitive: bool,
    ) -> Result<()> {
        if system_scope && !ctx.is_admin {
            return Err(DrawbridgeError::Forbidden);
        }

        let user_scope = if system_scope {
            None
        } else {
            Some(ctx.user_id.clone())
        };

        let mut row = SettingsRow::new(user_scope, key.to_string(), value.to_string(), sensitive);
        if sensitive {
            let field_ctx = FieldContext {
                kind: EntityKind::Settings,
                record_id: key,
                field_name: "value",
                user_id: &ctx.user_id,
            };
            row.value = encrypt_field(value, &ctx.dek, &field_ctx)?;
            row.encrypted_by = Some(ctx.user_id.clone());
        }

        {
            let mut tables = self.store.write().await;
            tables.upsert_setting(row);
        }
        self.saver.trigger_save("setting-saved");
        Ok(())
    }

    /// Read a setting. Sealed values decrypt only for the admin whose DEK
    /// sealed them; other callers see the raw stored form.
    pub async fn get_setting(
        &self,
        ctx: &RequestContext,
        system_scope: bool,
        key: &str,
    ) -> Result<Option<String>> {
        let stored = {
            let tables = self.store.read().await;
            let scope = if system_scope { None } else { Some(&ctx.user_id) };
            tables.setting(scope, key).cloned()
        };
        let Some(row) = stored else {
            return Ok(None);
        };

        if is_encrypted(&row.value) {
            if row.encrypted_by.as_ref() == Some(&ctx.user_id) {
                let field_ctx = FieldContext {
                    kind: EntityKind::Settings,
                    record_id: key,
                    field_name: "value",
                    user_id: &ctx.user_id,
                };
                return decrypt_field(&row.value, &ctx.dek, &field_ctx)
                    .map(Some)
                    .map_err(|e| e.sanitize_data_path());
            }
            // Sealed by someone else's key; the caller cannot read it.
            return Err(DrawbridgeError::LockedData);
        }

        if row.sensitive {
            info!(key = %key, "Sensitive setting stored in legacy plaintext; will seal on next save");
        }
        Ok(Some(row.value))
    }
}

fn bookmark_entity_kind(kind: BookmarkKind) -> EntityKind {
    match kind {
        BookmarkKind::Recent => EntityKind::FileBookmarkRecent,
        BookmarkKind::Pinned => EntityKind::FileBookmarkPinned,
        BookmarkKind::Shortcut => EntityKind::FileBookmarkShortcut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::{GrantLevel, PrincipalKind, UserRow};
    use crate::keys::system::DEFAULT_INTERNAL_TOKEN_LEN;
    use crate::keys::Dek;

    struct Fixture {
        service: RecordService,
        store: Arc<HotStore>,
        vault: Arc<DekVault>,
        system: Arc<SystemKeys>,
        shares: Arc<ShareManager>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(HotStore::in_memory());
        let vault = Arc::new(DekVault::with_defaults());
        let system = Arc::new(SystemKeys::from_root([4u8; 32], DEFAULT_INTERNAL_TOKEN_LEN));
        let resolver = Arc::new(PermissionResolver::new(store.clone()));
        let shares = Arc::new(ShareManager::new(store.clone(), vault.clone(), system.clone()));
        let saver = Arc::new(SaveCoordinator::with_defaults(store.clone()));

        Fixture {
            service: RecordService::new(
                store.clone(),
                vault.clone(),
                system.clone(),
                resolver,
                shares.clone(),
                saver,
            ),
            store,
            vault,
            system,
            shares,
        }
    }

    async fn user_ctx(f: &Fixture, name: &str, admin: bool) -> RequestContext {
        let mut user = UserRow::new(name.into(), "$argon2id$stub".into());
        user.is_admin = admin;
        let user_id = user.id.clone();
        {
            let mut tables = f.store.write().await;
            tables.insert_user(user).unwrap();
        }
        let dek = Dek::generate();
        f.vault.install(&user_id, dek.clone());
        RequestContext {
            user_id,
            session_id: "test-session".into(),
            is_admin: admin,
            dek,
        }
    }

    fn host_with_password(ctx: &RequestContext, name: &str, password: &str) -> HostRow {
        let mut host = HostRow::new(ctx.user_id.clone(), name.into(), "10.0.0.1".into());
        host.password = Some(password.into());
        host.private_key = Some("-----BEGIN KEY-----".into());
        host
    }

    #[tokio::test]
    async fn test_persisted_password_is_ciphertext_and_roundtrips() {
        let f = fixture().await;
        let ctx = user_ctx(&f, "alice", false).await;

        let created = f
            .service
            .create_host(&ctx, host_with_password(&ctx, "h1", "secret"))
            .await
            .unwrap();

        // Stored column is wire-form ciphertext.
        {
            let tables = f.store.read().await;
            let stored = tables.host(&created.id).unwrap();
            let column = stored.password.as_deref().unwrap();
            assert!(column.starts_with("v1:"));
            assert!(!column.contains("secret"));

            // The whole serialized table set is free of the plaintext.
            let serialized = serde_json::to_string(&*tables).unwrap();
            assert!(!serialized.contains("\"secret\""));
        }

        // Re-reading through the handler path yields the plaintext.
        let read = f.service.get_host(&ctx, &created.id).await.unwrap();
        assert_eq!(read.password.as_deref(), Some("secret"));
        // Lazy field stays sealed in the bulk read.
        assert!(read.private_key.as_deref().unwrap().starts_with("v1:"));
    }

    #[tokio::test]
    async fn test_lazy_private_key_read() {
        let f = fixture().await;
        let ctx = user_ctx(&f, "alice", false).await;
        let created = f
            .service
            .create_host(&ctx, host_with_password(&ctx, "h1", "secret"))
            .await
            .unwrap();

        let key = f
            .service
            .host_lazy_field(&ctx, &created.id, "private_key")
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some("-----BEGIN KEY-----"));
    }

    #[tokio::test]
    async fn test_grantee_reads_shared_secret_same_as_owner() {
        let f = fixture().await;
        let alice = user_ctx(&f, "alice", false).await;
        let bob = user_ctx(&f, "bob", false).await;

        let host = f
            .service
            .create_host(&alice, host_with_password(&alice, "h1", "secret"))
            .await
            .unwrap();

        f.shares
            .create_grant(
                &alice.user_id,
                &alice.dek,
                &host.id,
                PrincipalKind::User,
                &bob.user_id,
                GrantLevel::Read,
                None,
            )
            .await
            .unwrap();

        let owner_view = f.service.get_host(&alice, &host.id).await.unwrap();
        let grantee_view = f.service.get_host(&bob, &host.id).await.unwrap();
        assert_eq!(owner_view.password, grantee_view.password);
        assert_eq!(grantee_view.password.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_pending_share_shows_host_without_secrets() {
        let f = fixture().await;
        let alice = user_ctx(&f, "alice", false).await;
        let bob = user_ctx(&f, "bob", false).await;

        let host = f
            .service
            .create_host(&alice, host_with_password(&alice, "h1", "secret"))
            .await
            .unwrap();

        // Bob locked at grant time.
        f.vault.evict(&bob.user_id);
        f.shares
            .create_grant(
                &alice.user_id,
                &alice.dek,
                &host.id,
                PrincipalKind::User,
                &bob.user_id,
                GrantLevel::Read,
                None,
            )
            .await
            .unwrap();
        f.vault.install(&bob.user_id, bob.dek.clone());

        let view = f.service.get_host(&bob, &host.id).await.unwrap();
        assert_eq!(view.hostname, "10.0.0.1");
        assert!(view.password.is_none());
    }

    #[tokio::test]
    async fn test_stranger_cannot_read_host() {
        let f = fixture().await;
        let alice = user_ctx(&f, "alice", false).await;
        let mallory = user_ctx(&f, "mallory", false).await;

        let host = f
            .service
            .create_host(&alice, host_with_password(&alice, "h1", "secret"))
            .await
            .unwrap();

        assert!(matches!(
            f.service.get_host(&mallory, &host.id).await,
            Err(DrawbridgeError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn test_write_grantee_cannot_touch_auth_config() {
        let f = fixture().await;
        let alice = user_ctx(&f, "alice", false).await;
        let bob = user_ctx(&f, "bob", false).await;

        let host = f
            .service
            .create_host(&alice, host_with_password(&alice, "h1", "secret"))
            .await
            .unwrap();
        f.shares
            .create_grant(
                &alice.user_id,
                &alice.dek,
                &host.id,
                PrincipalKind::User,
                &bob.user_id,
                GrantLevel::Write,
                None,
            )
            .await
            .unwrap();

        // Plain connection fields are fine.
        let mut ok_patch = Map::new();
        ok_patch.insert("hostname".into(), Value::String("10.0.0.9".into()));
        f.service.update_host(&bob, &host.id, ok_patch).await.unwrap();

        // Auth configuration is not, even with a write grant.
        let mut bad_patch = Map::new();
        bad_patch.insert("auth_type".into(), Value::String("key".into()));
        assert!(matches!(
            f.service.update_host(&bob, &host.id, bad_patch).await,
            Err(DrawbridgeError::Forbidden)
        ));

        // Owner may.
        let mut owner_patch = Map::new();
        owner_patch.insert("auth_type".into(), Value::String("key".into()));
        f.service.update_host(&alice, &host.id, owner_patch).await.unwrap();
    }

    #[tokio::test]
    async fn test_autostart_resolution_with_internal_token() {
        let f = fixture().await;
        let ctx = user_ctx(&f, "alice", false).await;
        let host = f
            .service
            .create_host(&ctx, host_with_password(&ctx, "h1", "secret"))
            .await
            .unwrap();

        f.service.set_autostart(&ctx, &host.id, true).await.unwrap();

        let token = f.system.internal_token().to_vec();
        let creds = f
            .service
            .autostart_credentials(&token, &host.id)
            .await
            .unwrap();
        assert_eq!(
            creds.get("autostart_password").and_then(Value::as_str),
            Some("secret")
        );

        // Wrong token.
        assert!(matches!(
            f.service.autostart_credentials(b"wrong", &host.id).await,
            Err(DrawbridgeError::AuthInvalid)
        ));

        // Owner locked: worker gets the locked-data condition.
        f.vault.evict(&ctx.user_id);
        assert!(matches!(
            f.service.autostart_credentials(&token, &host.id).await,
            Err(DrawbridgeError::LockedData)
        ));
    }

    #[tokio::test]
    async fn test_bookmarks_roundtrip_encrypted() {
        let f = fixture().await;
        let ctx = user_ctx(&f, "alice", false).await;

        f.service
            .add_bookmark(&ctx, BookmarkKind::Pinned, &"h-1".to_string(), "/var/log", "logs")
            .await
            .unwrap();

        {
            let tables = f.store.read().await;
            let stored = tables.bookmarks_by_owner(&ctx.user_id);
            assert!(stored[0].path.starts_with("v1:"));
            assert!(stored[0].display_name.starts_with("v1:"));
        }

        let listed = f.service.list_bookmarks(&ctx, BookmarkKind::Pinned).await.unwrap();
        assert_eq!(listed[0].path, "/var/log");
        assert_eq!(listed[0].display_name, "logs");
        assert!(f
            .service
            .list_bookmarks(&ctx, BookmarkKind::Recent)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_command_history_roundtrip() {
        let f = fixture().await;
        let ctx = user_ctx(&f, "alice", false).await;

        f.service
            .record_command(&ctx, &"h-1".to_string(), "sudo systemctl restart nginx")
            .await
            .unwrap();

        {
            let tables = f.store.read().await;
            assert!(tables.command_history_by_owner(&ctx.user_id)[0]
                .command
                .starts_with("v1:"));
        }

        let history = f.service.list_command_history(&ctx).await.unwrap();
        assert_eq!(history[0].command, "sudo systemctl restart nginx");
    }

    #[tokio::test]
    async fn test_recording_lazy_payload() {
        let f = fixture().await;
        let ctx = user_ctx(&f, "alice", false).await;

        let recording = f
            .service
            .store_recording(&ctx, &"h-1".to_string(), "typescript-of-session")
            .await
            .unwrap();
        assert!(recording.payload.starts_with("v1:"));

        let payload = f.service.read_recording(&ctx, &recording.id).await.unwrap();
        assert_eq!(payload, "typescript-of-session");
    }

    #[tokio::test]
    async fn test_sensitive_setting_sealed_per_admin() {
        let f = fixture().await;
        let admin1 = user_ctx(&f, "root", true).await;
        let admin2 = user_ctx(&f, "root2", true).await;

        f.service
            .put_setting(&admin1, true, "external_identity.client_secret", "s3cr3t", true)
            .await
            .unwrap();

        {
            let tables = f.store.read().await;
            let row = tables.setting(None, "external_identity.client_secret").unwrap();
            assert!(row.value.starts_with("v1:"));
            assert_eq!(row.encrypted_by.as_ref(), Some(&admin1.user_id));
        }

        // The sealing admin reads it back; another admin cannot.
        let value = f
            .service
            .get_setting(&admin1, true, "external_identity.client_secret")
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("s3cr3t"));
        assert!(matches!(
            f.service
                .get_setting(&admin2, true, "external_identity.client_secret")
                .await,
            Err(DrawbridgeError::LockedData)
        ));
    }

    #[tokio::test]
    async fn test_legacy_plaintext_setting_readable() {
        let f = fixture().await;
        let admin = user_ctx(&f, "root", true).await;

        {
            let mut tables = f.store.write().await;
            tables.upsert_setting(SettingsRow::new(
                None,
                "external_identity.issuer".into(),
                "https://idp.example.org".into(),
                true,
            ));
        }

        let value = f
            .service
            .get_setting(&admin, true, "external_identity.issuer")
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("https://idp.example.org"));
    }

    #[tokio::test]
    async fn test_non_admin_cannot_write_system_settings() {
        let f = fixture().await;
        let user = user_ctx(&f, "alice", false).await;
        assert!(matches!(
            f.service.put_setting(&user, true, "k", "v", false).await,
            Err(DrawbridgeError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn test_credential_lifecycle() {
        let f = fixture().await;
        let ctx = user_ctx(&f, "alice", false).await;

        let mut cred = CredentialRow::new(ctx.user_id.clone(), "deploy".into());
        cred.password = Some("cred-secret".into());
        let created = f.service.create_credential(&ctx, cred).await.unwrap();
        assert!(created.password.as_deref().unwrap().starts_with("v1:"));

        let read = f.service.get_credential(&ctx, &created.id).await.unwrap();
        assert_eq!(read.password.as_deref(), Some("cred-secret"));

        // A host referencing it blocks deletion.
        let mut host = HostRow::new(ctx.user_id.clone(), "h1".into(), "10.0.0.1".into());
        host.auth_type = crate::db::schemas::HostAuthType::Credential;
        host.credential_id = Some(created.id.clone());
        let host = f.service.create_host(&ctx, host).await.unwrap();
        assert!(matches!(
            f.service.delete_credential(&ctx, &created.id).await,
            Err(DrawbridgeError::Conflict(_))
        ));

        f.service.delete_host(&ctx, &host.id).await.unwrap();
        f.service.delete_credential(&ctx, &created.id).await.unwrap();
    }
}
