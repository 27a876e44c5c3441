//! Authentication service.
//!
//! Drives the login state machine: rate check, credential check, DEK
//! unwrap, vault install, optional second factor, token issue. Also owns
//! password change, the two reset paths, external-identity login, and
//! second-factor enrollment.
//!
//! Failure shaping: "no such user", "wrong password", and "DEK would not
//! unwrap" all surface as the same generic rejection. The unwrap case is
//! additionally logged with its own tag, since a correct password with a
//! failing unwrap means stored-state corruption, not a bad credential.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{error, info, warn};

use super::external::ExternalSubject;
use super::ratelimit::RateLimiters;
use super::totp;
use crate::access::RequestContext;
use crate::db::schemas::{
    DeviceClass, KekSaltRow, SessionRow, UserRow, WrapKind, WrappedDekRow,
};
use crate::db::{HotStore, SaveCoordinator};
use crate::fieldcrypto::{decrypt_field, encrypt_field, EntityKind, FieldContext};
use crate::keys::{
    burn_verification_work, check_verifier, derive_kek, generate_salt, hash_verifier, unwrap_dek,
    wrap_dek, Dek, DekVault, KdfParams, SystemKeys,
};
use crate::sessions::{SessionService, TokenService};
use crate::shares::ShareManager;
use crate::types::{DrawbridgeError, Result, SessionId, UserId};

/// How long a password-verified login may wait for its second factor.
const PENDING_LOGIN_TTL: Duration = Duration::from_secs(300);

/// How long a reset code stays valid.
const RESET_CODE_TTL: Duration = Duration::from_secs(900);

/// Auth service tuning.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// KDF parameters for newly written salts.
    pub kdf_params: KdfParams,
}

/// What a login attempt produced.
pub enum LoginOutcome {
    /// Fully unlocked; the token opens data paths.
    Unlocked { token: String, session: SessionRow },
    /// Password accepted, second factor outstanding. The token only opens
    /// the TOTP verify operation.
    SecondFactorRequired { token: String, session: SessionRow },
}

struct PendingLogin {
    dek: Dek,
    created: Instant,
}

struct ResetCode {
    code_hash: String,
    created: Instant,
}

/// Login request parameters.
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub client_ip: &'a str,
    pub device_class: DeviceClass,
    pub device_desc: &'a str,
}

/// The authentication state machine and account-lifecycle operations.
pub struct AuthService {
    store: Arc<HotStore>,
    vault: Arc<DekVault>,
    sessions: Arc<SessionService>,
    tokens: Arc<TokenService>,
    system: Arc<SystemKeys>,
    limiters: Arc<RateLimiters>,
    shares: Arc<ShareManager>,
    saver: Arc<SaveCoordinator>,
    config: AuthConfig,
    /// DEKs parked between password acceptance and TOTP verification.
    pending_logins: DashMap<SessionId, PendingLogin>,
    /// Outstanding reset codes by username; in-memory, single-use.
    reset_codes: DashMap<String, ResetCode>,
}

impl AuthService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<HotStore>,
        vault: Arc<DekVault>,
        sessions: Arc<SessionService>,
        tokens: Arc<TokenService>,
        system: Arc<SystemKeys>,
        limiters: Arc<RateLimiters>,
        shares: Arc<ShareManager>,
        saver: Arc<SaveCoordinator>,
        config: AuthConfig,
    ) -> Self {
        Self {
            store,
            vault,
            sessions,
            tokens,
            system,
            limiters,
            shares,
            saver,
            config,
            pending_logins: DashMap::new(),
            reset_codes: DashMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Create a password user: verifier, fresh salt, fresh DEK wrapped
    /// under the password KEK. The first registered user becomes admin.
    pub async fn register(&self, username: &str, password: &str) -> Result<UserRow> {
        if username.is_empty() || password.is_empty() {
            return Err(DrawbridgeError::Conflict("username and password required".into()));
        }

        let verifier = hash_verifier(password, &self.config.kdf_params)?;
        let salt = generate_salt();
        let kek = derive_kek(password.as_bytes(), &salt, &self.config.kdf_params)?;
        let dek = Dek::generate();
        let sealed = wrap_dek(&dek, kek.as_bytes())?;

        let mut user = UserRow::new(username.to_string(), verifier);

        let row = {
            let mut tables = self.store.write().await;
            user.is_admin = tables.admin_count() == 0;
            tables.insert_user(user.clone())?;
            tables.set_kek_salt(KekSaltRow {
                user_id: user.id.clone(),
                salt: BASE64.encode(salt),
                kdf_params: self.config.kdf_params.clone(),
            });
            tables.set_wrapped_dek(WrappedDekRow {
                user_id: user.id.clone(),
                ciphertext: BASE64.encode(&sealed),
                wrap_kind: WrapKind::Kek,
            });
            user
        };

        info!(user_id = %row.id, name = %username, admin = row.is_admin, "Registered user");
        self.saver.trigger_save("user-registered");
        Ok(row)
    }

    // ------------------------------------------------------------------
    // Login
    // ------------------------------------------------------------------

    /// Password login. Rate limit first, then credentials, then unwrap,
    /// in that order, so a locked caller learns nothing and "no user" is
    /// indistinguishable from "wrong password".
    pub async fn login(&self, request: LoginRequest<'_>) -> Result<LoginOutcome> {
        let rate_key = RateLimiters::login_key(request.client_ip, request.username);
        self.limiters.login.check(&rate_key)?;

        let snapshot = {
            let tables = self.store.read().await;
            tables.user_by_name(request.username).map(|u| {
                (
                    u.clone(),
                    tables.kek_salt(&u.id).cloned(),
                    tables.wrapped_dek(&u.id).cloned(),
                )
            })
        };

        let Some((user, salt_row, wrapped_row)) = snapshot else {
            // Burn comparable work for unknown users.
            burn_verification_work(request.password, &self.config.kdf_params);
            self.limiters.login.record_failure(&rate_key);
            return Err(DrawbridgeError::AuthRejected);
        };

        if !user.has_password() {
            burn_verification_work(request.password, &self.config.kdf_params);
            self.limiters.login.record_failure(&rate_key);
            return Err(DrawbridgeError::AuthRejected);
        }

        if !check_verifier(request.password, &user.verifier)? {
            self.limiters.login.record_failure(&rate_key);
            return Err(DrawbridgeError::AuthRejected);
        }

        let dek = match self.unwrap_stored_dek(&user, salt_row.as_ref(), wrapped_row.as_ref(), Some(request.password)) {
            Ok(dek) => dek,
            Err(e) => {
                // Verifier passed but the DEK would not open: stored-state
                // corruption, surfaced as a plain rejection.
                error!(
                    user_id = %user.id,
                    tag = "dek_unwrap_failed",
                    error = %e,
                    "DEK unwrap failed after successful password verification"
                );
                self.limiters.login.record_failure(&rate_key);
                return Err(DrawbridgeError::AuthRejected);
            }
        };

        self.limiters.login.record_success(&rate_key);

        let session = self
            .sessions
            .create(&user.id, request.device_class, request.device_desc)
            .await?;

        if user.totp_enabled {
            // Park the DEK until the second factor lands; the vault only
            // ever holds keys for sessions in the unlocked state.
            self.prune_pending_logins();
            self.pending_logins.insert(
                session.id.clone(),
                PendingLogin {
                    dek,
                    created: Instant::now(),
                },
            );
            let token = self.tokens.issue(&session, true)?;
            self.saver.trigger_save("login-pending-totp");
            return Ok(LoginOutcome::SecondFactorRequired { token, session });
        }

        self.finish_unlock(&user.id, &session.id, dek).await;
        let token = self.tokens.issue(&session, false)?;
        self.saver.trigger_save("login");
        Ok(LoginOutcome::Unlocked { token, session })
    }

    /// Verify the second factor for a pending login. Accepts a TOTP code
    /// or a single-use backup code (the hyphenated form).
    pub async fn verify_totp(&self, pending_token: &str, code: &str) -> Result<LoginOutcome> {
        let claims = self.tokens.verify(pending_token)?;
        if !claims.pending_totp {
            return Err(DrawbridgeError::AuthInvalid);
        }

        self.limiters.totp.check(&claims.sub)?;
        let session = self.sessions.verify(&claims.sid).await?;

        let Some(pending) = self
            .pending_logins
            .get(&session.id)
            .map(|p| p.dek.clone())
        else {
            // Parked DEK expired; the password step must run again.
            return Err(DrawbridgeError::AuthExpired);
        };

        let user = {
            let tables = self.store.read().await;
            tables.user(&claims.sub).cloned().ok_or(DrawbridgeError::AuthInvalid)?
        };

        let accepted = if code.contains('-') {
            self.consume_backup_code(&user, &pending, code).await?
        } else {
            let secret = self.decrypt_totp_secret(&user, &pending)?;
            totp::verify_code(&secret, code)?
        };

        if !accepted {
            self.limiters.totp.record_failure(&claims.sub);
            // Re-apply the lock state so the caller sees the countdown.
            self.limiters.totp.check(&claims.sub)?;
            return Err(DrawbridgeError::AuthRejected);
        }

        self.limiters.totp.record_success(&claims.sub);
        self.pending_logins.remove(&session.id);
        self.finish_unlock(&user.id, &session.id, pending).await;

        let token = self.tokens.issue(&session, false)?;
        self.saver.trigger_save("totp-verified");
        Ok(LoginOutcome::Unlocked { token, session })
    }

    /// Re-unlock a valid session whose DEK was evicted (idle watchdog).
    /// The session stays; only the key residency is restored.
    pub async fn unlock(&self, token: &str, password: &str, client_ip: &str) -> Result<()> {
        let claims = self.tokens.verify(token)?;
        if claims.pending_totp {
            return Err(DrawbridgeError::AuthInvalid);
        }
        let session = self.sessions.verify(&claims.sid).await?;
        if self.sessions.is_unlocked(&session.id) {
            // Already unlocked; a second install would leak a vault hold.
            return Ok(());
        }

        let (user, salt_row, wrapped_row) = {
            let tables = self.store.read().await;
            let user = tables.user(&session.user_id).cloned().ok_or(DrawbridgeError::AuthInvalid)?;
            let salt = tables.kek_salt(&user.id).cloned();
            let wrapped = tables.wrapped_dek(&user.id).cloned();
            (user, salt, wrapped)
        };

        let rate_key = RateLimiters::login_key(client_ip, &user.name);
        self.limiters.login.check(&rate_key)?;

        if !user.has_password() || !check_verifier(password, &user.verifier)? {
            self.limiters.login.record_failure(&rate_key);
            return Err(DrawbridgeError::AuthRejected);
        }

        let dek = self
            .unwrap_stored_dek(&user, salt_row.as_ref(), wrapped_row.as_ref(), Some(password))
            .map_err(|e| {
                error!(user_id = %user.id, tag = "dek_unwrap_failed", error = %e, "Unlock unwrap failed");
                DrawbridgeError::AuthRejected
            })?;

        self.limiters.login.record_success(&rate_key);
        self.finish_unlock(&user.id, &session.id, dek).await;
        Ok(())
    }

    /// External-identity login. The provider already proved the subject;
    /// there is no password step and no second factor here. First login
    /// for an unknown subject registers the user with a fresh DEK wrapped
    /// under the subject-bound system key.
    pub async fn login_external(
        &self,
        subject: &ExternalSubject,
        device_class: DeviceClass,
        device_desc: &str,
    ) -> Result<LoginOutcome> {
        let existing = {
            let tables = self.store.read().await;
            tables
                .user_by_external_subject(&subject.subject)
                .map(|u| (u.clone(), tables.wrapped_dek(&u.id).cloned()))
        };

        let (user, wrapped_row) = match existing {
            Some(pair) => pair,
            None => {
                let user = self.register_external(subject).await?;
                let wrapped = {
                    let tables = self.store.read().await;
                    tables.wrapped_dek(&user.id).cloned()
                };
                (user, wrapped)
            }
        };

        let dek = self
            .unwrap_stored_dek(&user, None, wrapped_row.as_ref(), None)
            .map_err(|e| {
                error!(user_id = %user.id, tag = "dek_unwrap_failed", error = %e, "External unwrap failed");
                DrawbridgeError::AuthRejected
            })?;

        let session = self.sessions.create(&user.id, device_class, device_desc).await?;
        self.finish_unlock(&user.id, &session.id, dek).await;

        let token = self.tokens.issue(&session, false)?;
        self.saver.trigger_save("external-login");
        Ok(LoginOutcome::Unlocked { token, session })
    }

    /// Lock the session and drop its vault hold, then revoke the session.
    pub async fn logout(&self, session_id: &SessionId) -> Result<()> {
        let user_id = {
            let tables = self.store.read().await;
            tables.session(session_id).map(|s| s.user_id.clone())
        };

        if self.sessions.is_unlocked(session_id) {
            self.sessions.mark_locked(session_id);
            if let Some(user_id) = &user_id {
                self.vault.release(user_id);
            }
        }
        self.pending_logins.remove(session_id);
        self.sessions.revoke(session_id).await?;
        self.saver.trigger_save("logout");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Password change and resets
    // ------------------------------------------------------------------

    /// Change password, preserving the DEK: unwrap under the old KEK,
    /// re-wrap the same DEK under a new KEK with a fresh salt, persist
    /// both atomically, then revoke every session of the user.
    pub async fn change_password(&self, user_id: &UserId, old: &str, new: &str) -> Result<()> {
        let lock = self.vault.user_lock(user_id);
        let _guard = lock.lock().await;

        let (user, salt_row, wrapped_row) = {
            let tables = self.store.read().await;
            let user = tables.user(user_id).cloned().ok_or(DrawbridgeError::NotFound)?;
            let salt = tables.kek_salt(user_id).cloned();
            let wrapped = tables.wrapped_dek(user_id).cloned();
            (user, salt, wrapped)
        };

        if !user.has_password() || !check_verifier(old, &user.verifier)? {
            return Err(DrawbridgeError::AuthRejected);
        }

        let dek = self
            .unwrap_stored_dek(&user, salt_row.as_ref(), wrapped_row.as_ref(), Some(old))
            .map_err(|e| {
                error!(user_id = %user_id, tag = "dek_unwrap_failed", error = %e, "Change-password unwrap failed");
                DrawbridgeError::AuthRejected
            })?;

        self.rewrap_and_revoke(&user, &dek, new, "password-changed").await
    }

    /// Non-destructive reset: an authenticated, unlocked session of the
    /// same user proves DEK access, so no old password is needed.
    pub async fn reset_password_with_session(
        &self,
        ctx: &RequestContext,
        new: &str,
    ) -> Result<()> {
        let lock = self.vault.user_lock(&ctx.user_id);
        let _guard = lock.lock().await;

        let user = {
            let tables = self.store.read().await;
            tables.user(&ctx.user_id).cloned().ok_or(DrawbridgeError::NotFound)?
        };

        self.rewrap_and_revoke(&user, &ctx.dek, new, "password-reset-preserving").await
    }

    /// Destructive reset: no surviving session can prove DEK access, so
    /// the DEK is replaced and every encrypted row of the user goes with
    /// it. 2FA is cleared; the event is logged at warning.
    pub async fn destructive_reset(&self, user_id: &UserId, new_password: &str) -> Result<()> {
        let lock = self.vault.user_lock(user_id);
        let _guard = lock.lock().await;

        let exists = {
            let tables = self.store.read().await;
            tables.user(user_id).is_some()
        };
        if !exists {
            return Err(DrawbridgeError::NotFound);
        }

        self.vault.evict(user_id);
        self.sessions.lock_all(user_id);

        let verifier = hash_verifier(new_password, &self.config.kdf_params)?;
        let salt = generate_salt();
        let kek = derive_kek(new_password.as_bytes(), &salt, &self.config.kdf_params)?;
        let new_dek = Dek::generate();
        let sealed = wrap_dek(&new_dek, kek.as_bytes())?;

        let purged = {
            let mut tables = self.store.write().await;
            let purged = tables.purge_encrypted_rows(user_id);

            let user = tables.user_mut(user_id).ok_or(DrawbridgeError::NotFound)?;
            user.verifier = verifier;
            user.totp_enabled = false;
            user.totp_secret = None;
            user.totp_backup_codes = None;
            user.metadata.touch();

            tables.set_kek_salt(KekSaltRow {
                user_id: user_id.clone(),
                salt: BASE64.encode(salt),
                kdf_params: self.config.kdf_params.clone(),
            });
            tables.set_wrapped_dek(WrappedDekRow {
                user_id: user_id.clone(),
                ciphertext: BASE64.encode(&sealed),
                wrap_kind: WrapKind::Kek,
            });
            purged
        };

        self.sessions.revoke_all(user_id, None).await;

        warn!(
            operation = "password_reset_data_deleted",
            user_id = %user_id,
            rows_deleted = purged,
            reason = "destructive reset without DEK access",
            "Destructive password reset"
        );
        self.saver.trigger_save("destructive-reset");
        Ok(())
    }

    /// Issue a reset code for out-of-band delivery. The code is held
    /// hashed, in memory, single-use, and expires after 15 minutes.
    pub async fn begin_reset(&self, username: &str) -> Result<String> {
        let exists = {
            let tables = self.store.read().await;
            tables.user_by_name(username).is_some()
        };
        if !exists {
            // Do not reveal which names exist; issue nothing silently.
            return Err(DrawbridgeError::NotFound);
        }

        let mut bytes = [0u8; 4];
        OsRng.fill_bytes(&mut bytes);
        let code = format!("{:08}", u32::from_be_bytes(bytes) % 100_000_000);

        self.reset_codes.insert(
            username.to_string(),
            ResetCode {
                code_hash: hash_reset_code(&code),
                created: Instant::now(),
            },
        );
        Ok(code)
    }

    /// Verify a reset code. Success consumes the code and permits a
    /// destructive reset for the account.
    pub fn verify_reset_code(&self, username: &str, code: &str) -> Result<()> {
        self.limiters.reset.check(username)?;

        let matched = self
            .reset_codes
            .get(username)
            .map(|rc| {
                rc.created.elapsed() < RESET_CODE_TTL && rc.code_hash == hash_reset_code(code)
            })
            .unwrap_or(false);

        if !matched {
            self.limiters.reset.record_failure(username);
            return Err(DrawbridgeError::AuthRejected);
        }

        self.limiters.reset.record_success(username);
        self.reset_codes.remove(username);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Second-factor enrollment
    // ------------------------------------------------------------------

    /// Begin TOTP enrollment: generate a secret and backup codes, store
    /// both encrypted under the caller's DEK, disabled until confirmed.
    /// Returns (secret, provisioning URI, plain backup codes).
    pub async fn totp_enroll(&self, ctx: &RequestContext) -> Result<(String, String, Vec<String>)> {
        let secret = totp::generate_secret();
        let (plain_codes, stored_codes) = totp::generate_backup_codes();

        let (uri, sealed_secret, sealed_codes) = {
            let user_name = {
                let tables = self.store.read().await;
                tables.user(&ctx.user_id).map(|u| u.name.clone()).ok_or(DrawbridgeError::NotFound)?
            };
            let uri = totp::provisioning_uri(&secret, &user_name)?;
            let secret_ctx = FieldContext {
                kind: EntityKind::User,
                record_id: &ctx.user_id,
                field_name: "totp_secret",
                user_id: &ctx.user_id,
            };
            let codes_ctx = FieldContext {
                kind: EntityKind::User,
                record_id: &ctx.user_id,
                field_name: "totp_backup_codes",
                user_id: &ctx.user_id,
            };
            (
                uri,
                encrypt_field(&secret, &ctx.dek, &secret_ctx)?,
                encrypt_field(&stored_codes, &ctx.dek, &codes_ctx)?,
            )
        };

        {
            let mut tables = self.store.write().await;
            let user = tables.user_mut(&ctx.user_id).ok_or(DrawbridgeError::NotFound)?;
            user.totp_secret = Some(sealed_secret);
            user.totp_backup_codes = Some(sealed_codes);
            user.totp_enabled = false;
            user.metadata.touch();
        }

        self.saver.trigger_save("totp-enrolled");
        Ok((secret, uri, plain_codes))
    }

    /// Confirm enrollment with a first valid code; only then does login
    /// start demanding the second factor.
    pub async fn totp_confirm(&self, ctx: &RequestContext, code: &str) -> Result<()> {
        let user = {
            let tables = self.store.read().await;
            tables.user(&ctx.user_id).cloned().ok_or(DrawbridgeError::NotFound)?
        };

        let secret = self.decrypt_totp_secret(&user, &ctx.dek)?;
        if !totp::verify_code(&secret, code)? {
            return Err(DrawbridgeError::AuthRejected);
        }

        {
            let mut tables = self.store.write().await;
            let user = tables.user_mut(&ctx.user_id).ok_or(DrawbridgeError::NotFound)?;
            user.totp_enabled = true;
            user.metadata.touch();
        }
        self.saver.trigger_save("totp-confirmed");
        Ok(())
    }

    /// Disable the second factor and drop its material.
    pub async fn totp_disable(&self, ctx: &RequestContext) -> Result<()> {
        let mut tables = self.store.write().await;
        let user = tables.user_mut(&ctx.user_id).ok_or(DrawbridgeError::NotFound)?;
        user.totp_enabled = false;
        user.totp_secret = None;
        user.totp_backup_codes = None;
        user.metadata.touch();
        drop(tables);
        self.saver.trigger_save("totp-disabled");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dual auth
    // ------------------------------------------------------------------

    /// Link an external identity to a password account. The DEK moves to
    /// the subject-bound system wrap so both paths open the same record.
    pub async fn link_external(&self, ctx: &RequestContext, subject: &str) -> Result<()> {
        let wrap_key = self.system.external_wrap_key(subject);
        let sealed = wrap_dek(&ctx.dek, &wrap_key)?;

        let mut tables = self.store.write().await;
        if tables.user_by_external_subject(subject).is_some() {
            return Err(DrawbridgeError::Conflict("subject already linked".into()));
        }
        let user = tables.user_mut(&ctx.user_id).ok_or(DrawbridgeError::NotFound)?;
        user.external_subject = Some(subject.to_string());
        user.metadata.touch();
        tables.set_wrapped_dek(WrappedDekRow {
            user_id: ctx.user_id.clone(),
            ciphertext: BASE64.encode(&sealed),
            wrap_kind: WrapKind::ExtIdentity,
        });
        drop(tables);

        info!(user_id = %ctx.user_id, "Linked external identity");
        self.saver.trigger_save("external-linked");
        Ok(())
    }

    /// Give an external-identity account a password verifier (dual auth).
    /// The wrap stays subject-bound; only the verifier is added.
    pub async fn set_password(&self, ctx: &RequestContext, new_password: &str) -> Result<()> {
        let verifier = hash_verifier(new_password, &self.config.kdf_params)?;
        let mut tables = self.store.write().await;
        let user = tables.user_mut(&ctx.user_id).ok_or(DrawbridgeError::NotFound)?;
        user.verifier = verifier;
        user.metadata.touch();
        drop(tables);
        self.saver.trigger_save("password-set");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Open the stored DEK for a user. Password users go through the KEK;
    /// users with an external subject are wrapped under the subject-bound
    /// system key regardless of which path is logging in; that is what
    /// makes dual auth converge on one DEK record.
    fn unwrap_stored_dek(
        &self,
        user: &UserRow,
        salt_row: Option<&KekSaltRow>,
        wrapped_row: Option<&WrappedDekRow>,
        password: Option<&str>,
    ) -> Result<Dek> {
        let wrapped = wrapped_row.ok_or_else(|| {
            DrawbridgeError::CryptoFailed("user has no wrapped DEK".into())
        })?;
        let sealed = BASE64
            .decode(&wrapped.ciphertext)
            .map_err(|e| DrawbridgeError::CryptoFailed(format!("corrupt wrapped DEK: {e}")))?;

        match wrapped.wrap_kind {
            WrapKind::Kek => {
                let password = password.ok_or_else(|| {
                    DrawbridgeError::CryptoFailed("password required for KEK unwrap".into())
                })?;
                let salt_row = salt_row.ok_or_else(|| {
                    DrawbridgeError::CryptoFailed("user has no KEK salt".into())
                })?;
                let salt = BASE64
                    .decode(&salt_row.salt)
                    .map_err(|e| DrawbridgeError::CryptoFailed(format!("corrupt salt: {e}")))?;
                let kek = derive_kek(password.as_bytes(), &salt, &salt_row.kdf_params)?;
                unwrap_dek(&sealed, kek.as_bytes())
            }
            WrapKind::ExtIdentity => {
                let subject = user.external_subject.as_deref().ok_or_else(|| {
                    DrawbridgeError::CryptoFailed("ext-identity wrap without subject".into())
                })?;
                let wrap_key = self.system.external_wrap_key(subject);
                unwrap_dek(&sealed, &wrap_key)
            }
        }
    }

    /// The UNLOCKED transition: install the DEK, set the unlocked bit,
    /// then flush any pending shared-credential re-wraps for this user.
    async fn finish_unlock(&self, user_id: &UserId, session_id: &SessionId, dek: Dek) {
        self.vault.install(user_id, dek.clone());
        self.sessions.mark_unlocked(session_id, user_id);
        let flushed = self.shares.flush_pending(user_id, &dek).await;
        if flushed > 0 {
            self.saver.trigger_save("pending-shares-flushed");
        }
    }

    /// Shared tail of change-password and the non-destructive reset:
    /// new verifier + fresh salt + same DEK under the new KEK, persisted
    /// in one write-lock scope, then fleet-wide session revocation.
    async fn rewrap_and_revoke(
        &self,
        user: &UserRow,
        dek: &Dek,
        new_password: &str,
        save_reason: &'static str,
    ) -> Result<()> {
        let verifier = hash_verifier(new_password, &self.config.kdf_params)?;
        let keeps_kek_wrap = user.external_subject.is_none();

        let (salt_b64, sealed_b64) = if keeps_kek_wrap {
            let salt = generate_salt();
            let kek = derive_kek(new_password.as_bytes(), &salt, &self.config.kdf_params)?;
            let sealed = wrap_dek(dek, kek.as_bytes())?;
            (Some(BASE64.encode(salt)), Some(BASE64.encode(&sealed)))
        } else {
            // Dual-auth users stay on the subject-bound wrap; only the
            // verifier changes.
            (None, None)
        };

        {
            let mut tables = self.store.write().await;
            let row = tables.user_mut(&user.id).ok_or(DrawbridgeError::NotFound)?;
            row.verifier = verifier;
            row.metadata.touch();

            if let (Some(salt), Some(sealed)) = (salt_b64, sealed_b64) {
                tables.set_kek_salt(KekSaltRow {
                    user_id: user.id.clone(),
                    salt,
                    kdf_params: self.config.kdf_params.clone(),
                });
                tables.set_wrapped_dek(WrappedDekRow {
                    user_id: user.id.clone(),
                    ciphertext: sealed,
                    wrap_kind: WrapKind::Kek,
                });
            }
        }

        self.sessions.revoke_all(&user.id, None).await;
        self.vault.evict(&user.id);
        self.sessions.lock_all(&user.id);

        info!(user_id = %user.id, "Password changed, sessions revoked");
        self.saver.trigger_save(save_reason);
        Ok(())
    }

    async fn register_external(&self, subject: &ExternalSubject) -> Result<UserRow> {
        let wrap_key = self.system.external_wrap_key(&subject.subject);
        let dek = Dek::generate();
        let sealed = wrap_dek(&dek, &wrap_key)?;

        let base_name = subject
            .display_name
            .clone()
            .unwrap_or_else(|| format!("user-{}", &subject.subject[..subject.subject.len().min(8)]));

        let mut tables = self.store.write().await;

        // Display names are unique; suffix on collision.
        let mut name = base_name.clone();
        let mut attempt = 1;
        while tables.user_by_name(&name).is_some() {
            attempt += 1;
            name = format!("{base_name}-{attempt}");
        }

        let mut user = UserRow::new_external(name, subject.subject.clone());
        user.is_admin = tables.admin_count() == 0;
        tables.insert_user(user.clone())?;
        tables.set_wrapped_dek(WrappedDekRow {
            user_id: user.id.clone(),
            ciphertext: BASE64.encode(&sealed),
            wrap_kind: WrapKind::ExtIdentity,
        });
        drop(tables);

        info!(user_id = %user.id, "Registered external-identity user");
        self.saver.trigger_save("external-registered");
        Ok(user)
    }

    fn decrypt_totp_secret(&self, user: &UserRow, dek: &Dek) -> Result<String> {
        let stored = user
            .totp_secret
            .as_deref()
            .ok_or_else(|| DrawbridgeError::Internal("no TOTP secret enrolled".into()))?;
        let ctx = FieldContext {
            kind: EntityKind::User,
            record_id: &user.id,
            field_name: "totp_secret",
            user_id: &user.id,
        };
        decrypt_field(stored, dek, &ctx)
    }

    async fn consume_backup_code(&self, user: &UserRow, dek: &Dek, code: &str) -> Result<bool> {
        let Some(stored) = user.totp_backup_codes.as_deref() else {
            return Ok(false);
        };
        let ctx = FieldContext {
            kind: EntityKind::User,
            record_id: &user.id,
            field_name: "totp_backup_codes",
            user_id: &user.id,
        };
        let plain_list = decrypt_field(stored, dek, &ctx)?;

        let Some(updated) = totp::consume_backup_code(&plain_list, code)? else {
            return Ok(false);
        };

        let sealed = encrypt_field(&updated, dek, &ctx)?;
        let mut tables = self.store.write().await;
        if let Some(row) = tables.user_mut(&user.id) {
            row.totp_backup_codes = Some(sealed);
            row.metadata.touch();
        }
        Ok(true)
    }

    fn prune_pending_logins(&self) {
        self.pending_logins
            .retain(|_, p| p.created.elapsed() < PENDING_LOGIN_TTL);
    }
}

fn hash_reset_code(code: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authn::ratelimit::RateLimitPolicy;
    use crate::db::schemas::HostRow;
    use crate::keys::system::DEFAULT_INTERNAL_TOKEN_LEN;
    use crate::sessions::SessionConfig;

    struct Fixture {
        auth: AuthService,
        store: Arc<HotStore>,
        vault: Arc<DekVault>,
        sessions: Arc<SessionService>,
        tokens: Arc<TokenService>,
        shares: Arc<ShareManager>,
    }

    fn test_kdf() -> KdfParams {
        KdfParams {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn fixture() -> Fixture {
        let store = Arc::new(HotStore::in_memory());
        let vault = Arc::new(DekVault::with_defaults());
        let sessions = Arc::new(SessionService::new(store.clone(), SessionConfig::default()));
        let tokens = Arc::new(TokenService::new(&[5u8; 32]));
        let system = Arc::new(SystemKeys::from_root([6u8; 32], DEFAULT_INTERNAL_TOKEN_LEN));
        let limiters = Arc::new(RateLimiters::new(RateLimitPolicy {
            window: Duration::from_secs(60),
            max_failures: 5,
            lock: Duration::from_secs(60),
        }));
        let shares = Arc::new(ShareManager::new(store.clone(), vault.clone(), system.clone()));
        let saver = Arc::new(SaveCoordinator::with_defaults(store.clone()));

        let auth = AuthService::new(
            store.clone(),
            vault.clone(),
            sessions.clone(),
            tokens.clone(),
            system,
            limiters,
            shares.clone(),
            saver,
            AuthConfig {
                kdf_params: test_kdf(),
            },
        );

        Fixture {
            auth,
            store,
            vault,
            sessions,
            tokens,
            shares,
        }
    }

    fn login_request<'a>(username: &'a str, password: &'a str, ip: &'a str) -> LoginRequest<'a> {
        LoginRequest {
            username,
            password,
            client_ip: ip,
            device_class: DeviceClass::Browser,
            device_desc: "test",
        }
    }

    async fn unlocked_login(f: &Fixture, username: &str, password: &str) -> (String, SessionRow) {
        match f
            .auth
            .login(login_request(username, password, "198.51.100.7"))
            .await
            .unwrap()
        {
            LoginOutcome::Unlocked { token, session } => (token, session),
            LoginOutcome::SecondFactorRequired { .. } => panic!("unexpected second factor"),
        }
    }

    fn ctx_for(f: &Fixture, user_id: &UserId, session_id: &SessionId) -> RequestContext {
        RequestContext {
            user_id: user_id.clone(),
            session_id: session_id.clone(),
            is_admin: false,
            dek: f.vault.get(user_id).expect("dek resident"),
        }
    }

    #[tokio::test]
    async fn test_register_and_login() {
        let f = fixture();
        let user = f.auth.register("alice", "p@ss").await.unwrap();
        assert!(user.is_admin); // first user

        let (_token, session) = unlocked_login(&f, "alice", "p@ss").await;
        assert!(f.vault.contains(&user.id));
        assert!(f.sessions.is_unlocked(&session.id));
    }

    #[tokio::test]
    async fn test_second_user_is_not_admin() {
        let f = fixture();
        f.auth.register("alice", "p@ss").await.unwrap();
        let bob = f.auth.register("bob", "hunter2").await.unwrap();
        assert!(!bob.is_admin);
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let f = fixture();
        f.auth.register("alice", "p@ss").await.unwrap();
        assert!(matches!(
            f.auth.register("alice", "other").await,
            Err(DrawbridgeError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_password_and_unknown_user_look_identical() {
        let f = fixture();
        f.auth.register("alice", "p@ss").await.unwrap();

        let wrong = f
            .auth
            .login(login_request("alice", "nope", "198.51.100.7"))
            .await;
        let missing = f
            .auth
            .login(login_request("nobody", "nope", "198.51.100.7"))
            .await;

        assert!(matches!(wrong, Err(DrawbridgeError::AuthRejected)));
        assert!(matches!(missing, Err(DrawbridgeError::AuthRejected)));
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_sixth_attempt_even_with_correct_password() {
        let f = fixture();
        f.auth.register("alice", "p@ss").await.unwrap();

        for _ in 0..5 {
            let _ = f
                .auth
                .login(login_request("alice", "wrong", "203.0.113.1"))
                .await;
        }

        // Correct password, but the key is locked.
        let result = f
            .auth
            .login(login_request("alice", "p@ss", "203.0.113.1"))
            .await;
        match result {
            Err(DrawbridgeError::RateLimited { remaining_seconds }) => {
                assert!(remaining_seconds >= 1);
            }
            other => panic!("expected RateLimited, got {:?}", other.map(|_| ())),
        }

        // A different address is unaffected.
        assert!(f
            .auth
            .login(login_request("alice", "p@ss", "203.0.113.9"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_logout_releases_vault() {
        let f = fixture();
        let user = f.auth.register("alice", "p@ss").await.unwrap();
        let (_token, session) = unlocked_login(&f, "alice", "p@ss").await;

        f.auth.logout(&session.id).await.unwrap();

        assert!(!f.vault.contains(&user.id));
        assert!(!f.sessions.is_unlocked(&session.id));
        assert!(f.sessions.verify(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_unlock_after_idle_eviction() {
        let f = fixture();
        let user = f.auth.register("alice", "p@ss").await.unwrap();
        let (token, session) = unlocked_login(&f, "alice", "p@ss").await;

        // Idle watchdog fires.
        f.vault.evict(&user.id);
        f.sessions.lock_all(&user.id);
        assert!(!f.sessions.is_unlocked(&session.id));

        // Same session, password re-unlock.
        f.auth.unlock(&token, "p@ss", "198.51.100.7").await.unwrap();
        assert!(f.vault.contains(&user.id));
        assert!(f.sessions.is_unlocked(&session.id));

        // Wrong password does not unlock.
        f.vault.evict(&user.id);
        f.sessions.lock_all(&user.id);
        assert!(matches!(
            f.auth.unlock(&token, "wrong", "198.51.100.7").await,
            Err(DrawbridgeError::AuthRejected)
        ));
    }

    #[tokio::test]
    async fn test_change_password_preserves_dek() {
        let f = fixture();
        let user = f.auth.register("alice", "p@ss").await.unwrap();
        let (_, session) = unlocked_login(&f, "alice", "p@ss").await;
        let old_dek = f.vault.get(&user.id).unwrap();

        // Encrypt a field under the current DEK.
        let field_ctx = FieldContext {
            kind: EntityKind::Host,
            record_id: "h-1",
            field_name: "password",
            user_id: &user.id,
        };
        let sealed = encrypt_field("secret", &old_dek, &field_ctx).unwrap();

        f.auth.change_password(&user.id, "p@ss", "n3w").await.unwrap();

        // Every session is revoked and the vault is empty.
        assert!(f.sessions.verify(&session.id).await.is_err());
        assert!(!f.vault.contains(&user.id));

        // Old password fails.
        assert!(matches!(
            f.auth
                .login(login_request("alice", "p@ss", "198.51.100.7"))
                .await,
            Err(DrawbridgeError::AuthRejected)
        ));

        // New password unlocks the same DEK: the old ciphertext opens.
        let (_, _) = unlocked_login(&f, "alice", "n3w").await;
        let new_dek = f.vault.get(&user.id).unwrap();
        assert_eq!(
            decrypt_field(&sealed, &new_dek, &field_ctx).unwrap(),
            "secret"
        );
    }

    #[tokio::test]
    async fn test_change_password_rejects_wrong_old() {
        let f = fixture();
        let user = f.auth.register("alice", "p@ss").await.unwrap();
        assert!(matches!(
            f.auth.change_password(&user.id, "wrong", "n3w").await,
            Err(DrawbridgeError::AuthRejected)
        ));
    }

    #[tokio::test]
    async fn test_session_reset_preserves_dek_without_old_password() {
        let f = fixture();
        let user = f.auth.register("alice", "p@ss").await.unwrap();
        let (_, session) = unlocked_login(&f, "alice", "p@ss").await;
        let ctx = ctx_for(&f, &user.id, &session.id);
        let old_dek = ctx.dek.clone();

        f.auth
            .reset_password_with_session(&ctx, "recovered")
            .await
            .unwrap();

        let (_, _) = unlocked_login(&f, "alice", "recovered").await;
        assert_eq!(f.vault.get(&user.id).unwrap().as_bytes(), old_dek.as_bytes());
    }

    #[tokio::test]
    async fn test_destructive_reset_replaces_dek_and_purges_rows() {
        let f = fixture();
        let user = f.auth.register("alice", "p@ss").await.unwrap();
        let (_, _) = unlocked_login(&f, "alice", "p@ss").await;
        let old_dek = f.vault.get(&user.id).unwrap();

        // A host with an encrypted secret.
        {
            let mut tables = f.store.write().await;
            let mut host = HostRow::new(user.id.clone(), "h1".into(), "10.0.0.1".into());
            let ctx = FieldContext {
                kind: EntityKind::Host,
                record_id: &host.id,
                field_name: "password",
                user_id: &user.id,
            };
            host.password = Some(encrypt_field("secret", &old_dek, &ctx).unwrap());
            tables.insert_host(host).unwrap();
        }

        f.auth.destructive_reset(&user.id, "recover").await.unwrap();

        // The user exists, logs in with the new password, but the host is
        // gone and the DEK is different.
        let (_, _) = unlocked_login(&f, "alice", "recover").await;
        let new_dek = f.vault.get(&user.id).unwrap();
        assert_ne!(new_dek.as_bytes(), old_dek.as_bytes());

        let tables = f.store.read().await;
        assert!(tables.hosts_by_owner(&user.id).is_empty());
        let row = tables.user(&user.id).unwrap();
        assert!(!row.totp_enabled);
        assert!(row.totp_secret.is_none());
    }

    #[tokio::test]
    async fn test_totp_flow() {
        let f = fixture();
        let user = f.auth.register("alice", "p@ss").await.unwrap();
        let (_, session) = unlocked_login(&f, "alice", "p@ss").await;
        let ctx = ctx_for(&f, &user.id, &session.id);

        let (secret, uri, backup_codes) = f.auth.totp_enroll(&ctx).await.unwrap();
        assert!(uri.starts_with("otpauth://"));
        assert_eq!(backup_codes.len(), totp::BACKUP_CODE_COUNT);

        // Not enabled until confirmed: plain login still unlocks.
        f.auth.logout(&session.id).await.unwrap();
        let (_, session2) = unlocked_login(&f, "alice", "p@ss").await;
        let ctx2 = ctx_for(&f, &user.id, &session2.id);

        let code = totp_rs::TOTP::new(
            totp_rs::Algorithm::SHA1,
            6,
            1,
            30,
            totp_rs::Secret::Encoded(secret.clone()).to_bytes().unwrap(),
            Some("Drawbridge".into()),
            "alice".into(),
        )
        .unwrap()
        .generate_current()
        .unwrap();
        f.auth.totp_confirm(&ctx2, &code).await.unwrap();
        f.auth.logout(&session2.id).await.unwrap();

        // Now login demands the second factor.
        let outcome = f
            .auth
            .login(login_request("alice", "p@ss", "198.51.100.7"))
            .await
            .unwrap();
        let pending_token = match outcome {
            LoginOutcome::SecondFactorRequired { token, session } => {
                // The vault stays empty until the code lands.
                assert!(!f.vault.contains(&user.id));
                assert!(!f.sessions.is_unlocked(&session.id));
                token
            }
            LoginOutcome::Unlocked { .. } => panic!("expected second factor"),
        };

        // Wrong code rejected, then a backup code unlocks.
        assert!(matches!(
            f.auth.verify_totp(&pending_token, "000000").await,
            Err(DrawbridgeError::AuthRejected)
        ));
        let outcome = f
            .auth
            .verify_totp(&pending_token, &backup_codes[0])
            .await
            .unwrap();
        match outcome {
            LoginOutcome::Unlocked { session, .. } => {
                assert!(f.vault.contains(&user.id));
                assert!(f.sessions.is_unlocked(&session.id));
            }
            _ => panic!("expected unlocked"),
        }

        // The backup code was consumed.
        f.auth.logout(&f.sessions.list_by_user(&user.id).await.last().unwrap().id).await.ok();
        let outcome = f
            .auth
            .login(login_request("alice", "p@ss", "198.51.100.7"))
            .await
            .unwrap();
        if let LoginOutcome::SecondFactorRequired { token, .. } = outcome {
            assert!(matches!(
                f.auth.verify_totp(&token, &backup_codes[0]).await,
                Err(DrawbridgeError::AuthRejected)
            ));
        } else {
            panic!("expected second factor");
        }
    }

    #[tokio::test]
    async fn test_external_login_registers_and_unlocks() {
        let f = fixture();
        let subject = ExternalSubject {
            subject: "idp-subject-42".into(),
            display_name: Some("Dana".into()),
        };

        let outcome = f
            .auth
            .login_external(&subject, DeviceClass::Browser, "sso")
            .await
            .unwrap();
        let first_user_id = match outcome {
            LoginOutcome::Unlocked { session, .. } => {
                assert!(f.vault.contains(&session.user_id));
                session.user_id
            }
            _ => panic!("expected unlocked"),
        };

        // Second login resolves the same user and the same DEK.
        let dek_before = f.vault.get(&first_user_id).unwrap();
        let outcome = f
            .auth
            .login_external(&subject, DeviceClass::Browser, "sso")
            .await
            .unwrap();
        match outcome {
            LoginOutcome::Unlocked { session, .. } => {
                assert_eq!(session.user_id, first_user_id);
                assert_eq!(
                    f.vault.get(&first_user_id).unwrap().as_bytes(),
                    dek_before.as_bytes()
                );
            }
            _ => panic!("expected unlocked"),
        }
    }

    #[tokio::test]
    async fn test_dual_auth_converges_on_one_dek() {
        let f = fixture();
        let user = f.auth.register("carol", "p@ss").await.unwrap();
        let (_, session) = unlocked_login(&f, "carol", "p@ss").await;
        let ctx = ctx_for(&f, &user.id, &session.id);
        let dek = ctx.dek.clone();

        f.auth.link_external(&ctx, "idp-carol").await.unwrap();

        // External path opens the same DEK.
        f.auth.logout(&session.id).await.unwrap();
        let outcome = f
            .auth
            .login_external(
                &ExternalSubject {
                    subject: "idp-carol".into(),
                    display_name: None,
                },
                DeviceClass::Desktop,
                "sso",
            )
            .await
            .unwrap();
        match outcome {
            LoginOutcome::Unlocked { session, .. } => {
                assert_eq!(session.user_id, user.id);
            }
            _ => panic!("expected unlocked"),
        }
        assert_eq!(f.vault.get(&user.id).unwrap().as_bytes(), dek.as_bytes());

        // Password path still works too.
        f.vault.evict(&user.id);
        f.sessions.lock_all(&user.id);
        let (_, _) = unlocked_login(&f, "carol", "p@ss").await;
        assert_eq!(f.vault.get(&user.id).unwrap().as_bytes(), dek.as_bytes());
    }

    #[tokio::test]
    async fn test_login_flushes_pending_shares() {
        let f = fixture();
        let alice = f.auth.register("alice", "p@ss").await.unwrap();
        let bob = f.auth.register("bob", "hunter2").await.unwrap();

        // Alice unlocks and shares a host while bob is locked.
        let (_, alice_session) = unlocked_login(&f, "alice", "p@ss").await;
        let alice_ctx = ctx_for(&f, &alice.id, &alice_session.id);

        let host_id = {
            let mut tables = f.store.write().await;
            let mut host = HostRow::new(alice.id.clone(), "h1".into(), "10.0.0.1".into());
            let ctx = FieldContext {
                kind: EntityKind::Host,
                record_id: &host.id,
                field_name: "password",
                user_id: &alice.id,
            };
            host.password = Some(encrypt_field("secret", &alice_ctx.dek, &ctx).unwrap());
            let id = host.id.clone();
            tables.insert_host(host).unwrap();
            id
        };

        f.shares
            .create_grant(
                &alice.id,
                &alice_ctx.dek,
                &host_id,
                crate::db::schemas::PrincipalKind::User,
                &bob.id,
                crate::db::schemas::GrantLevel::Read,
                None,
            )
            .await
            .unwrap();

        {
            let tables = f.store.read().await;
            assert_eq!(tables.pending_shares_for(&bob.id).len(), 1);
        }

        // Bob's login consumes the pending row.
        let (_, _) = unlocked_login(&f, "bob", "hunter2").await;
        {
            let tables = f.store.read().await;
            assert!(tables.pending_shares_for(&bob.id).is_empty());
        }

        let bob_dek = f.vault.get(&bob.id).unwrap();
        let secrets = f
            .shares
            .resolve_shared_secrets(&bob.id, &bob_dek, &host_id)
            .await
            .unwrap();
        assert_eq!(secrets.get("password").map(String::as_str), Some("secret"));
    }

    #[tokio::test]
    async fn test_reset_code_flow() {
        let f = fixture();
        f.auth.register("alice", "p@ss").await.unwrap();

        let code = f.auth.begin_reset("alice").await.unwrap();
        assert!(matches!(
            f.auth.verify_reset_code("alice", "00000000"),
            Err(DrawbridgeError::AuthRejected)
        ));
        f.auth.verify_reset_code("alice", &code).unwrap();

        // Single use.
        assert!(f.auth.verify_reset_code("alice", &code).is_err());
    }

    #[tokio::test]
    async fn test_external_only_user_cannot_password_login() {
        let f = fixture();
        let subject = ExternalSubject {
            subject: "idp-9".into(),
            display_name: Some("eve".into()),
        };
        f.auth
            .login_external(&subject, DeviceClass::Browser, "sso")
            .await
            .unwrap();

        assert!(matches!(
            f.auth
                .login(login_request("eve", "anything", "198.51.100.7"))
                .await,
            Err(DrawbridgeError::AuthRejected)
        ));
    }
}
