//! Application wiring.
//!
//! Builds every service in dependency order (system keys → vault →
//! sessions → auth), spawns the background maintenance tasks, and exposes
//! the service handles the transport layer calls. There are no process
//! globals; everything is owned here and torn down here.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::access::{AccessGate, PermissionResolver};
use crate::admin::AdminService;
use crate::authn::{AuthConfig, AuthService, ExternalIdentityClient, RateLimiters};
use crate::config::Args;
use crate::db::{HotStore, SaveCoordinator};
use crate::keys::{DekVault, SystemKeys};
use crate::records::RecordService;
use crate::sessions::{SessionService, TokenService};
use crate::shares::ShareManager;
use crate::types::{DrawbridgeError, Result};

/// How often the maintenance loop runs.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// The constructed application.
pub struct App {
    pub args: Args,
    pub store: Arc<HotStore>,
    pub system: Arc<SystemKeys>,
    pub vault: Arc<DekVault>,
    pub sessions: Arc<SessionService>,
    pub tokens: Arc<TokenService>,
    pub limiters: Arc<RateLimiters>,
    pub saver: Arc<SaveCoordinator>,
    pub shares: Arc<ShareManager>,
    pub resolver: Arc<PermissionResolver>,
    pub auth: Arc<AuthService>,
    pub gate: Arc<AccessGate>,
    pub records: Arc<RecordService>,
    pub admin: Arc<AdminService>,
    /// External identity client; absent when no provider is configured.
    pub external: Option<Arc<ExternalIdentityClient>>,
    background: Vec<JoinHandle<()>>,
}

impl App {
    /// Construct and start everything. Init order is load-bearing: the
    /// system key manager first (the token signing key comes from it),
    /// then the vault, the session layer, and finally the auth machine.
    pub async fn boot(args: Args) -> Result<App> {
        args.validate().map_err(DrawbridgeError::Internal)?;

        // C4: machine-local root and derived sub-keys.
        let system = Arc::new(SystemKeys::load_or_create(
            &args.data_dir.join("system.key"),
            args.internal_token_bytes,
        )?);

        let store = Arc::new(HotStore::open(&args.data_dir).await?);
        let saver = Arc::new(SaveCoordinator::spawn(
            store.clone(),
            args.save_quiet(),
            args.save_max_delay(),
        ));

        // C2: the resident-key vault.
        let vault = Arc::new(DekVault::new(args.dek_idle_evict()));

        // C5: sessions and tokens.
        let sessions = Arc::new(SessionService::new(store.clone(), args.session_config()));
        let tokens = Arc::new(TokenService::new(system.token_sign()));

        // C6 and the services around it.
        let limiters = Arc::new(RateLimiters::new(args.rate_limit_policy()));
        let shares = Arc::new(ShareManager::new(
            store.clone(),
            vault.clone(),
            system.clone(),
        ));
        let resolver = Arc::new(PermissionResolver::new(store.clone()));
        let auth = Arc::new(AuthService::new(
            store.clone(),
            vault.clone(),
            sessions.clone(),
            tokens.clone(),
            system.clone(),
            limiters.clone(),
            shares.clone(),
            saver.clone(),
            AuthConfig {
                kdf_params: args.kdf_params(),
            },
        ));
        let gate = Arc::new(AccessGate::new(
            store.clone(),
            vault.clone(),
            sessions.clone(),
            tokens.clone(),
        ));
        let records = Arc::new(RecordService::new(
            store.clone(),
            vault.clone(),
            system.clone(),
            resolver.clone(),
            shares.clone(),
            saver.clone(),
        ));
        let admin = Arc::new(AdminService::new(
            store.clone(),
            vault.clone(),
            sessions.clone(),
            saver.clone(),
        ));

        let external_config = args.external_identity_config();
        let external = if external_config.is_configured() {
            Some(Arc::new(ExternalIdentityClient::new(external_config)?))
        } else {
            None
        };

        let background = vec![spawn_maintenance(
            vault.clone(),
            sessions.clone(),
            limiters.clone(),
        )];

        info!(data_dir = %args.data_dir.display(), "Drawbridge core booted");

        Ok(App {
            args,
            store,
            system,
            vault,
            sessions,
            tokens,
            limiters,
            saver,
            shares,
            resolver,
            auth,
            gate,
            records,
            admin,
            external,
            background,
        })
    }

    /// Stop background tasks and flush the store one last time.
    pub async fn shutdown(&self) {
        for handle in &self.background {
            handle.abort();
        }
        if let Err(e) = self.store.flush().await {
            warn!(error = %e, "Final snapshot flush failed on shutdown");
        }
        info!("Drawbridge core shut down");
    }
}

/// Periodic maintenance: the vault idle watchdog (eviction cancels the
/// unlocked bit on the user's sessions), the session sweeper, and
/// rate-limiter pruning.
fn spawn_maintenance(
    vault: Arc<DekVault>,
    sessions: Arc<SessionService>,
    limiters: Arc<RateLimiters>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(MAINTENANCE_INTERVAL).await;

            for user_id in vault.sweep_idle() {
                sessions.lock_all(&user_id);
            }
            sessions.sweep().await;
            limiters.prune();
        }
    })
}
