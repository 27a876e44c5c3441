//! Configuration for Drawbridge
//!
//! CLI arguments and environment variable handling using clap. The
//! embedding server parses these and hands them to [`crate::App::boot`].

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::authn::{ExternalIdentityConfig, RateLimitPolicy};
use crate::keys::KdfParams;
use crate::sessions::SessionConfig;

/// Drawbridge - credential-security core for an SSH management platform
#[derive(Parser, Debug, Clone)]
#[command(name = "drawbridge")]
#[command(about = "Credential-security core: key hierarchy, sessions, shared credentials")]
pub struct Args {
    /// Directory for the hot-store snapshot and the system key file
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Argon2id memory cost for new KEK salts, in KiB
    #[arg(long, env = "KDF_MEMORY_KIB", default_value = "65536")]
    pub kdf_memory_kib: u32,

    /// Argon2id iteration count for new KEK salts
    #[arg(long, env = "KDF_ITERATIONS", default_value = "3")]
    pub kdf_iterations: u32,

    /// Argon2id parallelism for new KEK salts
    #[arg(long, env = "KDF_PARALLELISM", default_value = "4")]
    pub kdf_parallelism: u32,

    /// Browser session lifetime in seconds (default 7 days)
    #[arg(long, env = "SESSION_TTL_BROWSER", default_value = "604800")]
    pub session_ttl_browser: i64,

    /// Desktop/mobile session lifetime in seconds (default 30 days)
    #[arg(long, env = "SESSION_TTL_DEVICE", default_value = "2592000")]
    pub session_ttl_device: i64,

    /// Soft cap on live sessions per user
    #[arg(long, env = "SESSION_MAX_PER_USER", default_value = "50")]
    pub session_max_per_user: usize,

    /// Idle window before a resident data key is evicted, in seconds
    #[arg(long, env = "DEK_IDLE_EVICT_SECONDS", default_value = "1800")]
    pub dek_idle_evict_seconds: u64,

    /// Rate-limit failure window in seconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_SECONDS", default_value = "600")]
    pub rate_limit_window_seconds: u64,

    /// Failures inside the window before lockout
    #[arg(long, env = "RATE_LIMIT_MAX_FAILURES", default_value = "5")]
    pub rate_limit_max_failures: u32,

    /// Lockout duration in seconds
    #[arg(long, env = "RATE_LIMIT_LOCK_SECONDS", default_value = "900")]
    pub rate_limit_lock_seconds: u64,

    /// Save coordinator quiet window in milliseconds
    #[arg(long, env = "SAVE_QUIET_MS", default_value = "500")]
    pub save_quiet_ms: u64,

    /// Save coordinator hard ceiling in milliseconds
    #[arg(long, env = "SAVE_MAX_DELAY_MS", default_value = "5000")]
    pub save_max_delay_ms: u64,

    /// External identity provider token endpoint
    #[arg(long, env = "EXTERNAL_IDENTITY_TOKEN_URL", default_value = "")]
    pub external_identity_token_url: String,

    /// External identity provider userinfo endpoint
    #[arg(long, env = "EXTERNAL_IDENTITY_USERINFO_URL", default_value = "")]
    pub external_identity_userinfo_url: String,

    /// External identity client id
    #[arg(long, env = "EXTERNAL_IDENTITY_CLIENT_ID", default_value = "")]
    pub external_identity_client_id: String,

    /// External identity client secret
    #[arg(long, env = "EXTERNAL_IDENTITY_CLIENT_SECRET", default_value = "")]
    pub external_identity_client_secret: String,

    /// Timeout for external identity provider calls, in seconds
    #[arg(long, env = "EXTERNAL_IDENTITY_TIMEOUT_SECONDS", default_value = "10")]
    pub external_identity_timeout_seconds: u64,

    /// Length of the internal loopback RPC token, in bytes
    #[arg(long, env = "INTERNAL_TOKEN_BYTES", default_value = "32")]
    pub internal_token_bytes: usize,
}

impl Args {
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            memory_kib: self.kdf_memory_kib,
            iterations: self.kdf_iterations,
            parallelism: self.kdf_parallelism,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ttl_browser_secs: self.session_ttl_browser,
            ttl_device_secs: self.session_ttl_device,
            max_sessions_per_user: self.session_max_per_user,
        }
    }

    pub fn rate_limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            window: Duration::from_secs(self.rate_limit_window_seconds),
            max_failures: self.rate_limit_max_failures,
            lock: Duration::from_secs(self.rate_limit_lock_seconds),
        }
    }

    pub fn external_identity_config(&self) -> ExternalIdentityConfig {
        ExternalIdentityConfig {
            token_url: self.external_identity_token_url.clone(),
            userinfo_url: self.external_identity_userinfo_url.clone(),
            client_id: self.external_identity_client_id.clone(),
            client_secret: self.external_identity_client_secret.clone(),
            timeout: Duration::from_secs(self.external_identity_timeout_seconds),
        }
    }

    pub fn dek_idle_evict(&self) -> Duration {
        Duration::from_secs(self.dek_idle_evict_seconds)
    }

    pub fn save_quiet(&self) -> Duration {
        Duration::from_millis(self.save_quiet_ms)
    }

    pub fn save_max_delay(&self) -> Duration {
        Duration::from_millis(self.save_max_delay_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.kdf_memory_kib < 8 {
            return Err("KDF_MEMORY_KIB must be at least 8".to_string());
        }
        if self.kdf_iterations == 0 || self.kdf_parallelism == 0 {
            return Err("KDF_ITERATIONS and KDF_PARALLELISM must be positive".to_string());
        }
        if self.session_ttl_browser <= 0 || self.session_ttl_device <= 0 {
            return Err("session TTLs must be positive".to_string());
        }
        if self.save_quiet_ms > self.save_max_delay_ms {
            return Err("SAVE_QUIET_MS must not exceed SAVE_MAX_DELAY_MS".to_string());
        }
        if self.internal_token_bytes < 16 {
            return Err("INTERNAL_TOKEN_BYTES must be at least 16".to_string());
        }
        Ok(())
    }
}
