//! External identity provider client.
//!
//! Exchanges an authorization code for the provider's subject id. Every
//! outbound call carries a bounded timeout; a provider outage degrades to
//! a login failure, never a hung request. Only the subject id and display
//! name cross this boundary; provider tokens are not retained here.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::types::{DrawbridgeError, Result};

/// Default provider call timeout (10 seconds).
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider endpoints and client credentials.
#[derive(Debug, Clone)]
pub struct ExternalIdentityConfig {
    /// Token endpoint (authorization-code exchange)
    pub token_url: String,
    /// Userinfo endpoint (subject lookup)
    pub userinfo_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub timeout: Duration,
}

impl ExternalIdentityConfig {
    pub fn is_configured(&self) -> bool {
        !self.token_url.is_empty() && !self.client_id.is_empty()
    }
}

/// What the provider proved about the caller.
#[derive(Debug, Clone)]
pub struct ExternalSubject {
    /// Foreign subject id; stable per user at the provider
    pub subject: String,
    /// Best-effort display name
    pub display_name: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct UserinfoResponse {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
}

impl UserinfoResponse {
    fn into_subject(self) -> ExternalSubject {
        ExternalSubject {
            subject: self.sub,
            display_name: self.name.or(self.preferred_username),
        }
    }
}

/// HTTP client for the configured provider.
pub struct ExternalIdentityClient {
    http: reqwest::Client,
    config: ExternalIdentityConfig,
}

impl ExternalIdentityClient {
    pub fn new(config: ExternalIdentityConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DrawbridgeError::Internal(format!("HTTP client build failed: {e}")))?;

        Ok(Self { http, config })
    }

    /// Exchange an authorization code for the provider subject.
    pub async fn resolve_subject(&self, code: &str, redirect_uri: &str) -> Result<ExternalSubject> {
        if !self.config.is_configured() {
            return Err(DrawbridgeError::Internal(
                "external identity provider is not configured".into(),
            ));
        }

        let token: TokenResponse = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| provider_error("token exchange", e))?
            .error_for_status()
            .map_err(|_| DrawbridgeError::AuthRejected)?
            .json()
            .await
            .map_err(|e| provider_error("token response", e))?;

        let userinfo: UserinfoResponse = self
            .http
            .get(&self.config.userinfo_url)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(|e| provider_error("userinfo", e))?
            .error_for_status()
            .map_err(|_| DrawbridgeError::AuthRejected)?
            .json()
            .await
            .map_err(|e| provider_error("userinfo response", e))?;

        Ok(userinfo.into_subject())
    }
}

fn provider_error(stage: &str, e: reqwest::Error) -> DrawbridgeError {
    warn!(stage, error = %e, "External identity provider call failed");
    if e.is_timeout() {
        DrawbridgeError::Internal(format!("identity provider timed out during {stage}"))
    } else {
        DrawbridgeError::Internal(format!("identity provider unreachable during {stage}"))
    }
}
