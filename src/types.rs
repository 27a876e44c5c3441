//! Core error type and shared identifiers.
//!
//! One crate-wide error enum so service boundaries can translate low-level
//! failures into the kinds handlers are allowed to surface. Crypto failures
//! on data paths are reported as `Internal` before they leave the crate;
//! at login they collapse into `AuthRejected`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DrawbridgeError>;

/// Crate-wide error taxonomy.
#[derive(Debug, Error)]
pub enum DrawbridgeError {
    /// No bearer token / session id presented.
    #[error("authentication required")]
    AuthMissing,

    /// Token or session has expired.
    #[error("session expired")]
    AuthExpired,

    /// Token malformed, signature invalid, or session revoked.
    #[error("invalid authentication")]
    AuthInvalid,

    /// Credentials wrong (password, TOTP code, reset code). Intentionally
    /// generic so user-lookup and password mismatch are indistinguishable.
    #[error("invalid credentials")]
    AuthRejected,

    /// Too many failures for this key; retry after the advertised delay.
    #[error("rate limited, retry in {remaining_seconds}s")]
    RateLimited { remaining_seconds: u64 },

    /// Session is valid but the user's data key is not resident.
    #[error("data locked, unlock required")]
    LockedData,

    /// AEAD tag mismatch, wrap/unwrap failure, malformed ciphertext.
    #[error("cryptographic operation failed: {0}")]
    CryptoFailed(String),

    /// Entity does not exist (or is hidden from the caller).
    #[error("not found")]
    NotFound,

    /// Caller is authenticated but not permitted.
    #[error("forbidden")]
    Forbidden,

    /// Unique-constraint or state conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Anything the caller cannot act on.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DrawbridgeError {
    /// Stable machine-readable kind, used by the HTTP layer for response
    /// codes and by logs for aggregation.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DrawbridgeError::AuthMissing => ErrorKind::AuthMissing,
            DrawbridgeError::AuthExpired => ErrorKind::AuthExpired,
            DrawbridgeError::AuthInvalid => ErrorKind::AuthInvalid,
            DrawbridgeError::AuthRejected => ErrorKind::AuthRejected,
            DrawbridgeError::RateLimited { .. } => ErrorKind::RateLimited,
            DrawbridgeError::LockedData => ErrorKind::LockedData,
            DrawbridgeError::CryptoFailed(_) => ErrorKind::CryptoFailed,
            DrawbridgeError::NotFound => ErrorKind::NotFound,
            DrawbridgeError::Forbidden => ErrorKind::Forbidden,
            DrawbridgeError::Conflict(_) => ErrorKind::Conflict,
            DrawbridgeError::Internal(_) => ErrorKind::ServerError,
        }
    }

    /// Collapse into the generic login failure. Used by the auth service so
    /// wrap/unwrap failures never leak cryptographic detail to clients.
    pub fn into_auth_rejected(self) -> DrawbridgeError {
        DrawbridgeError::AuthRejected
    }

    /// Map a data-path crypto failure to the kind clients see (`server-error`).
    pub fn sanitize_data_path(self) -> DrawbridgeError {
        match self {
            DrawbridgeError::CryptoFailed(_) => {
                DrawbridgeError::Internal("record could not be read".into())
            }
            other => other,
        }
    }
}

/// Error kinds surfaced across the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    AuthMissing,
    AuthExpired,
    AuthInvalid,
    AuthRejected,
    RateLimited,
    LockedData,
    CryptoFailed,
    NotFound,
    Forbidden,
    Conflict,
    ServerError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::AuthMissing => "auth-missing",
            ErrorKind::AuthExpired => "auth-expired",
            ErrorKind::AuthInvalid => "auth-invalid",
            ErrorKind::AuthRejected => "auth-rejected",
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::LockedData => "locked-data",
            ErrorKind::CryptoFailed => "crypto-failed",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ServerError => "server-error",
        };
        write!(f, "{s}")
    }
}

/// Opaque user identifier (UUID string under the hood).
pub type UserId = String;

/// Opaque session identifier.
pub type SessionId = String;

/// Opaque host identifier.
pub type HostId = String;

/// Opaque credential identifier.
pub type CredentialId = String;
