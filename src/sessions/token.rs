//! Bearer tokens.
//!
//! Opaque signed tokens carrying the session reference. Signed with the
//! process-wide `token-sign` key from the system key manager. Browsers get
//! the same token in a cookie (`HttpOnly`, `SameSite=Lax`, `Secure` over
//! TLS); non-browser clients send it in a header.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::db::schemas::{DeviceClass, SessionRow};
use crate::types::{DrawbridgeError, Result, SessionId, UserId};

/// Cookie name carrying the token for browser clients.
pub const TOKEN_COOKIE: &str = "drawbridge_session";

/// Claims carried by a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: UserId,

    /// Session id
    pub sid: SessionId,

    /// Device class captured at login
    pub device: DeviceClass,

    /// Present (true) while the second factor is still outstanding; a
    /// pending token opens nothing but the TOTP-verify operation
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending_totp: bool,

    /// Issued-at (unix seconds)
    pub iat: i64,

    /// Expiry (unix seconds), mirrors the session row expiry
    pub exp: i64,
}

/// Issues and verifies session bearer tokens.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenService {
    pub fn new(signing_key: &[u8; 32]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;

        Self {
            encoding: EncodingKey::from_secret(signing_key),
            decoding: DecodingKey::from_secret(signing_key),
            validation,
        }
    }

    /// Issue a token bound to a session row. `pending_totp` marks a token
    /// that only unlocks the second-factor verify step.
    pub fn issue(&self, session: &SessionRow, pending_totp: bool) -> Result<String> {
        let claims = Claims {
            sub: session.user_id.clone(),
            sid: session.id.clone(),
            device: session.device_class,
            pending_totp,
            iat: session.created_at.timestamp(),
            exp: session.expires_at.timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| DrawbridgeError::Internal(format!("token signing failed: {e}")))
    }

    /// Verify signature and expiry, returning the claims.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => DrawbridgeError::AuthExpired,
                _ => DrawbridgeError::AuthInvalid,
            })
    }
}

/// Extract the token from an `Authorization` header value.
///
/// Accepts `Bearer <token>` and the bare token form used by non-browser
/// clients.
pub fn extract_bearer(header: &str) -> Option<&str> {
    let trimmed = header.trim();
    if let Some(token) = trimmed.strip_prefix("Bearer ") {
        let token = token.trim();
        (!token.is_empty()).then_some(token)
    } else {
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

/// Build the `Set-Cookie` value for a browser client.
pub fn session_cookie(token: &str, secure: bool) -> String {
    let mut cookie = format!("{TOKEN_COOKIE}={token}; HttpOnly; SameSite=Lax; Path=/");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::DEFAULT_TTL_BROWSER_SECS;

    fn service() -> TokenService {
        TokenService::new(&[7u8; 32])
    }

    fn session() -> SessionRow {
        SessionRow::new(
            "user-1".into(),
            DeviceClass::Browser,
            "Firefox on Linux".into(),
            DEFAULT_TTL_BROWSER_SECS,
        )
    }

    #[test]
    fn test_issue_and_verify() {
        let svc = service();
        let row = session();

        let token = svc.issue(&row, false).unwrap();
        let claims = svc.verify(&token).unwrap();

        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.sid, row.id);
        assert_eq!(claims.device, DeviceClass::Browser);
        assert!(!claims.pending_totp);
    }

    #[test]
    fn test_pending_totp_bit_survives() {
        let svc = service();
        let token = svc.issue(&session(), true).unwrap();
        assert!(svc.verify(&token).unwrap().pending_totp);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let token = service().issue(&session(), false).unwrap();
        let other = TokenService::new(&[8u8; 32]);
        assert!(matches!(
            other.verify(&token),
            Err(DrawbridgeError::AuthInvalid)
        ));
    }

    #[test]
    fn test_expired_token_maps_to_auth_expired() {
        let svc = service();
        let mut row = session();
        row.expires_at = chrono::Utc::now() - chrono::Duration::seconds(60);
        let token = svc.issue(&row, false).unwrap();

        assert!(matches!(
            svc.verify(&token),
            Err(DrawbridgeError::AuthExpired)
        ));
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(matches!(
            service().verify("not-a-token"),
            Err(DrawbridgeError::AuthInvalid)
        ));
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("abc123"), Some("abc123"));
        assert_eq!(extract_bearer("Bearer "), None);
        assert_eq!(extract_bearer(""), None);
    }

    #[test]
    fn test_session_cookie_attributes() {
        let plain = session_cookie("tok", false);
        assert!(plain.contains("HttpOnly"));
        assert!(plain.contains("SameSite=Lax"));
        assert!(!plain.contains("Secure"));

        let secure = session_cookie("tok", true);
        assert!(secure.ends_with("; Secure"));
    }
}
