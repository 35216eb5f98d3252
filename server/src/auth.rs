//! Connection authentication: origin allow-list, optional bearer token and
//! optional per-session signed token (HMAC-SHA256 over `header.payload`).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("origin not allowed")]
    OriginNotAllowed,

    #[error("bearer token mismatch")]
    BadBearer,

    #[error("malformed session token")]
    MalformedToken,

    #[error("bad session token signature")]
    BadSignature,

    #[error("session token expired")]
    Expired,

    #[error("session token sid mismatch")]
    SidMismatch,
}

/// Empty allow-list admits any origin; otherwise exact match.
pub fn check_origin(origin: Option<&str>, allowed: &[String]) -> Result<(), AuthError> {
    if allowed.is_empty() {
        return Ok(());
    }
    match origin {
        Some(origin) if allowed.iter().any(|a| a == origin) => Ok(()),
        _ => Err(AuthError::OriginNotAllowed),
    }
}

/// Constant-shape bearer comparison; `expected = None` disables the check.
pub fn check_bearer(presented: Option<&str>, expected: Option<&str>) -> Result<(), AuthError> {
    match expected {
        None => Ok(()),
        Some(expected) if presented == Some(expected) => Ok(()),
        Some(_) => Err(AuthError::BadBearer),
    }
}

#[derive(Deserialize)]
struct TokenClaims {
    exp: i64,
    sid: String,
}

/// Verify a `header.payload.signature` session token: HMAC-SHA256 over
/// `header.payload`, base64url segments, `exp` and `sid` claims required.
pub fn verify_session_token(
    token: &str,
    secret: &str,
    session_id: &str,
    now_unix: i64,
) -> Result<(), AuthError> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::MalformedToken);
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::MalformedToken)?;
    mac.update(header.as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    let expected = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    if expected != signature {
        return Err(AuthError::BadSignature);
    }

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload.as_bytes())
        .map_err(|_| AuthError::MalformedToken)?;
    let claims: TokenClaims =
        serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::MalformedToken)?;

    if claims.exp <= now_unix {
        return Err(AuthError::Expired);
    }
    if claims.sid != session_id {
        return Err(AuthError::SidMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sign(secret: &str, payload: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{header}.{payload}").as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{header}.{payload}.{signature}")
    }

    #[test]
    fn origin_allow_list() {
        let allowed = vec!["https://app.example.com".to_string()];
        assert_eq!(check_origin(Some("https://app.example.com"), &allowed), Ok(()));
        assert_eq!(
            check_origin(Some("https://evil.example.com"), &allowed),
            Err(AuthError::OriginNotAllowed)
        );
        assert_eq!(check_origin(None, &allowed), Err(AuthError::OriginNotAllowed));
        assert_eq!(check_origin(None, &[]), Ok(()));
    }

    #[test]
    fn bearer_check() {
        assert_eq!(check_bearer(None, None), Ok(()));
        assert_eq!(check_bearer(Some("tok"), Some("tok")), Ok(()));
        assert_eq!(check_bearer(Some("bad"), Some("tok")), Err(AuthError::BadBearer));
        assert_eq!(check_bearer(None, Some("tok")), Err(AuthError::BadBearer));
    }

    #[test]
    fn valid_token_passes() {
        let token = sign("secret", &json!({"exp": 2_000_000_000i64, "sid": "sess-1"}));
        assert_eq!(verify_session_token(&token, "secret", "sess-1", 1_700_000_000), Ok(()));
    }

    #[test]
    fn expired_token_fails() {
        let token = sign("secret", &json!({"exp": 100, "sid": "sess-1"}));
        assert_eq!(
            verify_session_token(&token, "secret", "sess-1", 1_700_000_000),
            Err(AuthError::Expired)
        );
    }

    #[test]
    fn wrong_sid_fails() {
        let token = sign("secret", &json!({"exp": 2_000_000_000i64, "sid": "other"}));
        assert_eq!(
            verify_session_token(&token, "secret", "sess-1", 1_700_000_000),
            Err(AuthError::SidMismatch)
        );
    }

    #[test]
    fn tampered_signature_fails() {
        let token = sign("wrong-secret", &json!({"exp": 2_000_000_000i64, "sid": "sess-1"}));
        assert_eq!(
            verify_session_token(&token, "secret", "sess-1", 1_700_000_000),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn missing_claims_fail() {
        let token = sign("secret", &json!({"exp": 2_000_000_000i64}));
        assert_eq!(
            verify_session_token(&token, "secret", "sess-1", 1_700_000_000),
            Err(AuthError::MalformedToken)
        );
        assert_eq!(
            verify_session_token("nonsense", "secret", "sess-1", 0),
            Err(AuthError::MalformedToken)
        );
    }
}
