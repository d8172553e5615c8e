//! Auth Token Identity Extraction
//!
//! The broker credential is an opaque JWT whose `sub` claim carries the
//! connection identity. The claim is read WITHOUT signature verification;
//! verifying the token is the broker's job, this side only needs the
//! embedded principal name. A missing or malformed claim is a connection
//! configuration error, never a crash.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;

use super::BrokerError;

/// Extract the connection user from the `sub` claim of an unverified JWT.
///
/// Namespaced claims such as `system:serviceaccount:user` resolve to the
/// last `:`-separated segment.
pub fn user_from_token(token: &str) -> Result<String, BrokerError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| BrokerError::Auth("token is not a JWT".to_string()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| BrokerError::Auth(format!("token payload is not base64: {}", e)))?;

    let claims: Value = serde_json::from_slice(&bytes)
        .map_err(|e| BrokerError::Auth(format!("token claims are not JSON: {}", e)))?;

    let sub = claims
        .get("sub")
        .and_then(Value::as_str)
        .ok_or_else(|| BrokerError::Auth("sub claim not found in token".to_string()))?;

    if sub.is_empty() {
        return Err(BrokerError::Auth("empty sub claim".to_string()));
    }

    let user = match sub.rsplit(':').next() {
        Some(last) if sub.contains(':') => last,
        _ => sub,
    };

    Ok(user.to_string())
}
