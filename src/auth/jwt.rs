//! Minimal JWT inspection: the bridge never verifies signatures, it only
//! needs the `exp` claim of the identity token to schedule refreshes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Decode the `exp` claim of a JWT-shaped token.
///
/// Returns 0 for anything that is not a three-part token with a
/// base64url-encoded JSON payload carrying a numeric `exp`. Never panics;
/// a 0 expiry marks the credential as unusable for authentication.
pub fn expiry_unix(token: &str) -> i64 {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_)) => payload,
        _ => return 0,
    };
    // Tokens in the wild occasionally arrive padded; the engine rejects '='.
    let raw = match URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) {
        Ok(raw) => raw,
        Err(_) => return 0,
    };
    let claims: serde_json::Value = match serde_json::from_slice(&raw) {
        Ok(v) => v,
        Err(_) => return 0,
    };
    claims.get("exp").and_then(serde_json::Value::as_i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with_payload(payload: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.as_bytes());
        format!("{header}.{body}.signature")
    }

    #[test]
    fn numeric_exp_decodes_exactly() {
        let token = token_with_payload(r#"{"sub":"gcid","exp":1767225600}"#);
        assert_eq!(expiry_unix(&token), 1_767_225_600);
    }

    #[test]
    fn padded_payload_decodes() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let mut body = URL_SAFE_NO_PAD.encode(br#"{"exp":42}"#);
        while body.len() % 4 != 0 {
            body.push('=');
        }
        assert_eq!(expiry_unix(&format!("{header}.{body}.sig")), 42);
    }

    #[test]
    fn missing_exp_yields_zero() {
        let token = token_with_payload(r#"{"sub":"gcid"}"#);
        assert_eq!(expiry_unix(&token), 0);
    }

    #[test]
    fn non_numeric_exp_yields_zero() {
        let token = token_with_payload(r#"{"exp":"soon"}"#);
        assert_eq!(expiry_unix(&token), 0);
    }

    #[test]
    fn malformed_tokens_yield_zero() {
        assert_eq!(expiry_unix(""), 0);
        assert_eq!(expiry_unix("only-one-part"), 0);
        assert_eq!(expiry_unix("two.parts"), 0);
        assert_eq!(expiry_unix("a.!!not-base64!!.c"), 0);
        let header = URL_SAFE_NO_PAD.encode(b"{}");
        let body = URL_SAFE_NO_PAD.encode(b"not json at all");
        assert_eq!(expiry_unix(&format!("{header}.{body}.sig")), 0);
    }

    #[test]
    fn truncated_payload_yields_zero() {
        let token = token_with_payload(r#"{"exp":1767225600}"#);
        let truncated: String = token.chars().take(token.len() - 20).collect();
        assert_eq!(expiry_unix(&truncated), 0);
    }
}
