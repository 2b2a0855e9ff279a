//! Webhook authentication: shared-secret header or HMAC-SHA256 body signature.
//!
//! Both comparisons are constant-time so a timing side-channel can't leak
//! how many leading bytes of a guessed secret/signature matched.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compares two byte strings in constant time with respect to their
/// content (early-exits only on length, which is not considered secret).
#[must_use]
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Verifies `X-Webhook-Secret` against `secret` in constant time.
#[must_use]
pub fn verify_shared_secret(header_value: &str, secret: &str) -> bool {
    constant_time_eq(header_value.as_bytes(), secret.as_bytes())
}

/// Verifies `X-Webhook-Signature: sha256=<hex>` against an HMAC-SHA256 of
/// `body`, keyed by `secret`. Returns `false` on a malformed header as well
/// as on a mismatch — callers don't need to distinguish the two.
#[must_use]
pub fn verify_hmac_signature(header_value: &str, body: &[u8], secret: &str) -> bool {
    let Some(hex_digest) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected_bytes) = hex::decode(hex_digest) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    // `verify_slice` is itself constant-time, but we also hex-decoded
    // untrusted input above; re-check lengths defensively before handing
    // off so a panic path isn't reachable from attacker-controlled input.
    if expected_bytes.len() != 32 {
        return false;
    }
    mac.verify_slice(&expected_bytes).is_ok()
}

/// Whether a request is authenticated per spec.md §4.5: either scheme is
/// sufficient. When `secret` is `None` (not configured), every request is
/// accepted — the caller is responsible for logging a startup warning.
#[must_use]
pub fn is_authenticated(
    secret: Option<&str>,
    shared_secret_header: Option<&str>,
    signature_header: Option<&str>,
    body: &[u8],
) -> bool {
    let Some(secret) = secret else {
        return true;
    };

    if let Some(header_value) = shared_secret_header
        && verify_shared_secret(header_value, secret)
    {
        return true;
    }

    if let Some(header_value) = signature_header
        && verify_hmac_signature(header_value, body, secret)
    {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_matches() {
        assert!(verify_shared_secret("S", "S"));
    }

    #[test]
    fn shared_secret_mismatch() {
        assert!(!verify_shared_secret("WRONG", "S"));
    }

    #[test]
    fn hmac_signature_round_trip() {
        let secret = "S";
        let body = b"{\"eventType\":\"Test\"}";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let digest = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={digest}");
        assert!(verify_hmac_signature(&header, body, secret));
    }

    #[test]
    fn hmac_signature_wrong_body_fails() {
        let secret = "S";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(b"original");
        let digest = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={digest}");
        assert!(!verify_hmac_signature(&header, b"tampered", secret));
    }

    #[test]
    fn hmac_signature_missing_prefix_fails() {
        assert!(!verify_hmac_signature("deadbeef", b"body", "S"));
    }

    #[test]
    fn hmac_signature_non_hex_fails() {
        assert!(!verify_hmac_signature("sha256=not-hex", b"body", "S"));
    }

    #[test]
    fn no_secret_configured_accepts_everything() {
        assert!(is_authenticated(None, None, None, b"body"));
    }

    #[test]
    fn secret_configured_requires_one_valid_scheme() {
        assert!(!is_authenticated(Some("S"), None, None, b"body"));
        assert!(is_authenticated(Some("S"), Some("S"), None, b"body"));
        assert!(!is_authenticated(Some("S"), Some("WRONG"), None, b"body"));
    }
}
