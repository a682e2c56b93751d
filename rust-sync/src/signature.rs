//! Source webhook signature verification.
//!
//! The Source signs webhook requests with HMAC-SHA256 over the canonical
//! string `timestamp || body`, using the per-site webhook secret. The hex
//! digest and the timestamp travel in separate request headers.
//!
//! Verification fails closed: a missing or malformed header, a stale
//! timestamp, or a digest mismatch all reject the request, and a rejected
//! payload is never queued.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Verify a Source webhook signature.
///
/// # Arguments
///
/// * `secret` - The site's webhook secret
/// * `raw_body` - The raw request body bytes
/// * `signature` - Hex HMAC digest from the signature header
/// * `timestamp` - Unix epoch seconds from the timestamp header
/// * `max_age` - Maximum allowed timestamp skew (prevents replay)
///
/// # Returns
///
/// `true` only if the signature matches and the timestamp is fresh.
pub fn verify(
    secret: &str,
    raw_body: &[u8],
    signature: Option<&str>,
    timestamp: Option<&str>,
    max_age: Duration,
) -> bool {
    let signature = signature.unwrap_or_default();
    let timestamp = timestamp.unwrap_or_default();

    if secret.is_empty() || signature.is_empty() || timestamp.is_empty() {
        warn!(
            has_secret = !secret.is_empty(),
            has_signature = !signature.is_empty(),
            has_timestamp = !timestamp.is_empty(),
            "signature_missing_fields"
        );
        return false;
    }

    // Reject stale timestamps (prevents replay attacks)
    let webhook_time: u64 = match timestamp.parse() {
        Ok(t) => t,
        Err(_) => {
            warn!(timestamp = %timestamp, "signature_invalid_timestamp");
            return false;
        }
    };

    let current_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let age = current_time.abs_diff(webhook_time);
    if age > max_age.as_secs() {
        warn!(
            webhook_time = webhook_time,
            current_time = current_time,
            age_seconds = age,
            max_age_seconds = max_age.as_secs(),
            "signature_stale"
        );
        return false;
    }

    let expected = match compute_digest(secret, raw_body, timestamp) {
        Some(d) => d,
        None => {
            warn!("signature_invalid_key");
            return false;
        }
    };

    let valid = constant_time_compare(&expected, signature);

    if !valid {
        warn!(
            expected_length = expected.len(),
            actual_length = signature.len(),
            "signature_mismatch"
        );
    }

    valid
}

/// Compute the signature for a payload at a given timestamp.
///
/// Used by tests and by operational tooling that drives the webhook
/// endpoint directly (resync dry-runs and replay harnesses).
pub fn compute_signature(secret: &str, raw_body: &[u8], timestamp: u64) -> String {
    compute_digest(secret, raw_body, &timestamp.to_string()).unwrap_or_default()
}

fn compute_digest(secret: &str, raw_body: &[u8], timestamp: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.as_bytes());
    mac.update(raw_body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_AGE: Duration = Duration::from_secs(300);

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    #[test]
    fn test_verify_valid_signature() {
        let secret = "site-secret";
        let body = br#"{"member":{"current":{"email":"a@x.com"}}}"#;
        let ts = now_secs();
        let sig = compute_signature(secret, body, ts);

        assert!(verify(
            secret,
            body,
            Some(&sig),
            Some(&ts.to_string()),
            MAX_AGE
        ));
    }

    #[test]
    fn test_verify_rejects_tampered_body() {
        let secret = "site-secret";
        let body = br#"{"member":{"current":{"email":"a@x.com"}}}"#;
        let ts = now_secs();
        let sig = compute_signature(secret, body, ts);

        let mut tampered = body.to_vec();
        tampered[10] ^= 0x01;

        assert!(!verify(
            secret,
            &tampered,
            Some(&sig),
            Some(&ts.to_string()),
            MAX_AGE
        ));
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let body = b"payload";
        let ts = now_secs();
        let sig = compute_signature("secret-a", body, ts);

        assert!(!verify(
            "secret-b",
            body,
            Some(&sig),
            Some(&ts.to_string()),
            MAX_AGE
        ));
    }

    #[test]
    fn test_verify_missing_fields() {
        let ts = now_secs().to_string();
        assert!(!verify("", b"body", Some("sig"), Some(&ts), MAX_AGE));
        assert!(!verify("secret", b"body", None, Some(&ts), MAX_AGE));
        assert!(!verify("secret", b"body", Some("sig"), None, MAX_AGE));
        assert!(!verify("secret", b"body", Some(""), Some(&ts), MAX_AGE));
    }

    #[test]
    fn test_verify_rejects_stale_timestamp() {
        let secret = "site-secret";
        let body = b"payload";
        // Year 2000
        let ts = 946_684_800u64;
        let sig = compute_signature(secret, body, ts);

        assert!(!verify(
            secret,
            body,
            Some(&sig),
            Some(&ts.to_string()),
            MAX_AGE
        ));
    }

    #[test]
    fn test_verify_rejects_non_numeric_timestamp() {
        assert!(!verify(
            "secret",
            b"body",
            Some("deadbeef"),
            Some("not-a-number"),
            MAX_AGE
        ));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "abcd"));
    }
}
