//! Gateway webhook signature verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a Stripe signature timestamp, in seconds.
pub const STRIPE_TOLERANCE_SECS: i64 = 300;

fn hmac_hex(secret: &str, data: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(data);
    Some(hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_eq(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Razorpay signs the raw body: `hex(hmac_sha256(secret, body))`.
pub fn verify_razorpay(secret: &str, body: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    match hmac_hex(secret, body) {
        Some(expected) => constant_time_eq(&expected, signature.trim()),
        None => false,
    }
}

/// Verifies a `t=<unix>,v1=<hex>` header over `"<t>.<body>"`.
///
/// Any `v1` entry may match; the timestamp must be within
/// [`STRIPE_TOLERANCE_SECS`] of `now`.
pub fn verify_stripe(secret: &str, body: &[u8], header: &str, now: i64) -> bool {
    if secret.is_empty() {
        return false;
    }
    let mut timestamp: Option<i64> = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }
    let Some(timestamp) = timestamp else {
        return false;
    };
    if (now - timestamp).abs() > STRIPE_TOLERANCE_SECS {
        return false;
    }

    let mut signed = format!("{timestamp}.").into_bytes();
    signed.extend_from_slice(body);
    let Some(expected) = hmac_hex(secret, &signed) else {
        return false;
    };
    candidates
        .iter()
        .any(|candidate| constant_time_eq(&expected, candidate))
}

/// Builds a Razorpay-style signature. Used by clients and tests.
pub fn sign_razorpay(secret: &str, body: &[u8]) -> String {
    hmac_hex(secret, body).unwrap_or_default()
}

/// Builds a Stripe-style signature header for `timestamp`.
pub fn sign_stripe(secret: &str, body: &[u8], timestamp: i64) -> String {
    let mut signed = format!("{timestamp}.").into_bytes();
    signed.extend_from_slice(body);
    format!("t={},v1={}", timestamp, hmac_hex(secret, &signed).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"id":"evt_1","event":"payment.captured"}"#;

    #[test]
    fn test_razorpay_signature_valid() {
        let signature = sign_razorpay("rzp_secret", BODY);
        assert_eq!(signature.len(), 64, "hex sha256 should be 64 chars");
        assert!(verify_razorpay("rzp_secret", BODY, &signature));
    }

    #[test]
    fn test_razorpay_wrong_secret() {
        let signature = sign_razorpay("rzp_secret", BODY);
        assert!(!verify_razorpay("other", BODY, &signature));
    }

    #[test]
    fn test_razorpay_tampered_body() {
        let signature = sign_razorpay("rzp_secret", BODY);
        assert!(!verify_razorpay("rzp_secret", b"{}", &signature));
    }

    #[test]
    fn test_razorpay_empty_secret_rejects() {
        let signature = sign_razorpay("", BODY);
        assert!(!verify_razorpay("", BODY, &signature));
    }

    #[test]
    fn test_stripe_signature_valid() {
        let header = sign_stripe("whsec", BODY, 1_760_000_000);
        assert!(header.starts_with("t=1760000000,v1="));
        assert!(verify_stripe("whsec", BODY, &header, 1_760_000_100));
    }

    #[test]
    fn test_stripe_outside_tolerance() {
        let header = sign_stripe("whsec", BODY, 1_760_000_000);
        assert!(!verify_stripe("whsec", BODY, &header, 1_760_000_301));
    }

    #[test]
    fn test_stripe_accepts_any_v1_entry() {
        let valid = sign_stripe("whsec", BODY, 1_760_000_000);
        let v1 = valid.split_once("v1=").map(|(_, sig)| sig).unwrap();
        let header = format!("t=1760000000,v1=deadbeef,v1={v1}");
        assert!(verify_stripe("whsec", BODY, &header, 1_760_000_000));
    }

    #[test]
    fn test_stripe_malformed_header() {
        assert!(!verify_stripe("whsec", BODY, "garbage", 1_760_000_000));
        assert!(!verify_stripe("whsec", BODY, "t=abc,v1=00", 1_760_000_000));
        assert!(!verify_stripe("whsec", BODY, "v1=00", 1_760_000_000));
    }
}
