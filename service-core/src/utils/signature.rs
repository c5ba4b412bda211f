//! Webhook authenticity helpers.
//!
//! Payment processors sign callback bodies with a shared secret. All
//! comparisons are constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha512;
use subtle::ConstantTimeEq;

type HmacSha512 = Hmac<Sha512>;

/// Hex-encoded HMAC-SHA512 of `body`.
pub fn hmac_sha512_hex(secret: &str, body: &[u8]) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a hex HMAC-SHA512 signature over a raw webhook body.
pub fn verify_hmac_sha512(
    secret: &str,
    body: &[u8],
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected = hmac_sha512_hex(secret, body)?;
    Ok(constant_time_eq(
        &expected,
        signature.trim().to_ascii_lowercase().as_str(),
    ))
}

/// Constant-time string equality. Length mismatch short-circuits to false.
pub fn constant_time_eq(expected: &str, provided: &str) -> bool {
    let expected_bytes = expected.as_bytes();
    let provided_bytes = provided.as_bytes();

    if expected_bytes.len() != provided_bytes.len() {
        return false;
    }

    expected_bytes.ct_eq(provided_bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha512_signature_round_trip() {
        let secret = "sk_test_secret";
        let body = br#"{"event":"charge.success","data":{"reference":"abc"}}"#;

        let signature = hmac_sha512_hex(secret, body).unwrap();
        assert_eq!(signature.len(), 128);
        assert!(verify_hmac_sha512(secret, body, &signature).unwrap());
        assert!(verify_hmac_sha512(secret, body, &signature.to_uppercase()).unwrap());
    }

    #[test]
    fn test_tampered_body() {
        let secret = "sk_test_secret";
        let signature = hmac_sha512_hex(secret, br#"{"amount":100}"#).unwrap();

        assert!(!verify_hmac_sha512(secret, br#"{"amount":999}"#, &signature).unwrap());
    }

    #[test]
    fn test_wrong_secret() {
        let body = br#"{"amount":100}"#;
        let signature = hmac_sha512_hex("secret-a", body).unwrap();

        assert!(!verify_hmac_sha512("secret-b", body, &signature).unwrap());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("token-123", "token-123"));
        assert!(!constant_time_eq("token-123", "token-124"));
        assert!(!constant_time_eq("token-123", "token"));
    }
}
